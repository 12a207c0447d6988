//! `/__heartbeat__` (spec.md §6's operational surface): needs a db connection and the quota
//! setting, nothing user-scoped.

use actix_web::{dev::Payload, web::Data, Error, FromRequest, HttpRequest};
use futures::future::{self, Ready};
use syncstore_mysql::DbError;
use syncstore_settings::Quota;

use crate::{error::ApiErrorKind, server::ServerState};

#[derive(Clone)]
pub struct HeartbeatRequest {
    pub db_pool: Box<dyn syncstore_db_common::DbPool<Error = DbError>>,
    pub quota: Quota,
}

impl FromRequest for HeartbeatRequest {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let state = req.app_data::<Data<ServerState>>().cloned();
        future::ready(match state {
            Some(state) => Ok(HeartbeatRequest {
                db_pool: state.db_pool.clone(),
                quota: state.quota,
            }),
            None => Err(ApiErrorKind::NoServerState.into()),
        })
    }
}
