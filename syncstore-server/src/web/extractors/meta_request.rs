//! `info/*` routes (spec.md §6): no collection/bso path segment beyond the user id.

use actix_web::{dev::Payload, Error, FromRequest, HttpRequest};
use futures::future::{FutureExt, LocalBoxFuture};
use syncstore_common::Metrics;
use syncstore_db_common::UserIdentifier;

use super::metrics::metrics_from_state;

#[derive(Clone, Debug)]
pub struct MetaRequest {
    pub user_id: UserIdentifier,
    pub metrics: Metrics,
}

impl FromRequest for MetaRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let fut = UserIdentifier::from_request(&req, payload);
        let metrics = metrics_from_state(&req);
        async move {
            let user_id = fut.await?;
            Ok(MetaRequest { user_id, metrics })
        }
        .boxed_local()
    }
}
