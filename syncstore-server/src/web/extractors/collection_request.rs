//! `GET .../storage/{collection}` / `DELETE .../storage/{collection}` (spec.md §4.1/§6).

use actix_web::{dev::Payload, Error, FromRequest, HttpRequest};
use futures::future::{FutureExt, LocalBoxFuture};
use syncstore_common::Metrics;
use syncstore_db_common::UserIdentifier;
use validator::Validate;

use super::{
    bso_query_params::BsoQueryParams, collection_param::CollectionParam, metrics::metrics_from_state,
    utils::get_accepted,
};
use crate::error::{ApiError, ApiErrorKind, ErrorCode};
use crate::web::error::{RequestErrorLocation, ValidationError};

/// The negotiated response shape for a list of BSOs (spec.md §6's content-negotiation rule).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyFormat {
    Json,
    Newlines,
}

#[derive(Clone, Debug)]
pub struct CollectionRequest {
    pub collection: String,
    pub user_id: UserIdentifier,
    pub query: BsoQueryParams,
    pub reply: ReplyFormat,
    pub metrics: Metrics,
}

impl FromRequest for CollectionRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let user_id_fut = UserIdentifier::from_request(&req, payload);
        let collection_fut = CollectionParam::from_request(&req, payload);
        let query_fut = BsoQueryParams::from_request(&req, payload);
        let metrics = metrics_from_state(&req);

        async move {
            let user_id = user_id_fut.await?;
            let collection = collection_fut.await?;
            let query = query_fut.await?;
            query.validate().map_err(|e| {
                ApiError::from(ApiErrorKind::Validation(ValidationError::from_validation_errors(
                    e,
                    ErrorCode::InvalidId,
                    RequestErrorLocation::QueryString,
                )))
            })?;
            let reply = if get_accepted(&req, &["application/newlines"], "application/json")
                == "application/newlines"
            {
                ReplyFormat::Newlines
            } else {
                ReplyFormat::Json
            };

            Ok(CollectionRequest {
                collection: collection.collection,
                user_id,
                query,
                reply,
                metrics,
            })
        }
        .boxed_local()
    }
}
