//! `PUT .../storage/{collection}/{bso}` (spec.md §4.1).

use actix_web::{dev::Payload, Error, FromRequest, HttpRequest};
use futures::future::{FutureExt, LocalBoxFuture};
use syncstore_common::Metrics;
use syncstore_db_common::UserIdentifier;

use super::{
    bso_body::BsoBody, bso_param::BsoParam, bso_query_params::BsoQueryParams,
    collection_param::CollectionParam, constants::KNOWN_BAD_PAYLOAD_REGEX,
    metrics::metrics_from_state,
};
use crate::error::{ApiError, ApiErrorKind, ErrorCode};
use crate::web::error::{RequestErrorLocation, ValidationError};

#[derive(Clone, Debug)]
pub struct BsoPutRequest {
    pub collection: String,
    pub user_id: UserIdentifier,
    pub query: BsoQueryParams,
    pub bso: String,
    pub body: BsoBody,
    pub metrics: Metrics,
}

impl FromRequest for BsoPutRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let user_id_fut = UserIdentifier::from_request(&req, payload);
        let collection_fut = CollectionParam::from_request(&req, payload);
        let query_fut = BsoQueryParams::from_request(&req, payload);
        let bso_fut = BsoParam::from_request(&req, payload);
        let body_fut = BsoBody::from_request(&req, payload);
        let metrics = metrics_from_state(&req);

        async move {
            let user_id = user_id_fut.await?;
            let collection = collection_fut.await?;
            let query = query_fut.await?;
            let bso = bso_fut.await?;
            let body = body_fut.await?;

            if collection.collection == "crypto" {
                if let Some(ref payload) = body.payload {
                    if KNOWN_BAD_PAYLOAD_REGEX.is_match(payload) {
                        return Err(ApiError::from(ApiErrorKind::Validation(
                            ValidationError::from_details(
                                "Known-bad BSO payload".to_owned(),
                                ErrorCode::InvalidBso,
                                RequestErrorLocation::Body,
                                Some("payload".to_owned()),
                            ),
                        ))
                        .into());
                    }
                }
            }

            Ok(BsoPutRequest {
                collection: collection.collection,
                user_id,
                query,
                bso: bso.bso,
                body,
                metrics,
            })
        }
        .boxed_local()
    }
}
