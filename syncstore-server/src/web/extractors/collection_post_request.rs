//! `POST .../storage/{collection}` (spec.md §4.1, plus the batch-upload supplement).

use actix_web::{dev::Payload, Error, FromRequest, HttpRequest};
use futures::future::{FutureExt, LocalBoxFuture};
use syncstore_common::Metrics;
use syncstore_db_common::UserIdentifier;

use super::{
    batch_request::{BatchRequest, BatchRequestOpt},
    bso_bodies::BsoBodies,
    bso_query_params::BsoQueryParams,
    collection_param::CollectionParam,
    constants::KNOWN_BAD_PAYLOAD_REGEX,
    metrics::metrics_from_state,
};
use crate::server::ServerState;

#[derive(Clone, Debug)]
pub struct CollectionPostRequest {
    pub collection: String,
    pub user_id: UserIdentifier,
    pub query: BsoQueryParams,
    pub bsos: BsoBodies,
    pub batch: Option<BatchRequest>,
    pub metrics: Metrics,
    pub quota_enabled: bool,
}

impl FromRequest for CollectionPostRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let user_id_fut = UserIdentifier::from_request(&req, payload);
        let collection_fut = CollectionParam::from_request(&req, payload);
        let query_fut = BsoQueryParams::from_request(&req, payload);
        let bsos_fut = BsoBodies::from_request(&req, payload);
        let batch_fut = BatchRequestOpt::from_request(&req, payload);
        let metrics = metrics_from_state(&req);
        let (quota_enabled, max_post_records) = req
            .app_data::<actix_web::web::Data<ServerState>>()
            .map(|state| (state.quota.enabled, state.limits.max_post_records as usize))
            .unwrap_or((false, usize::MAX));

        async move {
            let user_id = user_id_fut.await?;
            let collection = collection_fut.await?;
            let query = query_fut.await?;
            let mut bsos = bsos_fut.await?;
            let batch = batch_fut.await?.opt;

            if collection.collection == "crypto" {
                let mut rejected = Vec::new();
                for (idx, bso) in bsos.valid.iter().enumerate() {
                    if let Some(payload) = &bso.payload {
                        if KNOWN_BAD_PAYLOAD_REGEX.is_match(payload) {
                            rejected.push(idx);
                        }
                    }
                }
                for idx in rejected.into_iter().rev() {
                    let bad = bsos.valid.remove(idx);
                    bsos.invalid.insert(bad.id, "invalid payload".to_owned());
                }
            }

            if bsos.valid.len() > max_post_records {
                let overflow = bsos.valid.split_off(max_post_records);
                for bso in overflow {
                    bsos.invalid.insert(bso.id, "retry bso".to_owned());
                }
            }

            Ok(CollectionPostRequest {
                collection: collection.collection,
                user_id,
                query,
                bsos,
                batch,
                metrics,
                quota_enabled,
            })
        }
        .boxed_local()
    }
}
