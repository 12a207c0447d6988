//! `GET`/`DELETE .../storage/{collection}/{bso}` (spec.md §4.1/§6).

use actix_web::{dev::Payload, Error, FromRequest, HttpRequest};
use futures::future::{FutureExt, LocalBoxFuture};
use syncstore_common::Metrics;
use syncstore_db_common::UserIdentifier;

use super::{
    bso_param::BsoParam, bso_query_params::BsoQueryParams, collection_param::CollectionParam,
    metrics::metrics_from_state,
};

#[derive(Clone, Debug)]
pub struct BsoRequest {
    pub collection: String,
    pub user_id: UserIdentifier,
    pub query: BsoQueryParams,
    pub bso: String,
    pub metrics: Metrics,
}

impl FromRequest for BsoRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let user_id_fut = UserIdentifier::from_request(&req, payload);
        let collection_fut = CollectionParam::from_request(&req, payload);
        let query_fut = BsoQueryParams::from_request(&req, payload);
        let bso_fut = BsoParam::from_request(&req, payload);
        let metrics = metrics_from_state(&req);

        async move {
            let user_id = user_id_fut.await?;
            let collection = collection_fut.await?;
            let query = query_fut.await?;
            let bso = bso_fut.await?;

            Ok(BsoRequest {
                collection: collection.collection,
                user_id,
                query,
                bso: bso.bso,
                metrics,
            })
        }
        .boxed_local()
    }
}
