//! Lets the bigger extractors (`MetaRequest`, `CollectionRequest`, ...) emit a per-route request
//! counter without each one repeating the `Metrics::from` + header-label boilerplate.

use syncstore_common::Metrics;

pub trait EmitApiMetric {
    fn emit_api_metric(&self, label: &str);
}

macro_rules! impl_emit_api_metric {
    ($type:ty) => {
        impl EmitApiMetric for $type {
            fn emit_api_metric(&self, label: &str) {
                self.metrics.incr(label);
            }
        }
    };
}

use super::{
    bso_put_request::BsoPutRequest, bso_request::BsoRequest,
    collection_post_request::CollectionPostRequest, collection_request::CollectionRequest,
    meta_request::MetaRequest,
};

impl_emit_api_metric!(MetaRequest);
impl_emit_api_metric!(CollectionRequest);
impl_emit_api_metric!(CollectionPostRequest);
impl_emit_api_metric!(BsoRequest);
impl_emit_api_metric!(BsoPutRequest);

/// Pulls the `Metrics` handle out of `ServerState`, the way every extractor below needs to.
pub(crate) fn metrics_from_state(req: &actix_web::HttpRequest) -> Metrics {
    use actix_web::web::Data;

    use crate::server::ServerState;

    req.app_data::<Data<ServerState>>()
        .map(|state| Metrics::from(&state.metrics))
        .unwrap_or_else(Metrics::noop)
}
