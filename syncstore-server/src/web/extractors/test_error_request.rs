//! `/__error__` (spec.md §6's operational surface): a route that exists purely to exercise the
//! error-reporting path end to end, so it needs nothing but a metrics handle.

use actix_web::{dev::Payload, Error, FromRequest, HttpRequest};
use futures::future::{self, Ready};
use syncstore_common::Metrics;

use super::metrics::metrics_from_state;

#[derive(Clone)]
pub struct TestErrorRequest {
    pub metrics: Metrics,
}

impl FromRequest for TestErrorRequest {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        future::ready(Ok(TestErrorRequest {
            metrics: metrics_from_state(req),
        }))
    }
}
