//! Sets `X-Weave-Timestamp` on every response (spec.md §4.4/§6): the request-frozen timestamp,
//! or the response's own `X-Last-Modified` if that ended up later (a write can move the clock
//! forward mid-request).

use std::fmt::Display;
use std::task::{Context, Poll};

use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{self, HeaderMap},
    Error,
};
use futures::future::{self, LocalBoxFuture, TryFutureExt};
use syncstore_common::{X_LAST_MODIFIED, X_WEAVE_TIMESTAMP};
use syncstore_db_common::SyncTimestamp;

use crate::{
    error::{ApiError, ApiErrorKind},
    web::DOCKER_FLOW_ENDPOINTS,
};

#[derive(Default)]
pub struct WeaveTimestamp;

impl<S, B> Transform<S> for WeaveTimestamp
where
    S: Service<Request = ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Request = ServiceRequest;
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = WeaveTimestampMiddleware<S>;
    type Future = LocalBoxFuture<'static, Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        Box::pin(future::ok(WeaveTimestampMiddleware { service }))
    }
}

pub struct WeaveTimestampMiddleware<S> {
    service: S,
}

impl<S, B> Service for WeaveTimestampMiddleware<S>
where
    S: Service<Request = ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Request = ServiceRequest;
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, req: ServiceRequest) -> Self::Future {
        if DOCKER_FLOW_ENDPOINTS.contains(&req.uri().path().to_lowercase().as_str()) {
            return Box::pin(self.service.call(req));
        }

        let ts = SyncTimestamp::default().as_seconds();
        Box::pin(self.service.call(req).and_then(move |mut resp| {
            future::ready(
                set_weave_timestamp(resp.headers_mut(), ts)
                    .map_err(Into::into)
                    .map(|_| resp),
            )
        }))
    }
}

fn set_weave_timestamp(headers: &mut HeaderMap, ts: f64) -> Result<(), ApiError> {
    fn invalid_xlm<E: Display>(e: E) -> ApiError {
        ApiErrorKind::Internal(format!("Invalid X-Last-Modified response header: {}", e)).into()
    }

    let weave_ts = if let Some(val) = headers.get(X_LAST_MODIFIED) {
        let resp_ts = val
            .to_str()
            .map_err(invalid_xlm)?
            .parse::<f64>()
            .map_err(invalid_xlm)?;
        resp_ts.max(ts)
    } else {
        ts
    };
    headers.insert(
        header::HeaderName::from_static(X_WEAVE_TIMESTAMP),
        header::HeaderValue::from_str(&format!("{:.2}", weave_ts)).map_err(invalid_xlm)?,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use actix_web::{http, HttpResponse};
    use chrono::Utc;

    use super::*;

    #[test]
    fn no_modified_header_uses_now() {
        let mut resp = HttpResponse::build(http::StatusCode::OK).finish();
        set_weave_timestamp(resp.headers_mut(), SyncTimestamp::default().as_seconds()).unwrap();
        let weave_hdr: f64 = resp
            .headers()
            .get(X_WEAVE_TIMESTAMP)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        assert!((weave_hdr - now).abs() < 2.0);
    }

    #[test]
    fn later_last_modified_wins() {
        let ts = (Utc::now().timestamp_millis() as f64 / 1000.0) + 4.0;
        let hts = format!("{:.2}", ts);
        let mut resp = HttpResponse::build(http::StatusCode::OK)
            .insert_header((X_LAST_MODIFIED, hts.clone()))
            .finish();
        set_weave_timestamp(resp.headers_mut(), ts - 10.0).unwrap();
        let weave_hdr = resp
            .headers()
            .get(X_WEAVE_TIMESTAMP)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(weave_hdr, hts);
    }
}
