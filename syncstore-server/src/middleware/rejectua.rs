//! Some old Firefox-iOS-Sync builds crash on certain response headers this crate sends; they're
//! turned away with a bare 503 before ever reaching a handler (REDESIGN FLAGS: kept as a
//! standalone `Transform` rather than a free function so it composes with `.wrap(...)` like any
//! other middleware here).

use std::task::{Context, Poll};

use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http::header::USER_AGENT,
    Error, HttpResponse,
};
use futures::future::{self, LocalBoxFuture};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // e.g. "Firefox-iOS-Sync/18.0b1 (iPhone; iPhone OS 13.2.2) (Fennec (synctesting))"
    static ref IOS_UA_REGEX: Regex = Regex::new(
        r"(?x)
^
Firefox-iOS-Sync/
(?P<major>[0-9]+)\.[.0-9]+    # <appVersion-major>.<appVersion-minor-etc>
b.*                           # b<buildNumber>
\s\(.+                        #  (<deviceModel>
;\siPhone\sOS                 # ; iPhone OS
\s.+\)                        #  <systemVersion>)
\s\(.*\)                      #  (<displayName>)
$
"
    )
    .unwrap();
}

/// firefox-ios < v20 suffers from a bug where our response headers can cause it to crash; reject
/// with a bare error response instead of letting the handler run. Dev builds are historically
/// labeled v0 ("Firefox-iOS-Sync/dev") and are never rejected.
fn should_reject(ua: &str) -> bool {
    let major = IOS_UA_REGEX
        .captures(ua)
        .and_then(|captures| captures.name("major"))
        .and_then(|major| major.as_str().parse::<u32>().ok())
        .unwrap_or(20);
    0 < major && major < 20
}

#[derive(Default)]
pub struct RejectUA;

impl<S, B> Transform<S> for RejectUA
where
    S: Service<Request = ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Request = ServiceRequest;
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RejectUAMiddleware<S>;
    type Future = LocalBoxFuture<'static, Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        Box::pin(future::ok(RejectUAMiddleware { service }))
    }
}

pub struct RejectUAMiddleware<S> {
    service: S,
}

impl<S, B> Service for RejectUAMiddleware<S>
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
        let rejected = req
            .headers()
            .get(USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(should_reject)
            .unwrap_or(false);

        if rejected {
            trace!("Rejecting User-Agent");
            let resp = req.into_response(HttpResponse::ServiceUnavailable().body("0".to_owned()));
            return Box::pin(future::ok(resp));
        }

        Box::pin(self.service.call(req))
    }
}

#[cfg(test)]
mod tests {
    use super::should_reject;

    #[test]
    fn rejects_old_ios_client() {
        assert!(should_reject(
            "Firefox-iOS-Sync/18.0b1 (iPhone; iPhone OS 13.2.2) (Fennec (synctesting))"
        ));
    }

    #[test]
    fn allows_new_ios_client() {
        assert!(!should_reject(
            "Firefox-iOS-Sync/20.0b1 (iPhone; iPhone OS 13.2.2) (Fennec (synctesting))"
        ));
    }

    #[test]
    fn allows_unrelated_user_agent() {
        assert!(!should_reject("curl/7.68.0"));
    }
}
