//! `X-If-Modified-Since` / `X-If-Unmodified-Since` (spec.md §4.1's precondition check, §6).

use actix_web::{dev::Payload, http::header::HeaderMap, Error, FromRequest, HttpRequest};
use futures::future::{self, Ready};
use syncstore_db_common::SyncTimestamp;

use crate::{
    error::{ApiError, ErrorCode},
    web::error::{RequestErrorLocation, ValidationError},
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PreConditionHeader {
    IfModifiedSince(SyncTimestamp),
    IfUnmodifiedSince(SyncTimestamp),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PreConditionHeaderOpt {
    pub opt: Option<PreConditionHeader>,
}

impl PreConditionHeaderOpt {
    pub fn extrude(headers: &HeaderMap) -> Result<Self, Error> {
        let modified = headers.get("X-If-Modified-Since");
        let unmodified = headers.get("X-If-Unmodified-Since");
        if modified.is_some() && unmodified.is_some() {
            return Err(ApiError::from(
                crate::error::ApiErrorKind::Validation(ValidationError::from_details(
                    "X-If-Modified-Since conflicts with X-If-Unmodified-Since".to_owned(),
                    ErrorCode::InvalidProtocol,
                    RequestErrorLocation::Header,
                    Some("X-If-Unmodified-Since".to_owned()),
                )),
            )
            .into());
        }
        let (value, field_name) = if let Some(v) = modified {
            (v, "X-If-Modified-Since")
        } else if let Some(v) = unmodified {
            (v, "X-If-Unmodified-Since")
        } else {
            return Ok(Self { opt: None });
        };

        let as_str = value.to_str().map_err(|e| {
            ApiError::from(crate::error::ApiErrorKind::Validation(
                ValidationError::from_details(
                    e.to_string(),
                    ErrorCode::InvalidProtocol,
                    RequestErrorLocation::Header,
                    Some(field_name.to_owned()),
                ),
            ))
        })?;
        let ts = SyncTimestamp::from_header(as_str).map_err(|e| {
            ApiError::from(crate::error::ApiErrorKind::Validation(
                ValidationError::from_details(
                    e.to_owned(),
                    ErrorCode::InvalidProtocol,
                    RequestErrorLocation::Header,
                    Some(field_name.to_owned()),
                ),
            ))
        })?;
        let header = if field_name == "X-If-Modified-Since" {
            PreConditionHeader::IfModifiedSince(ts)
        } else {
            PreConditionHeader::IfUnmodifiedSince(ts)
        };
        Ok(Self { opt: Some(header) })
    }
}

impl FromRequest for PreConditionHeaderOpt {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        future::ready(Self::extrude(req.headers()))
    }
}

#[cfg(test)]
mod tests {
    use actix_web::test::TestRequest;
    use syncstore_db_common::SyncTimestamp;

    use super::{PreConditionHeader, PreConditionHeaderOpt};

    #[test]
    fn rejects_both_headers_present() {
        let req = TestRequest::default()
            .insert_header(("X-If-Modified-Since", "32124.32"))
            .insert_header(("X-If-Unmodified-Since", "4212.12"))
            .to_http_request();
        assert!(PreConditionHeaderOpt::extrude(req.headers()).is_err());
    }

    #[test]
    fn parses_modified_since() {
        let req = TestRequest::default()
            .insert_header(("X-If-Modified-Since", "32.1"))
            .to_http_request();
        let result = PreConditionHeaderOpt::extrude(req.headers()).unwrap().opt.unwrap();
        assert_eq!(result, PreConditionHeader::IfModifiedSince(SyncTimestamp::from_seconds(32.1)));
    }

    #[test]
    fn no_headers_is_none() {
        let req = TestRequest::default().to_http_request();
        assert_eq!(PreConditionHeaderOpt::extrude(req.headers()).unwrap().opt, None);
    }
}
