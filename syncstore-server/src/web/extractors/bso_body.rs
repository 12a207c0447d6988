//! The JSON body of `PUT .../storage/{collection}/{bso}` (spec.md §3's BSO object, §4.1).

use actix_web::{
    dev::Payload,
    http::header::CONTENT_TYPE,
    web::{BytesMut, Data},
    Error, FromRequest, HttpMessage, HttpRequest,
};
use futures::{future::LocalBoxFuture, FutureExt, StreamExt};
use serde::Deserialize;
use validator::Validate;

use super::{
    constants::ACCEPTED_CONTENT_TYPES,
    validation::{validate_body_bso_id, validate_body_bso_sortindex, validate_body_bso_ttl},
};
use crate::{
    error::{ApiError, ApiErrorKind, ErrorCode},
    server::ServerState,
    web::error::{RequestErrorLocation, ValidationError},
};

#[derive(Clone, Debug, Default, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BsoBody {
    #[validate(custom(function = "validate_body_bso_id"))]
    pub id: Option<String>,
    #[validate(custom(function = "validate_body_bso_sortindex"))]
    pub sortindex: Option<i32>,
    pub payload: Option<String>,
    #[validate(custom(function = "validate_body_bso_ttl"))]
    pub ttl: Option<u32>,
    // Clients sometimes echo these back from a prior GET; tolerated, never acted on.
    #[serde(rename = "modified")]
    #[allow(dead_code)]
    _ignored_modified: Option<serde_json::Value>,
    #[serde(rename = "collection")]
    #[allow(dead_code)]
    _ignored_collection: Option<serde_json::Value>,
}

fn bad_body(message: String) -> ApiError {
    ApiErrorKind::Validation(ValidationError::from_details(
        message,
        ErrorCode::BodyParse,
        RequestErrorLocation::Body,
        None,
    ))
    .into()
}

impl FromRequest for BsoBody {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_default();
        let content_type_ok = content_type.is_empty()
            || ACCEPTED_CONTENT_TYPES
                .iter()
                .any(|accepted| content_type.starts_with(accepted));

        let max_payload = req
            .app_data::<Data<ServerState>>()
            .map(|state| state.limits.max_record_payload_bytes as usize)
            .unwrap_or(usize::MAX);

        let mut payload = payload.take();
        async move {
            if !content_type_ok {
                return Err(bad_body(format!("Invalid Content-Type: {}", content_type)).into());
            }

            let mut bytes = BytesMut::new();
            while let Some(chunk) = payload.next().await {
                bytes.extend_from_slice(&chunk?);
            }

            let body: BsoBody = serde_json::from_slice(&bytes)
                .map_err(|e| bad_body(format!("Invalid JSON body: {}", e)))?;

            if let Some(ref payload) = body.payload {
                if payload.len() > max_payload {
                    return Err(ApiError::from(ApiErrorKind::Validation(ValidationError::simple(
                        "Payload too large".to_owned(),
                        ErrorCode::InvalidBso,
                        actix_web::http::StatusCode::PAYLOAD_TOO_LARGE,
                    )))
                    .into());
                }
            }

            body.validate().map_err(|e| {
                ApiError::from(ApiErrorKind::Validation(ValidationError::from_validation_errors(
                    e,
                    ErrorCode::InvalidBso,
                    RequestErrorLocation::Body,
                )))
            })?;

            Ok(body)
        }
        .boxed_local()
    }
}
