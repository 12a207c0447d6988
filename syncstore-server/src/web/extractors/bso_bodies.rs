//! The JSON-array (or `application/newlines`) body of `POST .../storage/{collection}` (spec.md
//! §4.1's "array of BSO objects").

use std::collections::HashMap;

use actix_web::{
    dev::Payload,
    http::header::CONTENT_TYPE,
    web::{BytesMut, Data},
    Error, FromRequest, HttpRequest,
};
use futures::{future::LocalBoxFuture, FutureExt, StreamExt};
use serde_json::Value;

use super::{batch_bso_body::BatchBsoBody, constants::ACCEPTED_CONTENT_TYPES};
use crate::{
    error::{ApiError, ApiErrorKind, ErrorCode},
    server::ServerState,
    web::error::{RequestErrorLocation, ValidationError},
};

#[derive(Clone, Debug, Default)]
pub struct BsoBodies {
    pub valid: Vec<BatchBsoBody>,
    pub invalid: HashMap<String, String>,
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

impl FromRequest for BsoBodies {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_default();
        let newlines = content_type.starts_with("application/newlines");
        let content_type_ok = content_type.is_empty()
            || ACCEPTED_CONTENT_TYPES
                .iter()
                .any(|accepted| content_type.starts_with(accepted));

        let (max_record_bytes, max_total_bytes) = req
            .app_data::<Data<ServerState>>()
            .map(|state| {
                (
                    state.limits.max_record_payload_bytes as usize,
                    state.limits.max_post_bytes as usize,
                )
            })
            .unwrap_or((usize::MAX, usize::MAX));

        let mut payload = payload.take();
        async move {
            if !content_type_ok {
                return Err(bad_body(format!("Invalid Content-Type: {}", content_type)).into());
            }

            let mut bytes = BytesMut::new();
            while let Some(chunk) = payload.next().await {
                bytes.extend_from_slice(&chunk?);
            }
            let text = String::from_utf8_lossy(&bytes).into_owned();

            let raw_values: Vec<Value> = if newlines {
                text.lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(|line| serde_json::from_str(line).unwrap_or(Value::Null))
                    .collect()
            } else {
                serde_json::from_str(&text).map_err(|e| bad_body(format!("Invalid JSON body: {}", e)))?
            };

            let mut valid = Vec::new();
            let mut invalid = HashMap::new();
            let mut seen_ids = std::collections::HashSet::new();
            let mut total_bytes = 0usize;

            for raw in raw_values {
                let parsed = match BatchBsoBody::from_raw_bso(raw) {
                    Ok(bso) => bso,
                    Err(reason) => {
                        invalid.insert(String::new(), reason);
                        continue;
                    }
                };
                if !seen_ids.insert(parsed.id.clone()) {
                    invalid.insert(parsed.id, "duplicate id".to_owned());
                    continue;
                }
                let record_bytes = parsed.payload.as_deref().unwrap_or("").len();
                if record_bytes > max_record_bytes {
                    invalid.insert(parsed.id, "retry bytes".to_owned());
                    continue;
                }
                if total_bytes + record_bytes > max_total_bytes {
                    invalid.insert(parsed.id, "retry bytes".to_owned());
                    continue;
                }
                total_bytes += record_bytes;
                valid.push(parsed);
            }

            Ok(BsoBodies { valid, invalid })
        }
        .boxed_local()
    }
}
