use actix_web::{
    dev::{Extensions, Payload, RequestHead},
    http::Uri,
    Error, FromRequest, HttpMessage, HttpRequest,
};
use futures::future::{self, Ready};
use serde::Deserialize;
use validator::Validate;

use super::{constants::VALID_ID_REGEX, utils::urldecode};
use crate::{
    error::{ApiError, ApiErrorKind, ErrorCode},
    web::error::{RequestErrorLocation, ValidationError},
};

/// `/1.5/{uid}/storage/{collection}/{bso}` — the BSO id path segment.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct BsoParam {
    #[validate(regex(path = *VALID_ID_REGEX))]
    pub bso: String,
}

fn invalid_bso() -> ApiError {
    ApiErrorKind::Validation(ValidationError::from_details(
        "Invalid BSO id".to_owned(),
        ErrorCode::InvalidId,
        RequestErrorLocation::Path,
        Some("bso".to_owned()),
    ))
    .into()
}

impl BsoParam {
    fn from_path(uri: &Uri) -> Result<Self, Error> {
        // path: "/1.5/{uid}/storage/{collection}/{bso}"
        let elements: Vec<&str> = uri.path().split('/').collect();
        if elements.get(3) != Some(&"storage") || elements.len() != 6 {
            return Err(invalid_bso().into());
        }
        let raw = elements.get(5).ok_or_else(invalid_bso)?;
        let bso = urldecode(raw).map_err(|_| invalid_bso())?;
        Ok(Self { bso })
    }

    pub fn extrude(head: &RequestHead, extensions: &mut Extensions) -> Result<Self, Error> {
        if let Some(cached) = extensions.get::<Self>() {
            return Ok(cached.clone());
        }
        let bso = Self::from_path(&head.uri)?;
        bso.validate().map_err(|e| {
            ApiError::from(ApiErrorKind::Validation(
                ValidationError::from_validation_errors(
                    e,
                    ErrorCode::InvalidId,
                    RequestErrorLocation::Path,
                ),
            ))
        })?;
        extensions.insert(bso.clone());
        Ok(bso)
    }
}

impl FromRequest for BsoParam {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        future::ready(Self::extrude(req.head(), &mut req.extensions_mut()))
    }
}
