use actix_web::{
    dev::{Extensions, Payload},
    http::Uri,
    Error, FromRequest, HttpMessage, HttpRequest,
};
use futures::future::{self, Ready};
use serde::Deserialize;
use validator::Validate;

use super::{constants::VALID_COLLECTION_ID_REGEX, utils::urldecode};
use crate::{
    error::{ApiError, ApiErrorKind, ErrorCode},
    web::error::{RequestErrorLocation, ValidationError},
};

/// `/1.5/{uid}/storage/{collection}[/...]` — the collection name path segment.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CollectionParam {
    #[validate(regex(path = *VALID_COLLECTION_ID_REGEX))]
    pub collection: String,
}

fn missing_collection() -> ApiError {
    ApiErrorKind::Validation(ValidationError::from_details(
        "Missing collection".to_owned(),
        ErrorCode::InvalidId,
        RequestErrorLocation::Path,
        Some("collection".to_owned()),
    ))
    .into()
}

impl CollectionParam {
    fn from_path(uri: &Uri) -> Result<Option<Self>, Error> {
        // path: "/1.5/{uid}/storage/{collection}[/{bso}]"
        let elements: Vec<&str> = uri.path().split('/').collect();
        if elements.get(3) != Some(&"storage") || !(5..=6).contains(&elements.len()) {
            return Ok(None);
        }
        let raw = elements.get(4).ok_or_else(missing_collection)?;
        let collection = urldecode(raw).map_err(|_| missing_collection())?;
        Ok(Some(Self { collection }))
    }

    pub fn extrude(uri: &Uri, extensions: &mut Extensions) -> Result<Option<Self>, Error> {
        if let Some(cached) = extensions.get::<Option<Self>>() {
            return Ok(cached.clone());
        }
        let collection = Self::from_path(uri)?;
        let result = match collection {
            Some(collection) => {
                collection.validate().map_err(|e| {
                    ApiError::from(ApiErrorKind::Validation(
                        ValidationError::from_validation_errors(
                            e,
                            ErrorCode::InvalidId,
                            RequestErrorLocation::Path,
                        ),
                    ))
                })?;
                Some(collection)
            }
            None => None,
        };
        extensions.insert(result.clone());
        Ok(result)
    }
}

impl FromRequest for CollectionParam {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        future::ready(
            Self::extrude(req.uri(), &mut req.extensions_mut())
                .and_then(|opt| opt.ok_or_else(|| missing_collection().into())),
        )
    }
}
