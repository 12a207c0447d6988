//! Resolves the authenticated user-id (spec.md §1: "assumed to yield a stable integer `user_id`",
//! out of scope for this crate). Rather than a full auth scheme, identity is carried in the
//! `X-Sync-UserId` header and cross-checked against the `{uid}` URL path component, per spec.md
//! §6's "must equal the URL path component or the request fails".

use std::str::FromStr;

use actix_web::{
    dev::{Extensions, Payload},
    http::Uri,
    Error, FromRequest, HttpMessage, HttpRequest,
};
use futures::future::{self, Ready};
use syncstore_db_common::UserIdentifier;

use crate::{
    error::{ApiError, ApiErrorKind, ErrorCode},
    web::error::{RequestErrorLocation, ValidationError},
};

pub const USER_ID_HEADER: &str = "X-Sync-UserId";

fn invalid_user(message: &str) -> ApiError {
    ApiErrorKind::Validation(ValidationError::from_details(
        message.to_owned(),
        ErrorCode::InvalidUser,
        RequestErrorLocation::Path,
        Some("uid".to_owned()),
    ))
    .into()
}

fn uid_from_path(uri: &Uri) -> Result<u64, Error> {
    // path: "/1.5/{uid}/..."
    let elements: Vec<&str> = uri.path().split('/').collect();
    let raw = elements.get(2).ok_or_else(|| invalid_user("Missing uid"))?;
    u64::from_str(raw)
        .map_err(|_| invalid_user("Invalid uid").into())
}

impl UserIdExtractor for UserIdentifier {}

/// Marker so `UserIdentifier` (defined in `syncstore-db-common`, which knows nothing of HTTP)
/// can still be the target of `extrude`/`FromRequest` here.
pub trait UserIdExtractor: Sized {
    fn extrude(req: &HttpRequest, extensions: &mut Extensions) -> Result<UserIdentifier, Error> {
        if let Some(cached) = extensions.get::<UserIdentifier>() {
            return Ok(cached.clone());
        }
        let path_uid = uid_from_path(req.uri())?;
        let header_uid = req
            .headers()
            .get(USER_ID_HEADER)
            .ok_or_else(|| invalid_user("Missing X-Sync-UserId"))?
            .to_str()
            .ok()
            .and_then(|v| u64::from_str(v).ok())
            .ok_or_else(|| invalid_user("Invalid X-Sync-UserId"))?;
        if header_uid != path_uid {
            return Err(invalid_user("X-Sync-UserId does not match URL uid").into());
        }
        let user_id = UserIdentifier::new(path_uid);
        extensions.insert(user_id.clone());
        Ok(user_id)
    }
}

impl FromRequest for UserIdentifier {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let req = req.clone();
        future::ready(<UserIdentifier as UserIdExtractor>::extrude(
            &req,
            &mut req.extensions_mut(),
        ))
    }
}
