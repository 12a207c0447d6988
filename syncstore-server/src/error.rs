//! The wire error taxonomy (spec.md §6/§7): every failure the HTTP layer can produce collapses
//! into one of the eight stable integer codes spec.md names, or (for precondition/conflict/
//! not-found/backend-unavailable) a bare status code with no body beyond it.

use std::fmt;

use actix_web::{
    http::{header, StatusCode},
    HttpResponse, ResponseError,
};
use backtrace::Backtrace;
use serde::{ser::SerializeMap, Serialize, Serializer};
use syncstore_common::{from_error, impl_fmt_display, InternalError, MetricError, ReportableError};
use syncstore_mysql::DbError;
use syncstore_db_common::DbErrorIntrospect;
use thiserror::Error;

use crate::web::error::ValidationError;

pub type ApiResult<T> = Result<T, ApiError>;

/// The stable per-record/per-request error codes spec.md §6 names. Codes are part of the wire
/// contract; never renumber them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    InvalidProtocol = 1,
    InvalidId = 2,
    InvalidUser = 3,
    OverQuota = 4,
    BodyParse = 5,
    InvalidBso = 6,
    NoWritePermission = 7,
    InvalidConfiguration = 8,
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> i32 {
        code as i32
    }
}

/// Seconds clients are told to wait before retrying a conflict or backend-unavailable response.
pub const RETRY_AFTER: u8 = 10;

#[derive(Debug)]
pub struct ApiError {
    kind: ApiErrorKind,
    pub status: StatusCode,
    pub backtrace: Box<Backtrace>,
}

#[derive(Debug, Error)]
pub enum ApiErrorKind {
    #[error("{}", _0)]
    Db(DbError),

    #[error("{}", _0)]
    Validation(ValidationError),

    #[error("No server state found for request")]
    NoServerState,

    #[error("{}", _0)]
    Internal(String),
}

impl From<ApiErrorKind> for ApiError {
    fn from(kind: ApiErrorKind) -> Self {
        let status = match &kind {
            ApiErrorKind::Db(e) => {
                if e.is_sentry_event() {
                    // A condition the backend can't classify as a stable client-facing code
                    // (driver/pool failures) is reported as a transient backend-unavailable
                    // condition rather than a bare 500, per spec.md §7's "Backend unavailable".
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    e.status
                }
            }
            ApiErrorKind::Validation(e) => e.status,
            ApiErrorKind::NoServerState => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorKind::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            kind,
            status,
            backtrace: Box::new(Backtrace::new()),
        }
    }
}

impl ApiError {
    pub fn internal(msg: String) -> Self {
        ApiErrorKind::Internal(msg).into()
    }

    pub fn missing_confirm_delete() -> Self {
        ApiError::from(ApiErrorKind::Validation(ValidationError::simple(
            "Missing X-Confirm-Delete".to_owned(),
            ErrorCode::InvalidProtocol,
            StatusCode::BAD_REQUEST,
        )))
    }

    pub fn conflict() -> Self {
        let mut err: ApiError = ApiErrorKind::Db(DbError::conflict()).into();
        err.status = StatusCode::CONFLICT;
        err
    }

    pub fn retries_exhausted() -> Self {
        let mut err: ApiError = ApiErrorKind::Db(DbError::conflict()).into();
        err.status = StatusCode::SERVICE_UNAVAILABLE;
        err
    }

    /// The stable integer code + human message pair for this error, when the wire contract
    /// says one applies. Precondition failures, not-found, conflicts and backend-unavailable
    /// responses carry no body beyond the status code and headers.
    fn wire_body(&self) -> Option<(ErrorCode, String)> {
        match &self.kind {
            ApiErrorKind::Validation(e) => Some((e.code, e.to_string())),
            ApiErrorKind::Db(e) if e.is_quota() => {
                Some((ErrorCode::OverQuota, "user is over quota".to_owned()))
            }
            ApiErrorKind::Db(_) => None,
            ApiErrorKind::NoServerState => Some((
                ErrorCode::InvalidConfiguration,
                "server is misconfigured".to_owned(),
            )),
            ApiErrorKind::Internal(msg) => Some((ErrorCode::InvalidConfiguration, msg.clone())),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(&self.kind, ApiErrorKind::Db(e) if e.is_conflict())
    }
}

impl ReportableError for ApiError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        match &self.kind {
            ApiErrorKind::Db(e) => e.is_sentry_event(),
            ApiErrorKind::Validation(_) => false,
            ApiErrorKind::NoServerState | ApiErrorKind::Internal(_) => true,
        }
    }

    fn metric_label(&self) -> Option<String> {
        match &self.kind {
            ApiErrorKind::Db(e) => e.metric_label(),
            _ => None,
        }
    }
}

impl InternalError for ApiError {
    fn internal_error(message: String) -> Self {
        ApiError::internal(message)
    }
}

impl_fmt_display!(ApiError, ApiErrorKind);

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

from_error!(DbError, ApiError, ApiErrorKind::Db);
from_error!(ValidationError, ApiError, ApiErrorKind::Validation);

impl From<MetricError> for ApiError {
    fn from(error: MetricError) -> Self {
        ApiError::internal(error.to_string())
    }
}

/// Serializes as `{"code": n, "message": "..."}` for the kinds the wire contract gives a body
/// to, or an empty object otherwise (precondition/conflict/not-found/backend-unavailable).
impl Serialize for ApiError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some((code, message)) = self.wire_body() {
            map.serialize_entry("code", &i32::from(code))?;
            map.serialize_entry("message", &message)?;
        }
        map.end()
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        if !self.is_sentry_event() {
            debug!("Request error: {}", self);
        } else {
            error!("Unhandled request error: {}", self);
        }

        let mut builder = HttpResponse::build(self.status);
        match self.status {
            StatusCode::CONFLICT | StatusCode::SERVICE_UNAVAILABLE => {
                builder.insert_header((header::RETRY_AFTER, RETRY_AFTER.to_string()));
            }
            _ => {}
        }
        if self.status == StatusCode::SERVICE_UNAVAILABLE {
            builder.insert_header(("X-Weave-Backoff", RETRY_AFTER.to_string()));
        }

        match self.wire_body() {
            Some(_) => builder.json(self),
            None => builder.finish(),
        }
    }
}
