//! Request-validation failures: malformed headers, path params, query strings and bodies.
//! Everything here ultimately becomes an `ApiError` via `ApiErrorKind::Validation`.

use std::fmt;

use actix_web::http::StatusCode;
use validator::ValidationErrors;

use crate::error::ErrorCode;

/// Where in the request a validation failure was found, for logging; never exposed on the wire
/// (spec.md §7: backend/validation detail never leaks into the body).
#[derive(Debug, Eq, PartialEq)]
pub enum RequestErrorLocation {
    Body,
    QueryString,
    Path,
    Header,
    Unknown,
}

#[derive(Debug)]
pub struct ValidationError {
    pub status: StatusCode,
    pub code: ErrorCode,
    message: String,
    location: RequestErrorLocation,
    name: Option<String>,
}

impl ValidationError {
    pub fn simple(message: String, code: ErrorCode, status: StatusCode) -> Self {
        Self {
            status,
            code,
            message,
            location: RequestErrorLocation::Unknown,
            name: None,
        }
    }

    pub fn from_details(
        message: String,
        code: ErrorCode,
        location: RequestErrorLocation,
        name: Option<String>,
    ) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message,
            location,
            name,
        }
    }

    pub fn from_validation_errors(
        errors: ValidationErrors,
        code: ErrorCode,
        location: RequestErrorLocation,
    ) -> Self {
        let message = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let reasons: Vec<String> = errs
                    .iter()
                    .map(|e| e.message.as_deref().unwrap_or("invalid value").to_owned())
                    .collect();
                format!("{}: {}", field, reasons.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message,
            location,
            name: None,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({:?}, {})", self.message, self.location, name),
            None => write!(f, "{} ({:?})", self.message, self.location),
        }
    }
}

impl std::error::Error for ValidationError {}
