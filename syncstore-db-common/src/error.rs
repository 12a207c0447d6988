use std::fmt;

use backtrace::Backtrace;
use http::StatusCode;
use thiserror::Error;

/// Backend-independent error conditions every storage backend must be able to report (§4.2,
/// §7). Backend-specific wrappers (e.g. a mysql driver error) layer on top of this.
#[derive(Debug)]
pub struct CommonDbError {
    pub kind: CommonDbErrorKind,
    pub status: StatusCode,
    pub backtrace: Backtrace,
}

#[derive(Debug, Error)]
pub enum CommonDbErrorKind {
    #[error("Collection not found")]
    CollectionNotFound,
    #[error("Bso not found")]
    BsoNotFound,
    #[error("Batch not found")]
    BatchNotFound,
    #[error("Conflict")]
    Conflict,
    #[error("Unexpected error: {}", _0)]
    Internal(String),
    #[error("User over quota")]
    Quota,
    #[error("Server busy")]
    Busy,
}

impl From<CommonDbErrorKind> for CommonDbError {
    fn from(kind: CommonDbErrorKind) -> Self {
        let status = match kind {
            CommonDbErrorKind::CollectionNotFound | CommonDbErrorKind::BsoNotFound => {
                StatusCode::NOT_FOUND
            }
            // Matches the wire contract (§6): a precondition/lock conflict is reported as 409
            // so a client can safely retry after `Retry-After`.
            CommonDbErrorKind::Conflict => StatusCode::CONFLICT,
            CommonDbErrorKind::Quota => StatusCode::FORBIDDEN,
            CommonDbErrorKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            kind,
            status,
            backtrace: Backtrace::new(),
        }
    }
}

impl CommonDbError {
    pub fn batch_not_found() -> Self {
        CommonDbErrorKind::BatchNotFound.into()
    }

    pub fn bso_not_found() -> Self {
        CommonDbErrorKind::BsoNotFound.into()
    }

    pub fn collection_not_found() -> Self {
        CommonDbErrorKind::CollectionNotFound.into()
    }

    pub fn conflict() -> Self {
        CommonDbErrorKind::Conflict.into()
    }

    pub fn internal(msg: String) -> Self {
        CommonDbErrorKind::Internal(msg).into()
    }

    pub fn quota() -> Self {
        CommonDbErrorKind::Quota.into()
    }

    pub fn busy() -> Self {
        CommonDbErrorKind::Busy.into()
    }
}

impl fmt::Display for CommonDbError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, formatter)
    }
}

impl std::error::Error for CommonDbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Classification predicates shared by every backend error type, so callers higher up the stack
/// (handlers, the coherence cache) can react to error *kind* without matching on backend-specific
/// variants.
pub trait DbErrorIntrospect {
    fn is_sentry_event(&self) -> bool {
        false
    }

    fn metric_label(&self) -> Option<String> {
        None
    }

    fn is_collection_not_found(&self) -> bool {
        false
    }

    fn is_conflict(&self) -> bool {
        false
    }

    fn is_quota(&self) -> bool {
        false
    }

    fn is_bso_not_found(&self) -> bool {
        false
    }

    fn is_batch_not_found(&self) -> bool {
        false
    }

    fn is_busy(&self) -> bool {
        false
    }

    /// Constructs this backend's representation of spec.md §4.3's write-rate-cap failure, so
    /// the coherence cache (generic over the backend's error type) can report it without
    /// knowing the backend's concrete error enum.
    fn busy() -> Self
    where
        Self: Sized;
}

impl DbErrorIntrospect for CommonDbError {
    fn is_sentry_event(&self) -> bool {
        !matches!(
            self.kind,
            CommonDbErrorKind::CollectionNotFound
                | CommonDbErrorKind::BsoNotFound
                | CommonDbErrorKind::BatchNotFound
                | CommonDbErrorKind::Conflict
                | CommonDbErrorKind::Quota
                | CommonDbErrorKind::Busy
        )
    }

    fn metric_label(&self) -> Option<String> {
        match self.kind {
            CommonDbErrorKind::Conflict => Some("storage.conflict".to_owned()),
            CommonDbErrorKind::Quota => Some("storage.quota".to_owned()),
            CommonDbErrorKind::Busy => Some("storage.busy".to_owned()),
            _ => None,
        }
    }

    fn is_collection_not_found(&self) -> bool {
        matches!(self.kind, CommonDbErrorKind::CollectionNotFound)
    }

    fn is_conflict(&self) -> bool {
        matches!(self.kind, CommonDbErrorKind::Conflict)
    }

    fn is_quota(&self) -> bool {
        matches!(self.kind, CommonDbErrorKind::Quota)
    }

    fn is_bso_not_found(&self) -> bool {
        matches!(self.kind, CommonDbErrorKind::BsoNotFound)
    }

    fn is_batch_not_found(&self) -> bool {
        matches!(self.kind, CommonDbErrorKind::BatchNotFound)
    }

    fn is_busy(&self) -> bool {
        matches!(self.kind, CommonDbErrorKind::Busy)
    }

    fn busy() -> Self {
        CommonDbError::busy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_reports_service_unavailable_and_is_not_a_sentry_event() {
        let err = CommonDbError::busy();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.is_busy());
        assert!(!err.is_sentry_event());
    }
}
