use std::fmt;

use backtrace::Backtrace;
use http::StatusCode;
use syncstore_common::{from_error, impl_fmt_display, InternalError, ReportableError};
use syncstore_db_common::error::{CommonDbError, CommonDbErrorKind, DbErrorIntrospect};
use thiserror::Error;

/// Errors that can arise from this crate: either a condition spec.md §7 names generically
/// (wrapped from `CommonDbError`) or a lower-level failure from the mysql driver/pool stack.
#[derive(Debug)]
pub struct DbError {
    kind: DbErrorKind,
    pub status: StatusCode,
    pub backtrace: Box<Backtrace>,
}

#[derive(Debug, Error)]
enum DbErrorKind {
    #[error("{}", _0)]
    Common(CommonDbErrorKind),

    #[error("Mysql error: {}", _0)]
    Mysql(String),
}

impl From<DbErrorKind> for DbError {
    fn from(kind: DbErrorKind) -> Self {
        let status = match &kind {
            DbErrorKind::Common(k) => match k {
                CommonDbErrorKind::CollectionNotFound | CommonDbErrorKind::BsoNotFound => {
                    StatusCode::NOT_FOUND
                }
                CommonDbErrorKind::Conflict => StatusCode::CONFLICT,
                CommonDbErrorKind::Quota => StatusCode::FORBIDDEN,
                CommonDbErrorKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            DbErrorKind::Mysql(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            kind,
            status,
            backtrace: Box::new(Backtrace::new()),
        }
    }
}

impl DbError {
    pub fn batch_not_found() -> Self {
        DbErrorKind::Common(CommonDbErrorKind::BatchNotFound).into()
    }

    pub fn bso_not_found() -> Self {
        DbErrorKind::Common(CommonDbErrorKind::BsoNotFound).into()
    }

    pub fn collection_not_found() -> Self {
        DbErrorKind::Common(CommonDbErrorKind::CollectionNotFound).into()
    }

    pub fn conflict() -> Self {
        DbErrorKind::Common(CommonDbErrorKind::Conflict).into()
    }

    pub fn internal(msg: String) -> Self {
        DbErrorKind::Common(CommonDbErrorKind::Internal(msg)).into()
    }

    pub fn quota() -> Self {
        DbErrorKind::Common(CommonDbErrorKind::Quota).into()
    }

    pub fn busy() -> Self {
        DbErrorKind::Common(CommonDbErrorKind::Busy).into()
    }

    /// A connection-pool wait that timed out (spec.md §5's bounded transaction lifetime):
    /// surfaced to the web layer as `server busy` (503), not a generic internal error.
    pub fn pool_timeout() -> Self {
        DbErrorKind::Mysql("connection pool timed out".to_owned()).into()
    }
}

impl DbErrorIntrospect for DbError {
    fn is_sentry_event(&self) -> bool {
        match &self.kind {
            DbErrorKind::Common(k) => !matches!(
                k,
                CommonDbErrorKind::CollectionNotFound
                    | CommonDbErrorKind::BsoNotFound
                    | CommonDbErrorKind::BatchNotFound
                    | CommonDbErrorKind::Conflict
                    | CommonDbErrorKind::Quota
                    | CommonDbErrorKind::Busy
            ),
            DbErrorKind::Mysql(_) => true,
        }
    }

    fn metric_label(&self) -> Option<String> {
        match &self.kind {
            DbErrorKind::Common(CommonDbErrorKind::Conflict) => Some("storage.conflict".to_owned()),
            DbErrorKind::Common(CommonDbErrorKind::Quota) => Some("storage.quota".to_owned()),
            DbErrorKind::Common(CommonDbErrorKind::Busy) => Some("storage.busy".to_owned()),
            DbErrorKind::Mysql(_) => Some("storage.mysql.error".to_owned()),
            _ => None,
        }
    }

    fn is_collection_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::Common(CommonDbErrorKind::CollectionNotFound))
    }

    fn is_conflict(&self) -> bool {
        matches!(self.kind, DbErrorKind::Common(CommonDbErrorKind::Conflict))
    }

    fn is_quota(&self) -> bool {
        matches!(self.kind, DbErrorKind::Common(CommonDbErrorKind::Quota))
    }

    fn is_bso_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::Common(CommonDbErrorKind::BsoNotFound))
    }

    fn is_batch_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::Common(CommonDbErrorKind::BatchNotFound))
    }

    fn is_busy(&self) -> bool {
        matches!(self.kind, DbErrorKind::Common(CommonDbErrorKind::Busy))
    }

    fn busy() -> Self {
        DbError::busy()
    }
}

impl ReportableError for DbError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        DbErrorIntrospect::is_sentry_event(self)
    }

    fn metric_label(&self) -> Option<String> {
        DbErrorIntrospect::metric_label(self)
    }
}

impl InternalError for DbError {
    fn internal_error(message: String) -> Self {
        DbError::internal(message)
    }
}

impl_fmt_display!(DbError, DbErrorKind);

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

from_error!(CommonDbError, DbError, |error: CommonDbError| DbError::from(
    DbErrorKind::Common(error.kind)
));

impl From<diesel::result::Error> for DbError {
    fn from(error: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};
        match error {
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _)
            | DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                DbError::conflict()
            }
            e => DbErrorKind::Mysql(e.to_string()).into(),
        }
    }
}

impl From<diesel::result::ConnectionError> for DbError {
    fn from(error: diesel::result::ConnectionError) -> Self {
        DbErrorKind::Mysql(error.to_string()).into()
    }
}

impl From<diesel_migrations::RunMigrationsError> for DbError {
    fn from(error: diesel_migrations::RunMigrationsError) -> Self {
        DbErrorKind::Mysql(error.to_string()).into()
    }
}
