//! The relational reference storage backend (SPEC_FULL.md §4.2): implements `Db`/`DbPool`/
//! `BatchDb` from `syncstore-db-common` against MySQL via `diesel`/`diesel-async`.

#![allow(non_local_definitions)]
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate diesel_migrations;
#[macro_use]
extern crate slog_scope;

mod batch;
mod error;
mod models;
mod pool;
mod schema;
#[cfg(test)]
mod test;

pub use error::DbError;
pub use models::MysqlDb;
pub use pool::MysqlDbPool;

pub(crate) type DbResult<T> = Result<T, DbError>;
