//! The HTTP surface (SPEC_FULL.md §6): actix-web handlers, extractors, the precondition/
//! transaction wrapper, and the error taxonomy that turns storage-layer failures into the wire
//! error contract. Ties together `syncstore-settings`, `syncstore-mysql` and `syncstore-cache`
//! into one running service.

#[macro_use]
extern crate slog_scope;

pub mod error;
pub mod logging;
pub mod middleware;
pub mod server;
pub mod web;

pub use error::{ApiError, ApiErrorKind, ApiResult};
pub use server::Server;
