//! `FromRequest` implementations for every route (spec.md §4.1/§6): path/query/header/body
//! parsing, validation, and the metrics-label plumbing they all share.

pub mod batch_bso_body;
pub mod batch_request;
pub mod bso_body;
pub mod bso_bodies;
pub mod bso_param;
pub mod bso_put_request;
pub mod bso_query_params;
pub mod bso_request;
pub mod collection_param;
pub mod collection_post_request;
pub mod collection_request;
pub mod constants;
pub mod heartbeat_request;
pub mod meta_request;
pub mod metrics;
pub mod precondition_header;
pub mod test_error_request;
pub mod user_id;
pub mod utils;
pub mod validation;

pub use batch_request::{BatchRequest, BatchRequestOpt};
pub use bso_body::BsoBody;
pub use bso_bodies::BsoBodies;
pub use bso_param::BsoParam;
pub use bso_put_request::BsoPutRequest;
pub use bso_query_params::BsoQueryParams;
pub use bso_request::BsoRequest;
pub use collection_param::CollectionParam;
pub use collection_post_request::CollectionPostRequest;
pub use collection_request::{CollectionRequest, ReplyFormat};
pub use heartbeat_request::HeartbeatRequest;
pub use meta_request::MetaRequest;
pub use metrics::EmitApiMetric;
pub use precondition_header::{PreConditionHeader, PreConditionHeaderOpt};
pub use test_error_request::TestErrorRequest;
pub use user_id::UserIdExtractor;
