//! actix-web middleware layered onto every route (spec.md §6/§7): rejecting known-broken clients
//! and stamping `X-Weave-Timestamp` on the way out.

pub mod rejectua;
pub mod weave;

pub use rejectua::RejectUA;
pub use weave::WeaveTimestamp;
