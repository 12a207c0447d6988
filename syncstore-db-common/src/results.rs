use std::collections::HashMap;

use serde::Serialize;

use super::{params, util::SyncTimestamp};

pub type LockCollection = ();
pub type GetBsoTimestamp = SyncTimestamp;
pub type GetCollectionTimestamps = HashMap<String, SyncTimestamp>;
pub type GetCollectionTimestamp = SyncTimestamp;
pub type GetCollectionCounts = HashMap<String, i64>;
pub type GetCollectionUsage = HashMap<String, i64>;
pub type GetStorageTimestamp = SyncTimestamp;
pub type GetStorageUsage = u64;
pub type DeleteStorage = ();
pub type DeleteCollection = SyncTimestamp;
pub type DeleteBsos = SyncTimestamp;
pub type DeleteBso = SyncTimestamp;
pub type PutBso = SyncTimestamp;

#[derive(Debug, Default, Clone)]
pub struct CreateBatch {
    pub id: String,
    pub size: Option<usize>,
}

pub type ValidateBatch = bool;
pub type AppendToBatch = ();
pub type GetBatch = params::Batch;
pub type DeleteBatch = ();
pub type CommitBatch = SyncTimestamp;
pub type Check = bool;

#[derive(Debug, Default, Clone, Serialize)]
pub struct GetQuotaUsage {
    pub total_bytes: usize,
    pub count: i32,
}

/// A single BSO row as returned to callers. Backend crates (e.g. `syncstore-mysql`) derive their
/// own `Queryable`/`QueryableByName` wrapper around the equivalent columns and convert into this.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GetBso {
    pub id: String,
    pub modified: SyncTimestamp,
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sortindex: Option<i32>,
    // Never rendered to clients; only loaded where a backend needs it internally.
    #[serde(skip_serializing)]
    pub expiry: i64,
}

#[derive(Debug, Default, Clone)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub offset: Option<String>,
}

pub type GetBsos = Paginated<GetBso>;
pub type GetBsoIds = Paginated<String>;

#[derive(Debug, Default, Clone)]
pub struct PostBsos {
    pub modified: SyncTimestamp,
    pub success: Vec<String>,
    pub failed: HashMap<String, String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConnectionInfo {
    /// Age (in seconds) of the pooled connection handling the current request.
    pub age: u32,
}

pub type GetCollectionId = i32;
pub type CreateCollection = i32;
pub type UpdateCollection = SyncTimestamp;
