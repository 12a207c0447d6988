//! Shared vocabulary for storage backends: the `Db`/`DbPool`/`BatchDb` async traits, their
//! parameter/result types, the reserved collection-name table, and the common error taxonomy.
//! A concrete backend (e.g. `syncstore-mysql`) implements these traits; nothing above this layer
//! needs to know which backend is in play (§4.2, §9).

#[macro_use]
extern crate diesel;

pub mod error;
pub mod params;
pub mod results;
pub mod util;

use std::fmt::Debug;

use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use lazy_static::lazy_static;

pub use error::{CommonDbError, CommonDbErrorKind, DbErrorIntrospect};
pub use util::SyncTimestamp;

pub type DbFuture<'a, T, E> = LocalBoxFuture<'a, Result<T, E>>;

/// A mockable r2d2/deadpool pool state.
#[derive(Debug, Default)]
pub struct PoolState {
    pub connections: u32,
    pub idle_connections: u32,
}

impl From<diesel::r2d2::State> for PoolState {
    fn from(state: diesel::r2d2::State) -> PoolState {
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

impl From<deadpool::Status> for PoolState {
    fn from(status: deadpool::Status) -> PoolState {
        PoolState {
            connections: status.size as u32,
            idle_connections: status.available.max(0) as u32,
        }
    }
}

pub trait GetPoolState {
    fn state(&self) -> PoolState;
}

lazy_static! {
    /// Reserved collection names and ids (§3's "well-known collections" set), pre-seeded so the
    /// overwhelming majority of collection lookups never touch the `collections` table.
    pub static ref STD_COLLS: Vec<(i32, &'static str)> = {
        vec![
            (1, "clients"),
            (2, "crypto"),
            (3, "forms"),
            (4, "history"),
            (5, "keys"),
            (6, "meta"),
            (7, "bookmarks"),
            (8, "prefs"),
            (9, "tabs"),
            (10, "passwords"),
            (11, "addons"),
            (12, "addresses"),
            (13, "creditcards"),
        ]
    };
}

/// The first id handed out to a collection name outside the reserved set.
pub const FIRST_CUSTOM_COLLECTION_ID: i32 = 101;

/// Collection id reserved for per-user delete-tombstone rows in `user_collections` (§4.2).
pub const TOMBSTONE: i32 = 0;

/// How long a staged batch upload remains valid, in centiseconds (2 hours).
pub const BATCH_LIFETIME: i64 = 2 * 60 * 60 * 100;

/// The default ttl (in seconds) assigned to a BSO that doesn't specify one: effectively
/// unbounded (~66 years).
pub const DEFAULT_BSO_TTL: u32 = 2_100_000_000;

/// Identifies the owning user of a request. Deliberately minimal: this crate's scope is storage,
/// not authentication, so the identifier carries only what storage needs to shard and scope rows
/// (§3's "User scope" sharding by `user_id mod N`).
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct UserIdentifier {
    pub legacy_id: u64,
}

impl UserIdentifier {
    pub fn new(legacy_id: u64) -> Self {
        Self { legacy_id }
    }
}

impl From<u64> for UserIdentifier {
    fn from(legacy_id: u64) -> Self {
        Self { legacy_id }
    }
}

/// Requested ordering for a BSO range query (§4.1's filter-set table).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Sorting {
    None,
    Newest,
    Oldest,
    Index,
}

impl Default for Sorting {
    fn default() -> Self {
        Sorting::None
    }
}

/// A connection pool over some storage backend.
#[async_trait]
pub trait DbPool: Sync + Send + Debug + GetPoolState {
    type Error;

    async fn init(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn get(&self) -> Result<Box<dyn Db<Error = Self::Error>>, Self::Error>;

    fn validate_batch_id(&self, id: String) -> Result<(), Self::Error>;

    fn box_clone(&self) -> Box<dyn DbPool<Error = Self::Error>>;
}

impl<E> Clone for Box<dyn DbPool<Error = E>> {
    fn clone(&self) -> Box<dyn DbPool<Error = E>> {
        self.box_clone()
    }
}

/// A single storage-backend connection, scoped to one request's worth of work. `Db` methods
/// correspond 1:1 to the operations named throughout spec.md §4.1/§4.2/§4.5.
#[async_trait(?Send)]
pub trait Db: BatchDb {
    async fn lock_for_read(&mut self, params: params::LockCollection) -> Result<(), Self::Error>;

    async fn lock_for_write(&mut self, params: params::LockCollection) -> Result<(), Self::Error>;

    async fn begin(&mut self, for_write: bool) -> Result<(), Self::Error>;

    async fn commit(&mut self) -> Result<(), Self::Error>;

    async fn rollback(&mut self) -> Result<(), Self::Error>;

    async fn get_collection_timestamps(
        &mut self,
        user_id: params::GetCollectionTimestamps,
    ) -> Result<results::GetCollectionTimestamps, Self::Error>;

    async fn get_collection_timestamp(
        &mut self,
        params: params::GetCollectionTimestamp,
    ) -> Result<results::GetCollectionTimestamp, Self::Error>;

    async fn get_collection_counts(
        &mut self,
        user_id: params::GetCollectionCounts,
    ) -> Result<results::GetCollectionCounts, Self::Error>;

    async fn get_collection_usage(
        &mut self,
        user_id: params::GetCollectionUsage,
    ) -> Result<results::GetCollectionUsage, Self::Error>;

    async fn get_storage_timestamp(
        &mut self,
        user_id: params::GetStorageTimestamp,
    ) -> Result<results::GetStorageTimestamp, Self::Error>;

    async fn get_storage_usage(
        &mut self,
        user_id: params::GetStorageUsage,
    ) -> Result<results::GetStorageUsage, Self::Error>;

    async fn get_quota_usage(
        &mut self,
        params: params::GetQuotaUsage,
    ) -> Result<results::GetQuotaUsage, Self::Error>;

    async fn delete_storage(
        &mut self,
        user_id: params::DeleteStorage,
    ) -> Result<results::DeleteStorage, Self::Error>;

    async fn delete_collection(
        &mut self,
        params: params::DeleteCollection,
    ) -> Result<results::DeleteCollection, Self::Error>;

    async fn delete_bsos(
        &mut self,
        params: params::DeleteBsos,
    ) -> Result<results::DeleteBsos, Self::Error>;

    async fn get_bsos(&mut self, params: params::GetBsos) -> Result<results::GetBsos, Self::Error>;

    async fn get_bso_ids(
        &mut self,
        params: params::GetBsoIds,
    ) -> Result<results::GetBsoIds, Self::Error>;

    async fn post_bsos(
        &mut self,
        params: params::PostBsos,
    ) -> Result<results::PostBsos, Self::Error>;

    async fn delete_bso(
        &mut self,
        params: params::DeleteBso,
    ) -> Result<results::DeleteBso, Self::Error>;

    async fn get_bso(
        &mut self,
        params: params::GetBso,
    ) -> Result<Option<results::GetBso>, Self::Error>;

    async fn get_bso_timestamp(
        &mut self,
        params: params::GetBsoTimestamp,
    ) -> Result<results::GetBsoTimestamp, Self::Error>;

    async fn put_bso(&mut self, params: params::PutBso) -> Result<results::PutBso, Self::Error>;

    async fn check(&mut self) -> Result<results::Check, Self::Error>;

    async fn get_collection_id(
        &mut self,
        name: String,
    ) -> Result<results::GetCollectionId, Self::Error>;

    async fn create_collection(
        &mut self,
        name: String,
    ) -> Result<results::CreateCollection, Self::Error>;

    async fn update_collection(
        &mut self,
        params: params::UpdateCollection,
    ) -> Result<results::UpdateCollection, Self::Error>;

    fn get_connection_info(&self) -> results::ConnectionInfo;

    /// The request-frozen timestamp all writes in this connection's current transaction use.
    fn timestamp(&self) -> SyncTimestamp;

    fn set_timestamp(&mut self, timestamp: SyncTimestamp);

    fn clear_coll_cache(&mut self);

    fn set_quota(&mut self, enabled: bool, limit: usize, enforced: bool);

    /// The last-modified timestamp the precondition machinery (§7) should compare against for a
    /// request targeting `collection`/`bso` (or the whole storage if both are `None`). A missing
    /// collection/bso reads as timestamp zero rather than propagating not-found, since "nothing
    /// here yet" is a valid precondition target.
    async fn extract_resource(
        &mut self,
        user_id: UserIdentifier,
        collection: Option<String>,
        bso: Option<String>,
    ) -> Result<SyncTimestamp, Self::Error> {
        let collection = match collection {
            None => return self.get_storage_timestamp(user_id).await,
            Some(collection) => collection,
        };
        let result = match bso {
            None => {
                self.get_collection_timestamp(params::GetCollectionTimestamp {
                    user_id,
                    collection,
                })
                .await
            }
            Some(id) => {
                self.get_bso_timestamp(params::GetBsoTimestamp {
                    user_id,
                    collection,
                    id,
                })
                .await
            }
        };
        result.or_else(|e| {
            if e.is_collection_not_found() || e.is_bso_not_found() {
                Ok(SyncTimestamp::from_seconds(0f64))
            } else {
                Err(e)
            }
        })
    }
}

/// Batch-upload staging (§4.1 supplement: the client-facing `?batch=true[&commit=true]`
/// protocol), kept as a sub-trait so backends that implement it can share method-forwarding
/// boilerplate (`batch_db_method!`-style macros) without bloating `Db` itself.
#[async_trait(?Send)]
pub trait BatchDb: Debug {
    type Error: DbErrorIntrospect + 'static;

    async fn create_batch(
        &mut self,
        params: params::CreateBatch,
    ) -> Result<results::CreateBatch, Self::Error>;

    async fn validate_batch(
        &mut self,
        params: params::ValidateBatch,
    ) -> Result<results::ValidateBatch, Self::Error>;

    async fn append_to_batch(
        &mut self,
        params: params::AppendToBatch,
    ) -> Result<results::AppendToBatch, Self::Error>;

    async fn get_batch(
        &mut self,
        params: params::GetBatch,
    ) -> Result<Option<results::GetBatch>, Self::Error>;

    async fn commit_batch(
        &mut self,
        params: params::CommitBatch,
    ) -> Result<results::CommitBatch, Self::Error>;

    async fn delete_batch(
        &mut self,
        params: params::DeleteBatch,
    ) -> Result<results::DeleteBatch, Self::Error>;
}

/// Collections whose names appear in more than one request get interned to a small integer id
/// by `syncstore-mysql`'s `CollectionCache`; this map is exposed here so other crates (the
/// coherence cache, the HTTP layer) can share the same reserved-name vocabulary.
pub fn reserved_collection_id(name: &str) -> Option<i32> {
    STD_COLLS
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(id, _)| *id)
}

pub fn reserved_collection_name(id: i32) -> Option<&'static str> {
    STD_COLLS.iter().find(|(i, _)| *i == id).map(|(_, n)| *n)
}
