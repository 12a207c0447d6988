//! A per-user read-through / write-invalidate cache of collection timestamps and counts,
//! layered over any `Db` implementation as a decorator (spec.md §4.3, §9).
//!
//! The storage backend (`syncstore-mysql`) remains the single source of truth: this cache is
//! advisory only, shared process-wide, and may be dropped or invalidated at any point without
//! affecting correctness — only latency. A write through the cache always updates the backend
//! first; the in-memory entry is only updated once the backend write has actually succeeded, and
//! is evicted (rather than left stale) if the backend write fails.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use syncstore_db_common::{
    params, results, BatchDb, Db, DbErrorIntrospect, SyncTimestamp,
};

/// Per-collection cached state: the denormalized `(last_modified, count)` pair a `Db`
/// implementation otherwise has to hit `user_collections` for.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectionState {
    pub last_modified: SyncTimestamp,
    pub count: i64,
}

/// Collections that get a tighter per-day write-rate cap than the default (§4.3's "ephemeral
/// `tabs` collection" special case — handled entirely as a cache-layer policy, not a storage
/// schema difference: `tabs` is an ordinary reserved collection id in `syncstore-mysql`).
const TIGHT_BUDGET_COLLECTIONS: &[&str] = &["tabs"];

const DEFAULT_DAILY_WRITE_BYTES: u64 = 100 * 1024 * 1024;
const TIGHT_DAILY_WRITE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Default)]
struct UserEntry {
    collections: HashMap<String, CollectionState>,
    /// bytes written today, per collection, for the write-rate cap.
    written_bytes: HashMap<String, u64>,
    day: u64,
}

fn today() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 86_400
}

/// The shared, process-wide cache map. Partitioned by `user_id` so concurrent requests for
/// different users never contend on the same lock (§5's "process-wide partitioned-by-user_id
/// cache").
#[derive(Debug, Default, Clone)]
pub struct CollectionCoherence {
    users: Arc<RwLock<HashMap<u64, UserEntry>>>,
}

impl CollectionCoherence {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_budget(collection: &str) -> u64 {
        if TIGHT_BUDGET_COLLECTIONS.contains(&collection) {
            TIGHT_DAILY_WRITE_BYTES
        } else {
            DEFAULT_DAILY_WRITE_BYTES
        }
    }

    /// Returns `Err` ("server busy") if accepting `bytes` more for `collection` today would
    /// exceed its daily write-rate cap.
    pub fn check_write_budget(&self, user_id: u64, collection: &str, bytes: u64) -> Result<(), ()> {
        let mut users = self.users.write().unwrap();
        let entry = users.entry(user_id).or_default();
        let day = today();
        if entry.day != day {
            entry.day = day;
            entry.written_bytes.clear();
        }
        let used = entry.written_bytes.entry(collection.to_owned()).or_insert(0);
        if *used + bytes > Self::write_budget(collection) {
            return Err(());
        }
        *used += bytes;
        Ok(())
    }

    pub fn get(&self, user_id: u64, collection: &str) -> Option<CollectionState> {
        self.users
            .read()
            .unwrap()
            .get(&user_id)
            .and_then(|entry| entry.collections.get(collection).copied())
    }

    pub fn get_all(&self, user_id: u64) -> HashMap<String, CollectionState> {
        self.users
            .read()
            .unwrap()
            .get(&user_id)
            .map(|entry| entry.collections.clone())
            .unwrap_or_default()
    }

    pub fn put(&self, user_id: u64, collection: &str, state: CollectionState) {
        let mut users = self.users.write().unwrap();
        let entry = users.entry(user_id).or_default();
        entry.collections.insert(collection.to_owned(), state);
    }

    /// Drops a single collection's cached entry; used whenever a backend write for that
    /// collection either failed or can't be trusted (e.g. a delete of the whole collection).
    pub fn invalidate(&self, user_id: u64, collection: &str) {
        if let Some(entry) = self.users.write().unwrap().get_mut(&user_id) {
            entry.collections.remove(collection);
        }
    }

    /// Drops every cached entry for a user, e.g. on `DELETE /storage`.
    pub fn invalidate_all(&self, user_id: u64) {
        self.users.write().unwrap().remove(&user_id);
    }
}

/// Wraps a backend `Db` with the read-through/write-invalidate coherence layer above. Generic
/// over the backend's error type so it can sit in front of any `Db` implementation.
pub struct CoherentDb<E> {
    inner: Box<dyn Db<Error = E>>,
    coherence: CollectionCoherence,
    user_id: u64,
}

impl<E> std::fmt::Debug for CoherentDb<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherentDb").finish()
    }
}

impl<E> CoherentDb<E> {
    pub fn new(inner: Box<dyn Db<Error = E>>, coherence: CollectionCoherence, user_id: u64) -> Self {
        Self {
            inner,
            coherence,
            user_id,
        }
    }
}

#[async_trait(?Send)]
impl<E: DbErrorIntrospect + 'static> BatchDb for CoherentDb<E> {
    type Error = E;

    async fn create_batch(&mut self, params: params::CreateBatch) -> Result<results::CreateBatch, E> {
        self.inner.create_batch(params).await
    }

    async fn validate_batch(
        &mut self,
        params: params::ValidateBatch,
    ) -> Result<results::ValidateBatch, E> {
        self.inner.validate_batch(params).await
    }

    async fn append_to_batch(
        &mut self,
        params: params::AppendToBatch,
    ) -> Result<results::AppendToBatch, E> {
        let bytes: u64 = params
            .bsos
            .iter()
            .filter_map(|bso| bso.payload.as_ref())
            .map(|p| p.len() as u64)
            .sum();
        self.check_write_budget(&params.collection, bytes)?;
        self.inner.append_to_batch(params).await
    }

    async fn get_batch(&mut self, params: params::GetBatch) -> Result<Option<results::GetBatch>, E> {
        self.inner.get_batch(params).await
    }

    async fn commit_batch(&mut self, params: params::CommitBatch) -> Result<results::CommitBatch, E> {
        let collection = params.batch.id.clone();
        let result = self.inner.commit_batch(params).await;
        if result.is_err() {
            self.coherence.invalidate(self.user_id, &collection);
        }
        result
    }

    async fn delete_batch(&mut self, params: params::DeleteBatch) -> Result<results::DeleteBatch, E> {
        self.inner.delete_batch(params).await
    }
}

#[async_trait(?Send)]
impl<E: DbErrorIntrospect + 'static> Db for CoherentDb<E> {
    async fn lock_for_read(&mut self, params: params::LockCollection) -> Result<(), E> {
        self.inner.lock_for_read(params).await
    }

    async fn lock_for_write(&mut self, params: params::LockCollection) -> Result<(), E> {
        self.inner.lock_for_write(params).await
    }

    async fn begin(&mut self, for_write: bool) -> Result<(), E> {
        self.inner.begin(for_write).await
    }

    async fn commit(&mut self) -> Result<(), E> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<(), E> {
        self.inner.rollback().await
    }

    async fn get_collection_timestamps(
        &mut self,
        user_id: params::GetCollectionTimestamps,
    ) -> Result<results::GetCollectionTimestamps, E> {
        // A multi-collection read always goes through to the backend: partial cache coverage
        // would require per-collection fallback queries that cost more than one round trip.
        self.inner.get_collection_timestamps(user_id).await
    }

    async fn get_collection_timestamp(
        &mut self,
        params: params::GetCollectionTimestamp,
    ) -> Result<results::GetCollectionTimestamp, E> {
        if let Some(state) = self.coherence.get(self.user_id, &params.collection) {
            return Ok(state.last_modified);
        }
        let collection = params.collection.clone();
        let result = self.inner.get_collection_timestamp(params).await?;
        let count = self
            .coherence
            .get(self.user_id, &collection)
            .map(|s| s.count)
            .unwrap_or_default();
        self.coherence.put(
            self.user_id,
            &collection,
            CollectionState {
                last_modified: result,
                count,
            },
        );
        Ok(result)
    }

    async fn get_collection_counts(
        &mut self,
        user_id: params::GetCollectionCounts,
    ) -> Result<results::GetCollectionCounts, E> {
        self.inner.get_collection_counts(user_id).await
    }

    async fn get_collection_usage(
        &mut self,
        user_id: params::GetCollectionUsage,
    ) -> Result<results::GetCollectionUsage, E> {
        self.inner.get_collection_usage(user_id).await
    }

    async fn get_storage_timestamp(
        &mut self,
        user_id: params::GetStorageTimestamp,
    ) -> Result<results::GetStorageTimestamp, E> {
        self.inner.get_storage_timestamp(user_id).await
    }

    async fn get_storage_usage(
        &mut self,
        user_id: params::GetStorageUsage,
    ) -> Result<results::GetStorageUsage, E> {
        self.inner.get_storage_usage(user_id).await
    }

    async fn get_quota_usage(
        &mut self,
        params: params::GetQuotaUsage,
    ) -> Result<results::GetQuotaUsage, E> {
        self.inner.get_quota_usage(params).await
    }

    async fn delete_storage(&mut self, user_id: params::DeleteStorage) -> Result<(), E> {
        let result = self.inner.delete_storage(user_id).await;
        self.coherence.invalidate_all(self.user_id);
        result
    }

    async fn delete_collection(
        &mut self,
        params: params::DeleteCollection,
    ) -> Result<results::DeleteCollection, E> {
        let collection = params.collection.clone();
        let result = self.inner.delete_collection(params).await;
        self.coherence.invalidate(self.user_id, &collection);
        result
    }

    async fn delete_bsos(&mut self, params: params::DeleteBsos) -> Result<results::DeleteBsos, E> {
        let collection = params.collection.clone();
        let result = self.inner.delete_bsos(params).await;
        match &result {
            Ok(modified) => self.update_cache_after_write(&collection, *modified, None),
            Err(_) => self.coherence.invalidate(self.user_id, &collection),
        }
        result
    }

    async fn get_bsos(&mut self, params: params::GetBsos) -> Result<results::GetBsos, E> {
        self.inner.get_bsos(params).await
    }

    async fn get_bso_ids(&mut self, params: params::GetBsoIds) -> Result<results::GetBsoIds, E> {
        self.inner.get_bso_ids(params).await
    }

    async fn post_bsos(&mut self, params: params::PostBsos) -> Result<results::PostBsos, E> {
        let collection = params.collection.clone();
        let bytes: u64 = params
            .bsos
            .iter()
            .filter_map(|bso| bso.payload.as_ref())
            .map(|p| p.len() as u64)
            .sum();
        self.check_write_budget(&collection, bytes)?;
        let result = self.inner.post_bsos(params).await;
        match &result {
            Ok(posted) => self.update_cache_after_write(&collection, posted.modified, None),
            Err(_) => self.coherence.invalidate(self.user_id, &collection),
        }
        result
    }

    async fn delete_bso(&mut self, params: params::DeleteBso) -> Result<results::DeleteBso, E> {
        let collection = params.collection.clone();
        let result = self.inner.delete_bso(params).await;
        match &result {
            Ok(modified) => self.update_cache_after_write(&collection, *modified, None),
            Err(_) => self.coherence.invalidate(self.user_id, &collection),
        }
        result
    }

    async fn get_bso(&mut self, params: params::GetBso) -> Result<Option<results::GetBso>, E> {
        self.inner.get_bso(params).await
    }

    async fn get_bso_timestamp(
        &mut self,
        params: params::GetBsoTimestamp,
    ) -> Result<results::GetBsoTimestamp, E> {
        self.inner.get_bso_timestamp(params).await
    }

    async fn put_bso(&mut self, params: params::PutBso) -> Result<results::PutBso, E> {
        let collection = params.collection.clone();
        let bytes = params.payload.as_ref().map_or(0, |p| p.len() as u64);
        self.check_write_budget(&collection, bytes)?;
        let result = self.inner.put_bso(params).await;
        match &result {
            Ok(modified) => self.update_cache_after_write(&collection, *modified, None),
            Err(_) => self.coherence.invalidate(self.user_id, &collection),
        }
        result
    }

    async fn check(&mut self) -> Result<results::Check, E> {
        self.inner.check().await
    }

    async fn get_collection_id(&mut self, name: String) -> Result<results::GetCollectionId, E> {
        self.inner.get_collection_id(name).await
    }

    async fn create_collection(&mut self, name: String) -> Result<results::CreateCollection, E> {
        self.inner.create_collection(name).await
    }

    async fn update_collection(
        &mut self,
        params: params::UpdateCollection,
    ) -> Result<results::UpdateCollection, E> {
        let collection = params.collection.clone();
        let result = self.inner.update_collection(params).await;
        match &result {
            Ok(modified) => self.update_cache_after_write(&collection, *modified, None),
            Err(_) => self.coherence.invalidate(self.user_id, &collection),
        }
        result
    }

    fn get_connection_info(&self) -> results::ConnectionInfo {
        self.inner.get_connection_info()
    }

    fn timestamp(&self) -> SyncTimestamp {
        self.inner.timestamp()
    }

    fn set_timestamp(&mut self, timestamp: SyncTimestamp) {
        self.inner.set_timestamp(timestamp)
    }

    fn clear_coll_cache(&mut self) {
        self.coherence.invalidate_all(self.user_id);
        self.inner.clear_coll_cache();
    }

    fn set_quota(&mut self, enabled: bool, limit: usize, enforced: bool) {
        self.inner.set_quota(enabled, limit, enforced)
    }
}

impl<E: DbErrorIntrospect> CoherentDb<E> {
    /// Enforces §4.3's per-user daily write-rate cap before a write reaches the backend: a
    /// write that would push the day's bytes-written total for `collection` over budget fails
    /// with `E::busy()` and never touches the database.
    fn check_write_budget(&self, collection: &str, bytes: u64) -> Result<(), E> {
        if bytes == 0 {
            return Ok(());
        }
        self.coherence
            .check_write_budget(self.user_id, collection, bytes)
            .map_err(|_| E::busy())
    }
}

impl<E> CoherentDb<E> {
    fn update_cache_after_write(&self, collection: &str, modified: SyncTimestamp, count: Option<i64>) {
        let count = count.unwrap_or_else(|| {
            self.coherence
                .get(self.user_id, collection)
                .map(|s| s.count)
                .unwrap_or_default()
        });
        self.coherence.put(
            self.user_id,
            collection,
            CollectionState {
                last_modified: modified,
                count,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_through_and_write_invalidate() {
        let coherence = CollectionCoherence::new();
        assert!(coherence.get(1, "bookmarks").is_none());

        coherence.put(
            1,
            "bookmarks",
            CollectionState {
                last_modified: SyncTimestamp::from_seconds(10.0),
                count: 3,
            },
        );
        assert_eq!(coherence.get(1, "bookmarks").unwrap().count, 3);

        coherence.invalidate(1, "bookmarks");
        assert!(coherence.get(1, "bookmarks").is_none());
    }

    #[test]
    fn per_user_isolation() {
        let coherence = CollectionCoherence::new();
        coherence.put(
            1,
            "tabs",
            CollectionState {
                last_modified: SyncTimestamp::zero(),
                count: 1,
            },
        );
        assert!(coherence.get(2, "tabs").is_none());
    }

    #[test]
    fn write_budget_caps_tight_collections_lower() {
        let coherence = CollectionCoherence::new();
        assert!(coherence
            .check_write_budget(1, "tabs", TIGHT_DAILY_WRITE_BYTES - 1)
            .is_ok());
        assert!(coherence.check_write_budget(1, "tabs", 2).is_err());
    }

    #[test]
    fn invalidate_all_clears_every_collection() {
        let coherence = CollectionCoherence::new();
        coherence.put(1, "bookmarks", CollectionState::default());
        coherence.put(1, "history", CollectionState::default());
        coherence.invalidate_all(1);
        assert!(coherence.get_all(1).is_empty());
    }
}
