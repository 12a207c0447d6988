//! `MysqlDb`: one pooled connection plus the per-request session state spec.md's transactional
//! operations (§4.2, §4.4) need — the frozen timestamp, the locks taken so far, and a small
//! cache of collection timestamps already read this transaction.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use diesel::{
    delete,
    dsl::{max, sql},
    sql_query,
    sql_types::{BigInt, Integer, Nullable, Text},
    ExpressionMethods, OptionalExtension, QueryDsl,
};
use diesel_async::{AsyncConnection, RunQueryDsl, TransactionManager};
use syncstore_common::Metrics;
use syncstore_db_common::{
    error::DbErrorIntrospect, params, results, util::SyncTimestamp, BatchDb, Db, Sorting,
    UserIdentifier, DEFAULT_BSO_TTL, TOMBSTONE,
};
use syncstore_settings::{Quota, DEFAULT_MAX_TOTAL_RECORDS};

use super::{
    batch::{self, batch_db_method},
    pool::{CollectionCache, Conn},
    schema::{bso, collections, user_collections},
    DbError, DbResult,
};

static DEFAULT_LIMIT: u32 = DEFAULT_MAX_TOTAL_RECORDS;

#[derive(Debug)]
enum CollectionLock {
    Read,
    Write,
}

/// Per-connection state that lives only as long as the request handling it (§4.4: the timestamp
/// freezes for the lifetime of one request's transaction; the other fields avoid repeat reads/
/// locks within that same transaction).
#[derive(Debug, Default)]
struct MysqlDbSession {
    timestamp: SyncTimestamp,
    coll_modified_cache: HashMap<(u32, i32), SyncTimestamp>,
    coll_locks: HashMap<(u32, i32), CollectionLock>,
    in_transaction: bool,
    in_write_transaction: bool,
}

pub struct MysqlDb {
    pub(super) conn: Conn,
    session: MysqlDbSession,
    coll_cache: Arc<CollectionCache>,
    metrics: Metrics,
    quota: Quota,
}

impl fmt::Debug for MysqlDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlDb")
            .field("session", &self.session)
            .field("quota", &self.quota)
            .finish()
    }
}

impl MysqlDb {
    pub(super) fn new(
        conn: Conn,
        coll_cache: Arc<CollectionCache>,
        metrics: &Metrics,
        quota: &Quota,
    ) -> Self {
        MysqlDb {
            conn,
            session: Default::default(),
            coll_cache,
            metrics: metrics.clone(),
            quota: *quota,
        }
    }

    /// Locks the matching `user_collections` row: `SELECT ... LOCK IN SHARE MODE` for reads,
    /// `SELECT ... FOR UPDATE` for writes (§4.4's "collection-level serialization").
    async fn lock_for_read(&mut self, params: params::LockCollection) -> DbResult<()> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self
            .get_collection_id(params.collection.clone())
            .await
            .or_else(|e| if e.is_collection_not_found() { Ok(0) } else { Err(e) })?;

        if self
            .session
            .coll_locks
            .contains_key(&(user_id as u32, collection_id))
        {
            return Ok(());
        }

        self.begin(false).await?;
        let modified = user_collections::table
            .select(user_collections::modified)
            .filter(user_collections::user_id.eq(user_id))
            .filter(user_collections::collection_id.eq(collection_id))
            .for_share()
            .first(&mut self.conn)
            .await
            .optional()?;
        if let Some(modified) = modified {
            let modified = SyncTimestamp::from_i64(modified)?;
            self.session
                .coll_modified_cache
                .insert((user_id as u32, collection_id), modified);
        }
        self.session
            .coll_locks
            .insert((user_id as u32, collection_id), CollectionLock::Read);
        Ok(())
    }

    async fn lock_for_write(&mut self, params: params::LockCollection) -> DbResult<()> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self
            .get_or_create_collection_id(params.collection.clone())
            .await?;
        if let Some(CollectionLock::Read) = self
            .session
            .coll_locks
            .get(&(user_id as u32, collection_id))
        {
            return Err(DbError::internal(
                "Can't escalate read-lock to write-lock".to_owned(),
            ));
        }

        self.begin(true).await?;
        let modified = user_collections::table
            .select(user_collections::modified)
            .filter(user_collections::user_id.eq(user_id))
            .filter(user_collections::collection_id.eq(collection_id))
            .for_update()
            .first(&mut self.conn)
            .await
            .optional()?;
        if let Some(modified) = modified {
            let modified = SyncTimestamp::from_i64(modified)?;
            // A write that wouldn't strictly advance the collection's timestamp would violate
            // §4.4's monotonicity guarantee, so it's refused as a conflict rather than silently
            // collapsed into the prior write.
            if modified >= self.timestamp() {
                return Err(DbError::conflict());
            }
            self.session
                .coll_modified_cache
                .insert((user_id as u32, collection_id), modified);
        }
        self.session
            .coll_locks
            .insert((user_id as u32, collection_id), CollectionLock::Write);
        Ok(())
    }

    pub(super) async fn begin(&mut self, for_write: bool) -> DbResult<()> {
        <Conn as AsyncConnection>::TransactionManager::begin_transaction(&mut self.conn).await?;
        self.session.in_transaction = true;
        if for_write {
            self.session.in_write_transaction = true;
        }
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        if self.session.in_transaction {
            <Conn as AsyncConnection>::TransactionManager::commit_transaction(&mut self.conn)
                .await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if self.session.in_transaction {
            <Conn as AsyncConnection>::TransactionManager::rollback_transaction(&mut self.conn)
                .await?;
        }
        Ok(())
    }

    /// Preserves the storage-level `X-Last-Modified` across a collection delete by leaving a
    /// zero-count tombstone row behind in `user_collections` (§4.2's delete-collection invariant:
    /// the overall storage timestamp must still advance even though no BSO remains to carry it).
    async fn erect_tombstone(&mut self, user_id: i32) -> DbResult<()> {
        sql_query(
            r#"INSERT INTO user_collections (userid, collection, last_modified)
               VALUES (?, ?, ?)
                   ON DUPLICATE KEY UPDATE
                      last_modified = VALUES(last_modified)"#,
        )
        .bind::<BigInt, _>(user_id as i64)
        .bind::<Integer, _>(TOMBSTONE)
        .bind::<BigInt, _>(self.timestamp().as_i64())
        .execute(&mut self.conn)
        .await?;
        Ok(())
    }

    async fn delete_storage(&mut self, user_id: UserIdentifier) -> DbResult<()> {
        let user_id = user_id.legacy_id as i64;
        delete(bso::table)
            .filter(bso::user_id.eq(user_id))
            .execute(&mut self.conn)
            .await?;
        delete(user_collections::table)
            .filter(user_collections::user_id.eq(user_id))
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn delete_collection(
        &mut self,
        params: params::DeleteCollection,
    ) -> DbResult<SyncTimestamp> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id(params.collection.clone()).await?;
        let mut count = delete(bso::table)
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(&collection_id))
            .execute(&mut self.conn)
            .await?;
        count += delete(user_collections::table)
            .filter(user_collections::user_id.eq(user_id))
            .filter(user_collections::collection_id.eq(&collection_id))
            .execute(&mut self.conn)
            .await?;
        if count == 0 {
            return Err(DbError::collection_not_found());
        }
        self.erect_tombstone(user_id as i32).await?;
        self.get_storage_timestamp(params.user_id).await
    }

    pub(super) async fn get_or_create_collection_id(&mut self, name: String) -> DbResult<i32> {
        if let Some(id) = self.coll_cache.get_id(&name)? {
            return Ok(id);
        }

        diesel::insert_or_ignore_into(collections::table)
            .values(collections::name.eq(&name))
            .execute(&mut self.conn)
            .await?;

        let id = collections::table
            .select(collections::id)
            .filter(collections::name.eq(&name))
            .first(&mut self.conn)
            .await?;

        if !self.session.in_write_transaction {
            self.coll_cache.put(id, name)?;
        }
        Ok(id)
    }

    pub(super) async fn get_collection_id(&mut self, name: String) -> DbResult<i32> {
        if let Some(id) = self.coll_cache.get_id(&name)? {
            return Ok(id);
        }

        let id = sql_query("SELECT id FROM collections WHERE name = ?")
            .bind::<Text, _>(&name)
            .get_result::<IdResult>(&mut self.conn)
            .await
            .optional()?
            .ok_or_else(DbError::collection_not_found)?
            .id;
        if !self.session.in_write_transaction {
            self.coll_cache.put(id, name)?;
        }
        Ok(id)
    }

    async fn put_bso(&mut self, bso: params::PutBso) -> DbResult<results::PutBso> {
        let collection_id = self
            .get_or_create_collection_id(bso.collection.clone())
            .await?;
        let user_id: u64 = bso.user_id.legacy_id;
        let timestamp = self.timestamp().as_i64();
        if self.quota.enabled {
            let usage = self
                .get_quota_usage(params::GetQuotaUsage {
                    user_id: bso.user_id.clone(),
                    collection: bso.collection.clone(),
                    collection_id,
                })
                .await?;
            if usage.total_bytes >= self.quota.size {
                let mut tags = HashMap::default();
                tags.insert("collection".to_owned(), bso.collection.clone());
                self.metrics.incr_with_tags("storage.quota.at_limit", tags);
                if self.quota.enforced {
                    return Err(DbError::quota());
                }
                warn!("Quota at limit for user's collection ({} bytes)", usage.total_bytes; "collection" => bso.collection.clone());
            }
        }

        let payload = bso.payload.as_deref().unwrap_or_default();
        let sortindex = bso.sortindex;
        let ttl = bso.ttl.unwrap_or(DEFAULT_BSO_TTL);

        // A metadata-only PUT (no payload/sortindex/ttl) must not reset `modified`, or every
        // GET since would see the row's timestamp jump with nothing in it having changed.
        let mut q = String::from(
            "INSERT INTO bso (userid, collection, id, sortindex, payload, modified, ttl)
             VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                    userid = VALUES(userid),
                    collection = VALUES(collection),
                    id = VALUES(id)",
        );
        if bso.sortindex.is_some() {
            q.push_str(", sortindex = VALUES(sortindex)");
        }
        if bso.payload.is_some() {
            q.push_str(", payload = VALUES(payload)");
        }
        if bso.ttl.is_some() {
            q.push_str(", ttl = VALUES(ttl)");
        }
        if bso.payload.is_some() || bso.sortindex.is_some() {
            q.push_str(", modified = VALUES(modified)");
        }

        sql_query(q)
            .bind::<BigInt, _>(user_id as i64)
            .bind::<Integer, _>(&collection_id)
            .bind::<Text, _>(&bso.id)
            .bind::<Nullable<Integer>, _>(sortindex)
            .bind::<Text, _>(payload)
            .bind::<BigInt, _>(timestamp)
            .bind::<BigInt, _>(timestamp + (i64::from(ttl) * 100))
            .execute(&mut self.conn)
            .await?;
        self.update_collection(user_id as u32, collection_id).await
    }

    async fn get_bsos(&mut self, params: params::GetBsos) -> DbResult<results::GetBsos> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id(params.collection.clone()).await?;
        let now = self.timestamp().as_i64();
        let mut query = bso::table
            .select((
                bso::id,
                bso::modified,
                bso::payload,
                bso::sortindex,
                bso::expiry,
            ))
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(collection_id))
            .filter(bso::expiry.gt(now))
            .into_boxed();

        if let Some(older) = params.older {
            query = query.filter(bso::modified.lt(older.as_i64()));
        }
        if let Some(newer) = params.newer {
            query = query.filter(bso::modified.gt(newer.as_i64()));
        }
        if !params.ids.is_empty() {
            query = query.filter(bso::id.eq_any(params.ids));
        }

        // Two BSOs can share a `modified` value; id is unique per (user, collection) so it's
        // used as the tiebreak to keep pagination stable.
        query = match params.sort {
            Sorting::Index => query.order(bso::sortindex.desc()),
            Sorting::Newest => query.order((bso::modified.desc(), bso::id.desc())),
            Sorting::Oldest => query.order((bso::modified.asc(), bso::id.asc())),
            Sorting::None => query,
        };

        let limit = params
            .limit
            .map(i64::from)
            .unwrap_or(DEFAULT_LIMIT as i64)
            .max(0);
        query = query.limit(if limit > 0 { limit + 1 } else { limit });

        let numeric_offset = params.offset.map_or(0, |offset| offset.offset as i64);
        if numeric_offset > 0 {
            query = query.offset(numeric_offset);
        }
        let mut bsos: Vec<results::GetBso> = query
            .load::<BsoRow>(&mut self.conn)
            .await?
            .into_iter()
            .map(Into::into)
            .collect();

        let next_offset = if limit >= 0 && bsos.len() > limit as usize {
            bsos.pop();
            Some((limit + numeric_offset).to_string())
        } else if limit == 0 {
            Some(0.to_string())
        } else {
            None
        };

        Ok(results::GetBsos {
            items: bsos,
            offset: next_offset,
        })
    }

    async fn get_bso_ids(&mut self, params: params::GetBsos) -> DbResult<results::GetBsoIds> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id(params.collection.clone()).await?;
        let mut query = bso::table
            .select(bso::id)
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(collection_id))
            .filter(bso::expiry.gt(self.timestamp().as_i64()))
            .into_boxed();

        if let Some(older) = params.older {
            query = query.filter(bso::modified.lt(older.as_i64()));
        }
        if let Some(newer) = params.newer {
            query = query.filter(bso::modified.gt(newer.as_i64()));
        }
        if !params.ids.is_empty() {
            query = query.filter(bso::id.eq_any(params.ids));
        }

        query = match params.sort {
            Sorting::Index => query.order(bso::sortindex.desc()),
            Sorting::Newest => query.order(bso::modified.desc()),
            Sorting::Oldest => query.order(bso::modified.asc()),
            Sorting::None => query,
        };

        let limit = params
            .limit
            .map(i64::from)
            .unwrap_or(DEFAULT_LIMIT as i64)
            .max(0);
        query = query.limit(if limit == 0 { limit } else { limit + 1 });
        let numeric_offset = params.offset.map_or(0, |offset| offset.offset as i64);
        if numeric_offset != 0 {
            query = query.offset(numeric_offset);
        }
        let mut ids = query.load::<String>(&mut self.conn).await?;

        let next_offset = if limit >= 0 && ids.len() > limit as usize {
            ids.pop();
            Some((limit + numeric_offset).to_string())
        } else {
            None
        };

        Ok(results::GetBsoIds {
            items: ids,
            offset: next_offset,
        })
    }

    async fn get_bso(&mut self, params: params::GetBso) -> DbResult<Option<results::GetBso>> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id(params.collection.clone()).await?;
        Ok(bso::table
            .select((
                bso::id,
                bso::modified,
                bso::payload,
                bso::sortindex,
                bso::expiry,
            ))
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq(&params.id))
            .filter(bso::expiry.ge(self.timestamp().as_i64()))
            .get_result::<BsoRow>(&mut self.conn)
            .await
            .optional()?
            .map(Into::into))
    }

    async fn delete_bso(&mut self, params: params::DeleteBso) -> DbResult<results::DeleteBso> {
        let user_id = params.user_id.legacy_id;
        let collection_id = self.get_collection_id(params.collection.clone()).await?;
        let affected_rows = delete(bso::table)
            .filter(bso::user_id.eq(user_id as i64))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq(params.id))
            .filter(bso::expiry.gt(&self.timestamp().as_i64()))
            .execute(&mut self.conn)
            .await?;
        if affected_rows == 0 {
            return Err(DbError::bso_not_found());
        }
        self.update_collection(user_id as u32, collection_id).await
    }

    async fn delete_bsos(&mut self, params: params::DeleteBsos) -> DbResult<results::DeleteBsos> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id(params.collection.clone()).await?;
        delete(bso::table)
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq_any(params.ids))
            .execute(&mut self.conn)
            .await?;
        self.update_collection(user_id as u32, collection_id).await
    }

    async fn post_bsos(&mut self, input: params::PostBsos) -> DbResult<results::PostBsos> {
        let collection_id = self
            .get_or_create_collection_id(input.collection.clone())
            .await?;
        let modified = self.timestamp();
        let mut success = Vec::with_capacity(input.bsos.len());
        let failed = input.failed;

        for pbso in input.bsos {
            let id = pbso.id.clone();
            self.put_bso(params::PutBso {
                user_id: input.user_id.clone(),
                collection: input.collection.clone(),
                id: pbso.id,
                payload: pbso.payload,
                sortindex: pbso.sortindex,
                ttl: pbso.ttl,
            })
            .await?;
            success.push(id);
        }
        self.update_collection(input.user_id.legacy_id as u32, collection_id)
            .await?;

        Ok(results::PostBsos {
            modified,
            success,
            failed,
        })
    }

    async fn get_storage_timestamp(&mut self, user_id: UserIdentifier) -> DbResult<SyncTimestamp> {
        let user_id = user_id.legacy_id as i64;
        let modified = user_collections::table
            .select(max(user_collections::modified))
            .filter(user_collections::user_id.eq(user_id))
            .first::<Option<i64>>(&mut self.conn)
            .await?
            .unwrap_or_default();
        SyncTimestamp::from_i64(modified).map_err(Into::into)
    }

    async fn get_collection_timestamp(
        &mut self,
        params: params::GetCollectionTimestamp,
    ) -> DbResult<SyncTimestamp> {
        let user_id = params.user_id.legacy_id as u32;
        let collection_id = self.get_collection_id(params.collection.clone()).await?;
        if let Some(modified) = self
            .session
            .coll_modified_cache
            .get(&(user_id, collection_id))
        {
            return Ok(*modified);
        }
        user_collections::table
            .select(user_collections::modified)
            .filter(user_collections::user_id.eq(user_id as i64))
            .filter(user_collections::collection_id.eq(collection_id))
            .first(&mut self.conn)
            .await
            .optional()?
            .ok_or_else(DbError::collection_not_found)
    }

    async fn get_bso_timestamp(
        &mut self,
        params: params::GetBsoTimestamp,
    ) -> DbResult<SyncTimestamp> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id(params.collection.clone()).await?;
        let modified = bso::table
            .select(bso::modified)
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq(&params.id))
            .first::<i64>(&mut self.conn)
            .await
            .optional()?
            .unwrap_or_default();
        SyncTimestamp::from_i64(modified).map_err(Into::into)
    }

    async fn get_collection_timestamps(
        &mut self,
        user_id: UserIdentifier,
    ) -> DbResult<results::GetCollectionTimestamps> {
        let modifieds = sql_query(
            "SELECT collection, last_modified
               FROM user_collections
              WHERE userid = ?
                AND collection != ?",
        )
        .bind::<BigInt, _>(user_id.legacy_id as i64)
        .bind::<Integer, _>(TOMBSTONE)
        .load::<UserCollectionsResult>(&mut self.conn)
        .await?
        .into_iter()
        .map(|cr| {
            SyncTimestamp::from_i64(cr.last_modified)
                .map(|ts| (cr.collection, ts))
                .map_err(Into::into)
        })
        .collect::<DbResult<HashMap<_, _>>>()?;
        self.map_collection_names(modifieds).await
    }

    async fn check(&mut self) -> DbResult<results::Check> {
        sql_query("SELECT 1").execute(&mut self.conn).await?;
        Ok(true)
    }

    async fn map_collection_names<T>(
        &mut self,
        by_id: HashMap<i32, T>,
    ) -> DbResult<HashMap<String, T>> {
        let mut names = self.load_collection_names(by_id.keys()).await?;
        by_id
            .into_iter()
            .map(|(id, value)| {
                names.remove(&id).map(|name| (name, value)).ok_or_else(|| {
                    DbError::internal("load_collection_names: unknown collection id".to_owned())
                })
            })
            .collect()
    }

    async fn load_collection_names<'a>(
        &mut self,
        collection_ids: impl Iterator<Item = &'a i32>,
    ) -> DbResult<HashMap<i32, String>> {
        let mut names = HashMap::new();
        let mut uncached = Vec::new();
        for &id in collection_ids {
            if let Some(name) = self.coll_cache.get_name(id)? {
                names.insert(id, name);
            } else {
                uncached.push(id);
            }
        }

        if !uncached.is_empty() {
            let result = collections::table
                .select((collections::id, collections::name))
                .filter(collections::id.eq_any(uncached))
                .load::<(i32, String)>(&mut self.conn)
                .await?;

            for (id, name) in result {
                names.insert(id, name.clone());
                if !self.session.in_write_transaction {
                    self.coll_cache.put(id, name)?;
                }
            }
        }
        Ok(names)
    }

    pub(super) async fn update_collection(
        &mut self,
        user_id: u32,
        collection_id: i32,
    ) -> DbResult<SyncTimestamp> {
        let quota = if self.quota.enabled {
            self.calc_quota_usage(user_id, collection_id).await?
        } else {
            results::GetQuotaUsage {
                count: 0,
                total_bytes: 0,
            }
        };
        let total_bytes = quota.total_bytes as i64;
        let timestamp = self.timestamp().as_i64();
        sql_query(
            r#"INSERT INTO user_collections (userid, collection, last_modified, total_bytes, count)
               VALUES (?, ?, ?, ?, ?)
                   ON DUPLICATE KEY UPDATE
                      last_modified = ?,
                      total_bytes = ?,
                      count = ?"#,
        )
        .bind::<BigInt, _>(user_id as i64)
        .bind::<Integer, _>(&collection_id)
        .bind::<BigInt, _>(&timestamp)
        .bind::<BigInt, _>(&total_bytes)
        .bind::<Integer, _>(&quota.count)
        .bind::<BigInt, _>(&timestamp)
        .bind::<BigInt, _>(&total_bytes)
        .bind::<Integer, _>(&quota.count)
        .execute(&mut self.conn)
        .await?;
        Ok(self.timestamp())
    }

    async fn get_storage_usage(
        &mut self,
        user_id: UserIdentifier,
    ) -> DbResult<results::GetStorageUsage> {
        let uid = user_id.legacy_id as i64;
        let total_bytes = bso::table
            .select(sql::<Nullable<BigInt>>("SUM(LENGTH(payload))"))
            .filter(bso::user_id.eq(uid))
            .filter(bso::expiry.gt(&self.timestamp().as_i64()))
            .get_result::<Option<i64>>(&mut self.conn)
            .await?;
        Ok(total_bytes.unwrap_or_default() as u64)
    }

    async fn get_quota_usage(
        &mut self,
        params: params::GetQuotaUsage,
    ) -> DbResult<results::GetQuotaUsage> {
        let uid = params.user_id.legacy_id as i64;
        let (total_bytes, count): (i64, i32) = user_collections::table
            .select((
                sql::<BigInt>("COALESCE(SUM(COALESCE(total_bytes, 0)), 0)"),
                sql::<Integer>("COALESCE(SUM(COALESCE(count, 0)), 0)"),
            ))
            .filter(user_collections::user_id.eq(uid))
            .filter(user_collections::collection_id.eq(params.collection_id))
            .get_result(&mut self.conn)
            .await
            .optional()?
            .unwrap_or_default();
        Ok(results::GetQuotaUsage {
            total_bytes: total_bytes as usize,
            count,
        })
    }

    /// A heavier, authoritative recompute straight from `bso` — used to refresh the
    /// `user_collections` denormalized totals on every write (`get_quota_usage` above reads
    /// those totals back out cheaply for the pre-write check).
    async fn calc_quota_usage(
        &mut self,
        user_id: u32,
        collection_id: i32,
    ) -> DbResult<results::GetQuotaUsage> {
        let (total_bytes, count): (i64, i32) = bso::table
            .select((
                sql::<BigInt>(r#"COALESCE(SUM(LENGTH(COALESCE(payload, ""))),0)"#),
                sql::<Integer>("COALESCE(COUNT(*),0)"),
            ))
            .filter(bso::user_id.eq(user_id as i64))
            .filter(bso::expiry.gt(self.timestamp().as_i64()))
            .filter(bso::collection_id.eq(collection_id))
            .get_result(&mut self.conn)
            .await
            .optional()?
            .unwrap_or_default();
        Ok(results::GetQuotaUsage {
            total_bytes: total_bytes as usize,
            count,
        })
    }

    async fn get_collection_usage(
        &mut self,
        user_id: UserIdentifier,
    ) -> DbResult<results::GetCollectionUsage> {
        let counts = bso::table
            .select((bso::collection_id, sql::<BigInt>("SUM(LENGTH(payload))")))
            .filter(bso::user_id.eq(user_id.legacy_id as i64))
            .filter(bso::expiry.gt(&self.timestamp().as_i64()))
            .group_by(bso::collection_id)
            .load(&mut self.conn)
            .await?
            .into_iter()
            .collect();
        self.map_collection_names(counts).await
    }

    async fn get_collection_counts(
        &mut self,
        user_id: UserIdentifier,
    ) -> DbResult<results::GetCollectionCounts> {
        let counts = bso::table
            .select((bso::collection_id, sql::<BigInt>("COUNT(collection)")))
            .filter(bso::user_id.eq(user_id.legacy_id as i64))
            .filter(bso::expiry.gt(&self.timestamp().as_i64()))
            .group_by(bso::collection_id)
            .load(&mut self.conn)
            .await?
            .into_iter()
            .collect();
        self.map_collection_names(counts).await
    }

    batch_db_method!(create_batch, create, CreateBatch);
    batch_db_method!(validate_batch, validate, ValidateBatch);
    batch_db_method!(append_to_batch, append, AppendToBatch);
    batch_db_method!(commit_batch, commit, CommitBatch);
    batch_db_method!(delete_batch, delete, DeleteBatch);

    async fn get_batch(
        &mut self,
        params: params::GetBatch,
    ) -> DbResult<Option<results::GetBatch>> {
        batch::get(self, params).await
    }

    pub(super) fn timestamp(&self) -> SyncTimestamp {
        self.session.timestamp
    }
}

#[async_trait(?Send)]
impl Db for MysqlDb {
    async fn lock_for_read(&mut self, params: params::LockCollection) -> Result<(), Self::Error> {
        MysqlDb::lock_for_read(self, params).await
    }

    async fn lock_for_write(&mut self, params: params::LockCollection) -> Result<(), Self::Error> {
        MysqlDb::lock_for_write(self, params).await
    }

    async fn begin(&mut self, for_write: bool) -> Result<(), Self::Error> {
        MysqlDb::begin(self, for_write).await
    }

    async fn commit(&mut self) -> Result<(), Self::Error> {
        MysqlDb::commit(self).await
    }

    async fn rollback(&mut self) -> Result<(), Self::Error> {
        MysqlDb::rollback(self).await
    }

    async fn get_collection_timestamps(
        &mut self,
        user_id: params::GetCollectionTimestamps,
    ) -> Result<results::GetCollectionTimestamps, Self::Error> {
        MysqlDb::get_collection_timestamps(self, user_id).await
    }

    async fn get_collection_timestamp(
        &mut self,
        params: params::GetCollectionTimestamp,
    ) -> Result<results::GetCollectionTimestamp, Self::Error> {
        MysqlDb::get_collection_timestamp(self, params).await
    }

    async fn get_collection_counts(
        &mut self,
        user_id: params::GetCollectionCounts,
    ) -> Result<results::GetCollectionCounts, Self::Error> {
        MysqlDb::get_collection_counts(self, user_id).await
    }

    async fn get_collection_usage(
        &mut self,
        user_id: params::GetCollectionUsage,
    ) -> Result<results::GetCollectionUsage, Self::Error> {
        MysqlDb::get_collection_usage(self, user_id).await
    }

    async fn get_storage_timestamp(
        &mut self,
        user_id: params::GetStorageTimestamp,
    ) -> Result<results::GetStorageTimestamp, Self::Error> {
        MysqlDb::get_storage_timestamp(self, user_id).await
    }

    async fn get_storage_usage(
        &mut self,
        user_id: params::GetStorageUsage,
    ) -> Result<results::GetStorageUsage, Self::Error> {
        MysqlDb::get_storage_usage(self, user_id).await
    }

    async fn get_quota_usage(
        &mut self,
        params: params::GetQuotaUsage,
    ) -> Result<results::GetQuotaUsage, Self::Error> {
        MysqlDb::get_quota_usage(self, params).await
    }

    async fn delete_storage(
        &mut self,
        user_id: params::DeleteStorage,
    ) -> Result<results::DeleteStorage, Self::Error> {
        MysqlDb::delete_storage(self, user_id).await
    }

    async fn delete_collection(
        &mut self,
        params: params::DeleteCollection,
    ) -> Result<results::DeleteCollection, Self::Error> {
        MysqlDb::delete_collection(self, params).await
    }

    async fn delete_bsos(
        &mut self,
        params: params::DeleteBsos,
    ) -> Result<results::DeleteBsos, Self::Error> {
        MysqlDb::delete_bsos(self, params).await
    }

    async fn get_bsos(&mut self, params: params::GetBsos) -> Result<results::GetBsos, Self::Error> {
        MysqlDb::get_bsos(self, params).await
    }

    async fn get_bso_ids(
        &mut self,
        params: params::GetBsoIds,
    ) -> Result<results::GetBsoIds, Self::Error> {
        MysqlDb::get_bso_ids(self, params).await
    }

    async fn post_bsos(
        &mut self,
        params: params::PostBsos,
    ) -> Result<results::PostBsos, Self::Error> {
        MysqlDb::post_bsos(self, params).await
    }

    async fn delete_bso(
        &mut self,
        params: params::DeleteBso,
    ) -> Result<results::DeleteBso, Self::Error> {
        MysqlDb::delete_bso(self, params).await
    }

    async fn get_bso(
        &mut self,
        params: params::GetBso,
    ) -> Result<Option<results::GetBso>, Self::Error> {
        MysqlDb::get_bso(self, params).await
    }

    async fn get_bso_timestamp(
        &mut self,
        params: params::GetBsoTimestamp,
    ) -> Result<results::GetBsoTimestamp, Self::Error> {
        MysqlDb::get_bso_timestamp(self, params).await
    }

    async fn put_bso(&mut self, params: params::PutBso) -> Result<results::PutBso, Self::Error> {
        MysqlDb::put_bso(self, params).await
    }

    async fn check(&mut self) -> Result<results::Check, Self::Error> {
        MysqlDb::check(self).await
    }

    async fn get_collection_id(&mut self, name: String) -> Result<i32, Self::Error> {
        MysqlDb::get_collection_id(self, name).await
    }

    async fn create_collection(&mut self, name: String) -> Result<i32, Self::Error> {
        self.get_or_create_collection_id(name).await
    }

    async fn update_collection(
        &mut self,
        params: params::UpdateCollection,
    ) -> Result<SyncTimestamp, Self::Error> {
        MysqlDb::update_collection(self, params.user_id.legacy_id as u32, params.collection_id)
            .await
    }

    fn get_connection_info(&self) -> results::ConnectionInfo {
        results::ConnectionInfo::default()
    }

    fn timestamp(&self) -> SyncTimestamp {
        MysqlDb::timestamp(self)
    }

    fn set_timestamp(&mut self, timestamp: SyncTimestamp) {
        self.session.timestamp = timestamp;
    }

    fn clear_coll_cache(&mut self) {
        self.coll_cache.clear();
    }

    fn set_quota(&mut self, enabled: bool, limit: usize, enforced: bool) {
        self.quota = Quota {
            size: limit,
            enabled,
            enforced,
        }
    }
}

#[async_trait(?Send)]
impl BatchDb for MysqlDb {
    type Error = DbError;

    async fn create_batch(
        &mut self,
        params: params::CreateBatch,
    ) -> Result<results::CreateBatch, Self::Error> {
        MysqlDb::create_batch(self, params).await
    }

    async fn validate_batch(
        &mut self,
        params: params::ValidateBatch,
    ) -> Result<results::ValidateBatch, Self::Error> {
        MysqlDb::validate_batch(self, params).await
    }

    async fn append_to_batch(
        &mut self,
        params: params::AppendToBatch,
    ) -> Result<results::AppendToBatch, Self::Error> {
        MysqlDb::append_to_batch(self, params).await
    }

    async fn get_batch(
        &mut self,
        params: params::GetBatch,
    ) -> Result<Option<results::GetBatch>, Self::Error> {
        MysqlDb::get_batch(self, params).await
    }

    async fn commit_batch(
        &mut self,
        params: params::CommitBatch,
    ) -> Result<results::CommitBatch, Self::Error> {
        MysqlDb::commit_batch(self, params).await
    }

    async fn delete_batch(
        &mut self,
        params: params::DeleteBatch,
    ) -> Result<results::DeleteBatch, Self::Error> {
        MysqlDb::delete_batch(self, params).await
    }
}

/// `bso` row shape for `Queryable` loads; `results::GetBso` stays diesel-agnostic so crates above
/// the storage layer don't need to pull in diesel.
#[derive(Debug, Clone, Queryable)]
struct BsoRow {
    id: String,
    modified: SyncTimestamp,
    payload: String,
    sortindex: Option<i32>,
    expiry: i64,
}

impl From<BsoRow> for results::GetBso {
    fn from(row: BsoRow) -> Self {
        results::GetBso {
            id: row.id,
            modified: row.modified,
            payload: row.payload,
            sortindex: row.sortindex,
            expiry: row.expiry,
        }
    }
}

#[derive(Debug, QueryableByName)]
struct IdResult {
    #[diesel(sql_type = Integer)]
    id: i32,
}

#[derive(Debug, QueryableByName)]
struct UserCollectionsResult {
    #[diesel(sql_type = Integer)]
    collection: i32,
    #[diesel(sql_type = BigInt)]
    last_modified: i64,
}
