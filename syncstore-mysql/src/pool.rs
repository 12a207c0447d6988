//! The `DbPool` implementation for the relational reference backend: a `deadpool` pool of
//! `diesel-async` mysql connections, plus the process-wide collection-id interning cache
//! (spec.md §3's "collection-id interning table") that lets the hot path skip a `collections`
//! lookup for nearly every request.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use deadpool::managed::PoolError;
use diesel::Connection;
use diesel_async::{
    async_connection_wrapper::AsyncConnectionWrapper,
    pooled_connection::{
        deadpool::{Object, Pool},
        AsyncDieselConnectionManager,
    },
    AsyncMysqlConnection, RunQueryDsl,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use syncstore_common::{BlockingThreadpool, Metrics};
use syncstore_db_common::{Db, DbPool, GetPoolState, PoolState, STD_COLLS};
use syncstore_settings::{Quota, Settings};
use tokio::task::spawn_blocking;

use super::{batch, models::MysqlDb, DbError, DbResult};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub(crate) type Conn = Object<AsyncMysqlConnection>;

/// Mysql DDL statements implicitly commit, which would disrupt a pooled connection mid-test
/// transaction; migrations always run on their own standalone connection.
fn run_embedded_migrations(database_url: &str) -> DbResult<()> {
    let conn = AsyncConnectionWrapper::<AsyncMysqlConnection>::establish(database_url)?;
    let mut conn = conn;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| DbError::internal(format!("Couldn't run migrations: {e}")))?;
    Ok(())
}

#[derive(Clone)]
pub struct MysqlDbPool {
    pool: Pool<AsyncMysqlConnection>,
    coll_cache: Arc<CollectionCache>,
    metrics: Metrics,
    quota: Quota,
    database_url: String,
}

impl MysqlDbPool {
    /// Builds a new pool. Does not run migrations; call `init` (via the `DbPool` trait) first.
    pub fn new(
        settings: &Settings,
        metrics: &Metrics,
        _blocking_threadpool: Arc<BlockingThreadpool>,
    ) -> DbResult<Self> {
        let manager =
            AsyncDieselConnectionManager::<AsyncMysqlConnection>::new(&settings.database_url);

        let wait = settings
            .database_pool_connection_timeout
            .map(|seconds| Duration::from_secs(seconds as u64));
        let timeouts = deadpool::managed::Timeouts {
            wait,
            ..Default::default()
        };
        let config = deadpool::managed::PoolConfig {
            max_size: settings.database_pool_max_size as usize,
            timeouts,
            ..Default::default()
        };

        let pool = Pool::builder(manager)
            .config(config)
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| DbError::internal(format!("Couldn't build Db Pool: {e}")))?;

        Ok(Self {
            pool,
            coll_cache: Default::default(),
            metrics: metrics.clone(),
            quota: Quota {
                size: settings.limits.max_quota_limit as usize,
                enabled: settings.enable_quota,
                enforced: settings.enforce_quota,
            },
            database_url: settings.database_url.clone(),
        })
    }

    pub async fn get_mysql_db(&self) -> DbResult<MysqlDb> {
        let conn = self.pool.get().await.map_err(|e| match e {
            PoolError::Backend(be) => match be {
                diesel_async::pooled_connection::PoolError::ConnectionError(ce) => ce.into(),
                diesel_async::pooled_connection::PoolError::QueryError(dbe) => dbe.into(),
            },
            PoolError::Timeout(_) => DbError::pool_timeout(),
            _ => DbError::internal(format!("deadpool PoolError: {e}")),
        })?;

        Ok(MysqlDb::new(
            conn,
            Arc::clone(&self.coll_cache),
            &self.metrics,
            &self.quota,
        ))
    }

    pub(crate) fn validate_batch_id(id: String) -> DbResult<()> {
        batch::validate_batch_id(&id)
    }

    /// Deletes `bso` rows past their TTL in chunks of `chunk_size`, returning the total removed.
    /// Used by the standalone `purge_ttl` sweep (spec.md §9: TTL is enforced at read time via a
    /// query predicate, then reclaimed opportunistically rather than by a continuous GC).
    pub async fn purge_expired_bsos(&self, now: i64, chunk_size: i64) -> DbResult<u64> {
        let mut db = self.get_mysql_db().await?;
        let mut total = 0u64;
        loop {
            let affected = diesel::sql_query("DELETE FROM bso WHERE ttl <= ? LIMIT ?")
                .bind::<diesel::sql_types::BigInt, _>(now)
                .bind::<diesel::sql_types::BigInt, _>(chunk_size)
                .execute(&mut db.conn)
                .await?;
            total += affected as u64;
            if (affected as i64) < chunk_size {
                break;
            }
        }
        Ok(total)
    }

    /// Deletes batch staging rows (both tables) past `BATCH_LIFETIME`, in chunks of `chunk_size`.
    pub async fn purge_expired_batches(&self, now: i64, chunk_size: i64) -> DbResult<u64> {
        let cutoff = now - syncstore_db_common::BATCH_LIFETIME;
        let mut db = self.get_mysql_db().await?;
        let mut total = 0u64;
        for table in ["batch_upload_items", "batch_uploads"] {
            loop {
                let affected =
                    diesel::sql_query(format!("DELETE FROM {table} WHERE batch <= ? LIMIT ?"))
                        .bind::<diesel::sql_types::BigInt, _>(cutoff)
                        .bind::<diesel::sql_types::BigInt, _>(chunk_size)
                        .execute(&mut db.conn)
                        .await?;
                total += affected as u64;
                if (affected as i64) < chunk_size {
                    break;
                }
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl DbPool for MysqlDbPool {
    type Error = DbError;

    async fn init(&mut self) -> DbResult<()> {
        let database_url = self.database_url.clone();
        spawn_blocking(move || run_embedded_migrations(&database_url))
            .await
            .map_err(|e| DbError::internal(format!("Couldn't spawn migrations: {e}")))??;
        Ok(())
    }

    async fn get(&self) -> DbResult<Box<dyn Db<Error = Self::Error>>> {
        Ok(Box::new(self.get_mysql_db().await?) as Box<dyn Db<Error = Self::Error>>)
    }

    fn validate_batch_id(&self, id: String) -> DbResult<()> {
        MysqlDbPool::validate_batch_id(id)
    }

    fn box_clone(&self) -> Box<dyn DbPool<Error = Self::Error>> {
        Box::new(self.clone())
    }
}

impl fmt::Debug for MysqlDbPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlDbPool")
            .field("coll_cache", &self.coll_cache)
            .finish()
    }
}

impl GetPoolState for MysqlDbPool {
    fn state(&self) -> PoolState {
        self.pool.status().into()
    }
}

/// Process-wide `collections(name) <-> id` interning cache (spec.md §3). Pre-seeded with the
/// reserved-collection table so the hot path essentially never queries `collections` at all.
#[derive(Debug)]
pub(crate) struct CollectionCache {
    by_name: RwLock<HashMap<String, i32>>,
    by_id: RwLock<HashMap<i32, String>>,
}

impl CollectionCache {
    pub fn put(&self, id: i32, name: String) -> DbResult<()> {
        self.by_name
            .write()
            .map_err(|_| DbError::internal("by_name write".to_owned()))?
            .insert(name.clone(), id);
        self.by_id
            .write()
            .map_err(|_| DbError::internal("by_id write".to_owned()))?
            .insert(id, name);
        Ok(())
    }

    pub fn get_id(&self, name: &str) -> DbResult<Option<i32>> {
        Ok(self
            .by_name
            .read()
            .map_err(|_| DbError::internal("by_name read".to_owned()))?
            .get(name)
            .cloned())
    }

    pub fn get_name(&self, id: i32) -> DbResult<Option<String>> {
        Ok(self
            .by_id
            .read()
            .map_err(|_| DbError::internal("by_id read".to_owned()))?
            .get(&id)
            .cloned())
    }

    pub fn clear(&self) {
        self.by_name.write().expect("by_name write").clear();
        self.by_id.write().expect("by_id write").clear();
    }
}

impl Default for CollectionCache {
    fn default() -> Self {
        Self {
            by_name: RwLock::new(
                STD_COLLS
                    .iter()
                    .map(|(id, name)| ((*name).to_owned(), *id))
                    .collect(),
            ),
            by_id: RwLock::new(
                STD_COLLS
                    .iter()
                    .map(|(id, name)| (*id, (*name).to_owned()))
                    .collect(),
            ),
        }
    }
}
