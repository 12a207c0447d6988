//! Standalone sweep that opportunistically reaps rows the read-time TTL predicate has already
//! made invisible (spec.md §9's TTL Open Question): expired `bso` rows and expired batch staging
//! rows. Deletes in chunks so a single run never holds a long-lived lock over a huge table.

use std::env;
use std::error::Error;
use std::sync::Arc;

use syncstore_common::{metrics_from_opts, BlockingThreadpool, Metrics};
use syncstore_db_common::{DbPool, SyncTimestamp};
use syncstore_mysql::MysqlDbPool;
use syncstore_settings::Settings;

const DEFAULT_CHUNK_SIZE: i64 = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::try_init()?;

    let chunk_size: i64 = env::var("PURGE_TTL_BATCH_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CHUNK_SIZE);

    let settings = Settings::with_env_and_config_file(None)?;
    let metrics_client = metrics_from_opts(
        &settings.statsd_label,
        settings.statsd_host.as_deref(),
        settings.statsd_port,
    )?;

    let mut pool = MysqlDbPool::new(
        &settings,
        &Metrics::from(&metrics_client),
        Arc::new(BlockingThreadpool::default()),
    )?;
    pool.init().await?;

    let now = SyncTimestamp::default().as_i64();

    let mut bso_timer = Metrics::from(&metrics_client);
    bso_timer.start_timer("purge_ttl.bso_duration", None);
    let bso_count = pool.purge_expired_bsos(now, chunk_size).await?;
    drop(bso_timer);
    println!("purge_ttl: removed {} expired bso rows", bso_count);

    let mut batch_timer = Metrics::from(&metrics_client);
    batch_timer.start_timer("purge_ttl.batches_duration", None);
    let batch_count = pool.purge_expired_batches(now, chunk_size).await?;
    drop(batch_timer);
    println!("purge_ttl: removed {} expired batch rows", batch_count);

    Ok(())
}
