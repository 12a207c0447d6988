//! Client-facing batch-upload protocol (SPEC_FULL.md §4.1 SUPPLEMENT): a server-held staging
//! area that accumulates POSTed BSOs across several requests before a single commit applies
//! them all as one write, advancing the collection timestamp exactly once.

use std::collections::HashSet;

use base64::Engine;
use diesel::{
    self, dsl::sql, insert_into,
    result::{DatabaseErrorKind::UniqueViolation, Error as DieselError},
    sql_query,
    sql_types::{BigInt, Integer},
    ExpressionMethods, OptionalExtension, QueryDsl,
};
use diesel_async::RunQueryDsl;
use syncstore_db_common::{params, results, UserIdentifier, BATCH_LIFETIME, DEFAULT_BSO_TTL};

use super::{
    models::MysqlDb,
    schema::{batch_upload_items, batch_uploads},
    DbError, DbResult,
};

const MAX_BATCH_CREATE_RETRY: u8 = 5;

pub async fn create(
    db: &mut MysqlDb,
    params: params::CreateBatch,
) -> DbResult<results::CreateBatch> {
    let user_id = params.user_id.legacy_id as i64;
    let collection_id = db.get_collection_id(params.collection.clone()).await?;
    // Batch ids are derived from the request-frozen timestamp (already unique per user thanks
    // to §4.4's monotonicity guarantee); the low digit of user_id is folded in so that batch ids
    // mod N distribute evenly across shards rather than clustering on whichever decisecond a
    // burst of writes happens to land on.
    let mut batch_id = db.timestamp().as_i64() + (user_id % 10);
    for i in 1..=MAX_BATCH_CREATE_RETRY {
        let result = insert_into(batch_uploads::table)
            .values((
                batch_uploads::batch_id.eq(&batch_id),
                batch_uploads::user_id.eq(&user_id),
                batch_uploads::collection_id.eq(&collection_id),
            ))
            .execute(&mut db.conn)
            .await;
        match result {
            Ok(_) => break,
            Err(DieselError::DatabaseError(UniqueViolation, _)) => {
                if i == MAX_BATCH_CREATE_RETRY {
                    return Err(DbError::conflict());
                }
                batch_id += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    do_append(db, batch_id, params.user_id, params.bsos).await?;
    Ok(results::CreateBatch {
        id: encode_id(batch_id),
        size: None,
    })
}

pub async fn validate(db: &mut MysqlDb, params: params::ValidateBatch) -> DbResult<bool> {
    let batch_id = decode_id(&params.id)?;
    if (batch_id + BATCH_LIFETIME) < db.timestamp().as_i64() {
        return Ok(false);
    }

    let user_id = params.user_id.legacy_id as i64;
    let collection_id = db.get_collection_id(params.collection.clone()).await?;
    let exists = batch_uploads::table
        .select(sql::<Integer>("1"))
        .filter(batch_uploads::batch_id.eq(&batch_id))
        .filter(batch_uploads::user_id.eq(&user_id))
        .filter(batch_uploads::collection_id.eq(&collection_id))
        .get_result::<i32>(&mut db.conn)
        .await
        .optional()?;
    Ok(exists.is_some())
}

pub async fn append(db: &mut MysqlDb, params: params::AppendToBatch) -> DbResult<()> {
    let exists = validate(
        db,
        params::ValidateBatch {
            user_id: params.user_id.clone(),
            collection: params.collection.clone(),
            id: params.batch.id.clone(),
        },
    )
    .await?;
    if !exists {
        return Err(DbError::batch_not_found());
    }

    let batch_id = decode_id(&params.batch.id)?;
    do_append(db, batch_id, params.user_id, params.bsos).await?;
    Ok(())
}

pub async fn get(
    db: &mut MysqlDb,
    params: params::GetBatch,
) -> DbResult<Option<results::GetBatch>> {
    let is_valid = validate(
        db,
        params::ValidateBatch {
            user_id: params.user_id,
            collection: params.collection,
            id: params.id.clone(),
        },
    )
    .await?;
    Ok(is_valid.then_some(results::GetBatch { id: params.id }))
}

pub async fn delete(db: &mut MysqlDb, params: params::DeleteBatch) -> DbResult<()> {
    let batch_id = decode_id(&params.id)?;
    let user_id = params.user_id.legacy_id as i64;
    let collection_id = db.get_collection_id(params.collection.clone()).await?;
    diesel::delete(batch_uploads::table)
        .filter(batch_uploads::batch_id.eq(&batch_id))
        .filter(batch_uploads::user_id.eq(&user_id))
        .filter(batch_uploads::collection_id.eq(&collection_id))
        .execute(&mut db.conn)
        .await?;
    diesel::delete(batch_upload_items::table)
        .filter(batch_upload_items::batch_id.eq(&batch_id))
        .filter(batch_upload_items::user_id.eq(&user_id))
        .execute(&mut db.conn)
        .await?;
    Ok(())
}

/// Applies a committed batch to `bso` in one statement, then deletes the staging rows. Every
/// invariant SPEC_FULL.md §4.1 states about an ordinary chunked POST (monotonic timestamp,
/// quota pre-check already done by the caller, last-write-wins per id) applies unchanged here
/// because the insert is a single upsert keyed on `(userid, collection, id)`.
pub async fn commit(
    db: &mut MysqlDb,
    params: params::CommitBatch,
) -> DbResult<results::CommitBatch> {
    let batch_id = decode_id(&params.batch.id)?;
    let user_id = params.user_id.legacy_id as i64;
    let collection_id = db.get_collection_id(params.collection.clone()).await?;
    let timestamp = db.timestamp();
    let ts = timestamp.as_i64();

    sql_query(include_str!("batch_commit.sql"))
        .bind::<BigInt, _>(user_id)
        .bind::<Integer, _>(&collection_id)
        .bind::<BigInt, _>(ts)
        .bind::<BigInt, _>(ts)
        .bind::<BigInt, _>(DEFAULT_BSO_TTL as i64)
        .bind::<BigInt, _>(&batch_id)
        .bind::<BigInt, _>(user_id)
        .execute(&mut db.conn)
        .await?;

    db.update_collection(user_id as u32, collection_id).await?;

    delete(
        db,
        params::DeleteBatch {
            user_id: params.user_id,
            collection: params.collection,
            id: params.batch.id,
        },
    )
    .await?;
    Ok(timestamp)
}

async fn do_append(
    db: &mut MysqlDb,
    batch_id: i64,
    user_id: UserIdentifier,
    bsos: Vec<params::PostCollectionBso>,
) -> DbResult<()> {
    fn exist_key(user_id: u64, batch_id: i64, bso_id: &str) -> String {
        format!("{batch_id}-{user_id}-{bso_id}")
    }

    #[derive(Debug, QueryableByName)]
    struct ExistsResult {
        #[diesel(sql_type = BigInt)]
        batch_id: i64,
        #[diesel(sql_type = diesel::sql_types::Text)]
        id: String,
    }

    #[derive(AsChangeset)]
    #[diesel(table_name = batch_upload_items)]
    struct UpdateBatchItem {
        payload: Option<String>,
        payload_size: Option<i64>,
        ttl_offset: Option<i32>,
    }

    // The same id can appear twice in one client POST (last-write-wins, §5's ordering
    // guarantee); `ON DUPLICATE KEY` alone can't express that for a multi-row VALUES list, so
    // existing keys are pre-loaded and update vs. insert is chosen per row.
    let mut existing = HashSet::new();
    for item in sql_query(
        "SELECT batch as batch_id, id FROM batch_upload_items WHERE userid=? AND batch=?",
    )
    .bind::<BigInt, _>(user_id.legacy_id as i64)
    .bind::<BigInt, _>(batch_id)
    .get_results::<ExistsResult>(&mut db.conn)
    .await?
    {
        existing.insert(exist_key(user_id.legacy_id, item.batch_id, &item.id));
    }

    for bso in bsos {
        let payload_size = bso.payload.as_ref().map(|p| p.len() as i64);
        let key = exist_key(user_id.legacy_id, batch_id, &bso.id);

        if existing.contains(&key) {
            diesel::update(
                batch_upload_items::table
                    .filter(batch_upload_items::user_id.eq(user_id.legacy_id as i64))
                    .filter(batch_upload_items::batch_id.eq(batch_id))
                    .filter(batch_upload_items::id.eq(&bso.id)),
            )
            .set(&UpdateBatchItem {
                payload: bso.payload,
                payload_size,
                ttl_offset: bso.ttl.map(|ttl| ttl as i32),
            })
            .execute(&mut db.conn)
            .await?;
        } else {
            diesel::insert_into(batch_upload_items::table)
                .values((
                    batch_upload_items::batch_id.eq(&batch_id),
                    batch_upload_items::user_id.eq(user_id.legacy_id as i64),
                    batch_upload_items::id.eq(bso.id.clone()),
                    batch_upload_items::sortindex.eq(bso.sortindex),
                    batch_upload_items::payload.eq(bso.payload),
                    batch_upload_items::payload_size.eq(payload_size),
                    batch_upload_items::ttl_offset.eq(bso.ttl.map(|ttl| ttl as i32)),
                ))
                .execute(&mut db.conn)
                .await?;
            existing.insert(key);
        }
    }

    Ok(())
}

pub fn validate_batch_id(id: &str) -> DbResult<()> {
    decode_id(id).map(|_| ())
}

fn encode_id(id: i64) -> String {
    base64::engine::general_purpose::STANDARD.encode(id.to_string())
}

fn decode_id(id: &str) -> DbResult<i64> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(id)
        .unwrap_or_else(|_| id.as_bytes().to_vec());
    let decoded = std::str::from_utf8(&bytes).unwrap_or(id);
    decoded
        .parse::<i64>()
        .map_err(|e| DbError::internal(format!("Invalid batch_id: {}", e)))
}

/// Forwards `MysqlDb`'s batch-trait methods to the freestanding functions above, so `models.rs`
/// doesn't need five near-identical one-line wrappers.
macro_rules! batch_db_method {
    ($name:ident, $batch_fn:ident, $type:ident) => {
        pub(super) async fn $name(&mut self, params: params::$type) -> DbResult<results::$type> {
            batch::$batch_fn(self, params).await
        }
    };
}

pub(crate) use batch_db_method;
