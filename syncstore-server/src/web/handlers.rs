//! Route handlers: each one extracts its request type, runs its db work through
//! `DbTransactionPool`, and renders the result per the wire contract.

use std::collections::HashMap;

use actix_web::{http::StatusCode, web::Data, HttpRequest, HttpResponse};
use serde_json::Value;
use syncstore_common::{X_LAST_MODIFIED, X_WEAVE_NEXT_OFFSET, X_WEAVE_RECORDS};
use syncstore_db_common::{
    params,
    results::{CreateBatch, Paginated},
    Db, DbErrorIntrospect,
};
use syncstore_mysql::DbError;

use crate::{
    db_action,
    error::{ApiError, ApiErrorKind},
    server::ServerState,
    web::{
        extractors::{
            bso_put_request::BsoPutRequest, bso_request::BsoRequest,
            collection_post_request::CollectionPostRequest, collection_request::CollectionRequest,
            heartbeat_request::HeartbeatRequest, meta_request::MetaRequest,
            test_error_request::TestErrorRequest, EmitApiMetric, ReplyFormat,
        },
        transaction::DbTransactionPool,
    },
};

const ONE_KB: f64 = 1024.0;

pub async fn get_collections(meta: MetaRequest, db_pool: DbTransactionPool) -> Result<HttpResponse, ApiError> {
    meta.emit_api_metric("request.get_collections");
    let user_id = meta.user_id;
    db_pool
        .transaction_http(db_action!(db => {
            let result = db.get_collection_timestamps(user_id).await?;
            Ok(HttpResponse::build(StatusCode::OK)
                .insert_header((X_WEAVE_RECORDS, result.len().to_string()))
                .json(result))
        }))
        .await
}

pub async fn get_collection_counts(
    meta: MetaRequest,
    db_pool: DbTransactionPool,
) -> Result<HttpResponse, ApiError> {
    meta.emit_api_metric("request.get_collection_counts");
    let user_id = meta.user_id;
    db_pool
        .transaction_http(db_action!(db => {
            let result = db.get_collection_counts(user_id).await?;
            Ok(HttpResponse::build(StatusCode::OK)
                .insert_header((X_WEAVE_RECORDS, result.len().to_string()))
                .json(result))
        }))
        .await
}

pub async fn get_collection_usage(
    meta: MetaRequest,
    db_pool: DbTransactionPool,
) -> Result<HttpResponse, ApiError> {
    meta.emit_api_metric("request.get_collection_usage");
    let user_id = meta.user_id;
    db_pool
        .transaction_http(db_action!(db => {
            let usage: HashMap<_, _> = db
                .get_collection_usage(user_id)
                .await?
                .into_iter()
                .map(|(coll, size)| (coll, size as f64 / ONE_KB))
                .collect();
            Ok(HttpResponse::build(StatusCode::OK).json(usage))
        }))
        .await
}

pub async fn get_quota(meta: MetaRequest, db_pool: DbTransactionPool) -> Result<HttpResponse, ApiError> {
    meta.emit_api_metric("request.get_quota");
    let user_id = meta.user_id;
    db_pool
        .transaction_http(db_action!(db => {
            let usage = db.get_storage_usage(user_id).await?;
            Ok(HttpResponse::Ok().json(vec![Some(usage as f64 / ONE_KB), None]))
        }))
        .await
}

pub async fn delete_all(
    req: HttpRequest,
    meta: MetaRequest,
    db_pool: DbTransactionPool,
) -> Result<HttpResponse, ApiError> {
    meta.emit_api_metric("request.delete_all");
    let confirmed = req
        .headers()
        .get("X-Confirm-Delete")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "1")
        .unwrap_or(false);
    if !confirmed {
        return Err(ApiError::missing_confirm_delete());
    }
    let user_id = meta.user_id;
    db_pool
        .transaction_http(db_action!(db => {
            db.delete_storage(user_id).await?;
            Ok(HttpResponse::Ok().json(serde_json::json!({})))
        }))
        .await
}

pub async fn delete_collection(
    coll: CollectionRequest,
    db_pool: DbTransactionPool,
) -> Result<HttpResponse, ApiError> {
    coll.emit_api_metric("request.delete_collection");
    let delete_ids = !coll.query.ids.is_empty();
    let user_id = coll.user_id.clone();
    let collection = coll.collection.clone();
    let ids = coll.query.ids.clone();

    db_pool
        .transaction_http(db_action!(db => {
            let result = if delete_ids {
                db.delete_bsos(params::DeleteBsos {
                    user_id,
                    collection,
                    ids,
                })
                .await
            } else {
                db.delete_collection(params::DeleteCollection { user_id: user_id.clone(), collection })
                    .await
            };

            let modified = match result {
                Ok(modified) => modified,
                Err(e) if e.is_collection_not_found() || e.is_bso_not_found() => {
                    db.get_storage_timestamp(user_id).await?
                }
                Err(e) => return Err(e.into()),
            };

            Ok(HttpResponse::Ok()
                .insert_header((X_LAST_MODIFIED, modified.as_header()))
                .json(modified))
        }))
        .await
}

fn finish_get_collection<T: serde::Serialize + Default + 'static>(
    coll: &CollectionRequest,
    result: Result<Paginated<T>, DbError>,
) -> Result<HttpResponse, ApiError> {
    let result = match result {
        Ok(r) => r,
        Err(e) if e.is_collection_not_found() => Paginated::default(),
        Err(e) => return Err(e.into()),
    };

    let mut builder = HttpResponse::build(StatusCode::OK);
    builder.insert_header((X_WEAVE_RECORDS, result.items.len().to_string()));
    if let Some(offset) = &result.offset {
        builder.insert_header((X_WEAVE_NEXT_OFFSET, offset.clone()));
    }

    match coll.reply {
        ReplyFormat::Json => Ok(builder.json(result.items)),
        ReplyFormat::Newlines => {
            let mut body = String::new();
            for item in &result.items {
                let line = serde_json::to_string(item).map_err(|e| ApiError::internal(e.to_string()))?;
                if line.is_empty() {
                    continue;
                }
                body.push_str(&line.replace('\n', "\\u000a"));
                body.push('\n');
            }
            let body = body.trim_end_matches('\n').to_owned();
            Ok(builder
                .content_type("application/newlines")
                .insert_header(("Content-Length", body.len().to_string()))
                .body(body))
        }
    }
}

pub async fn get_collection(
    coll: CollectionRequest,
    db_pool: DbTransactionPool,
) -> Result<HttpResponse, ApiError> {
    coll.emit_api_metric("request.get_collection");
    let full = coll.query.full;
    let user_id = coll.user_id.clone();
    let collection = coll.collection.clone();
    let query = coll.query.clone();
    let coll_for_render = coll.clone();

    db_pool
        .transaction_http(db_action!(db => {
            if full {
                let params = params::GetBsos {
                    user_id,
                    collection,
                    newer: query.newer,
                    older: query.older,
                    sort: query.sort,
                    limit: query.limit,
                    offset: query.offset,
                    ids: query.ids,
                    full: query.full,
                };
                let result = db.get_bsos(params).await;
                finish_get_collection(&coll_for_render, result)
            } else {
                let params = params::GetBsoIds {
                    user_id,
                    collection,
                    newer: query.newer,
                    older: query.older,
                    sort: query.sort,
                    limit: query.limit,
                    offset: query.offset,
                    ids: query.ids,
                    full: query.full,
                };
                let result = db.get_bso_ids(params).await;
                finish_get_collection(&coll_for_render, result)
            }
        }))
        .await
}

pub async fn post_collection(
    coll: CollectionPostRequest,
    db_pool: DbTransactionPool,
) -> Result<HttpResponse, ApiError> {
    coll.emit_api_metric("request.post_collection");

    if let Some(batch) = &coll.batch {
        if !(batch.id.is_none() && batch.commit) {
            return post_collection_batch(coll, db_pool).await;
        }
    }

    let user_id = coll.user_id.clone();
    let collection = coll.collection.clone();
    let failed = coll.bsos.invalid.clone();
    let bsos: Vec<_> = coll.bsos.valid.iter().cloned().map(Into::into).collect();

    db_pool
        .transaction_http(db_action!(db => {
            let result = db
                .post_bsos(params::PostBsos {
                    user_id,
                    collection,
                    bsos,
                    for_batch: false,
                    failed,
                })
                .await?;
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "modified": result.modified,
                "success": result.success,
                "failed": result.failed,
            })))
        }))
        .await
}

async fn post_collection_batch(
    coll: CollectionPostRequest,
    db_pool: DbTransactionPool,
) -> Result<HttpResponse, ApiError> {
    let breq = coll.batch.clone().expect("post_collection_batch called without a batch request");
    let user_id = coll.user_id.clone();
    let collection = coll.collection.clone();
    let quota_enabled = coll.quota_enabled;
    let new_bsos: Vec<_> = coll.bsos.valid.iter().cloned().map(Into::into).collect();
    let failed = coll.bsos.invalid.clone();

    db_pool
        .transaction_http(db_action!(db => {
            let batch = match &breq.id {
                Some(id) => {
                    let valid = db
                        .validate_batch(params::ValidateBatch {
                            user_id: user_id.clone(),
                            collection: collection.clone(),
                            id: id.clone(),
                        })
                        .await?;
                    if !valid {
                        return Err(DbError::batch_not_found().into());
                    }
                    let size = if quota_enabled {
                        let collection_id = db.get_collection_id(collection.clone()).await?;
                        let usage = db
                            .get_quota_usage(params::GetQuotaUsage { user_id: user_id.clone(), collection: collection.clone(), collection_id })
                            .await?;
                        Some(usage.total_bytes)
                    } else {
                        None
                    };
                    CreateBatch { id: id.clone(), size }
                }
                None => {
                    db.create_batch(params::CreateBatch {
                        user_id: user_id.clone(),
                        collection: collection.clone(),
                        bsos: vec![],
                    })
                    .await?
                }
            };

            let success: Vec<String> = new_bsos.iter().map(|bso| bso.id.clone()).collect();

            if !new_bsos.is_empty() {
                db.append_to_batch(params::AppendToBatch {
                    user_id: user_id.clone(),
                    collection: collection.clone(),
                    batch: batch.clone(),
                    bsos: new_bsos,
                })
                .await?;
            }

            if !breq.commit {
                return Ok(HttpResponse::Accepted().json(serde_json::json!({
                    "success": success,
                    "failed": failed,
                    "batch": batch.id,
                })));
            }

            let full_batch = db
                .get_batch(params::GetBatch {
                    user_id: user_id.clone(),
                    collection: collection.clone(),
                    id: batch.id.clone(),
                })
                .await?
                .ok_or_else(DbError::batch_not_found)?;

            let modified = db
                .commit_batch(params::CommitBatch {
                    user_id: user_id.clone(),
                    collection: collection.clone(),
                    batch: full_batch,
                })
                .await?;

            Ok(HttpResponse::Ok()
                .insert_header((X_LAST_MODIFIED, modified.as_header()))
                .json(serde_json::json!({
                    "success": success,
                    "failed": failed,
                    "modified": modified,
                })))
        }))
        .await
}

pub async fn delete_bso(bso_req: BsoRequest, db_pool: DbTransactionPool) -> Result<HttpResponse, ApiError> {
    bso_req.emit_api_metric("request.delete_bso");
    let user_id = bso_req.user_id;
    let collection = bso_req.collection;
    let id = bso_req.bso;

    db_pool
        .transaction_http(db_action!(db => {
            let modified = db.delete_bso(params::DeleteBso { user_id, collection, id }).await?;
            Ok(HttpResponse::Ok()
                .insert_header((X_LAST_MODIFIED, modified.as_header()))
                .json(serde_json::json!({ "modified": modified })))
        }))
        .await
}

pub async fn get_bso(bso_req: BsoRequest, db_pool: DbTransactionPool) -> Result<HttpResponse, ApiError> {
    bso_req.emit_api_metric("request.get_bso");
    let user_id = bso_req.user_id;
    let collection = bso_req.collection;
    let id = bso_req.bso;

    db_pool
        .transaction_http(db_action!(db => {
            let result = db.get_bso(params::GetBso { user_id, collection, id }).await?;
            Ok(result.map_or_else(
                || HttpResponse::NotFound().finish(),
                |bso| HttpResponse::Ok().json(bso),
            ))
        }))
        .await
}

pub async fn put_bso(bso_req: BsoPutRequest, db_pool: DbTransactionPool) -> Result<HttpResponse, ApiError> {
    bso_req.emit_api_metric("request.put_bso");
    let user_id = bso_req.user_id;
    let collection = bso_req.collection;
    let id = bso_req.bso;
    let body = bso_req.body;

    db_pool
        .transaction_http(db_action!(db => {
            let result = db
                .put_bso(params::PutBso {
                    user_id,
                    collection,
                    id,
                    sortindex: body.sortindex,
                    payload: body.payload,
                    ttl: body.ttl,
                })
                .await?;
            Ok(HttpResponse::Ok()
                .insert_header((X_LAST_MODIFIED, result.as_header()))
                .json(result))
        }))
        .await
}

/// No db work or meaningful precondition to check here: the configuration is process-wide, not
/// per-user, so this manually sets `X-Last-Modified` to `0.00` instead of going through
/// `transaction_http`.
pub async fn get_configuration(state: Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((X_LAST_MODIFIED, "0.00"))
        .content_type("application/json")
        .body(state.limits_json.clone())
}

pub async fn heartbeat(hb: HeartbeatRequest) -> Result<HttpResponse, ApiError> {
    let mut checklist: HashMap<String, Value> = HashMap::new();
    checklist.insert("version".to_owned(), Value::String(env!("CARGO_PKG_VERSION").to_owned()));
    checklist.insert(
        "quota".to_owned(),
        serde_json::to_value(hb.quota).map_err(|e| ApiError::internal(e.to_string()))?,
    );

    let db = match hb.db_pool.get().await {
        Ok(db) => db,
        Err(e) => {
            error!("Heartbeat error: {:?}", e);
            checklist.insert("status".to_owned(), Value::String("Err".to_owned()));
            checklist.insert("database".to_owned(), Value::String("Unknown".to_owned()));
            return Ok(HttpResponse::ServiceUnavailable().json(checklist));
        }
    };

    match check_db(db).await {
        Ok(true) => {
            checklist.insert("status".to_owned(), Value::String("Ok".to_owned()));
            checklist.insert("database".to_owned(), Value::String("Ok".to_owned()));
            Ok(HttpResponse::Ok().json(checklist))
        }
        Ok(false) | Err(_) => {
            checklist.insert("status".to_owned(), Value::String("Err".to_owned()));
            checklist.insert("database".to_owned(), Value::String("Err".to_owned()));
            warn!("Heartbeat check failed");
            Ok(HttpResponse::ServiceUnavailable().json(checklist))
        }
    }
}

async fn check_db(mut db: Box<dyn Db<Error = DbError>>) -> Result<bool, DbError> {
    db.check().await
}

pub async fn lbheartbeat(req: HttpRequest) -> Result<HttpResponse, ApiError> {
    use syncstore_db_common::GetPoolState;

    let state = req
        .app_data::<Data<ServerState>>()
        .ok_or_else(|| ApiError::from(ApiErrorKind::NoServerState))?;

    let mut deadman = *state.deadman.write().map_err(|_| ApiError::internal("deadman lock poisoned".to_owned()))?;

    if let Some(expiry) = deadman.expiry {
        if std::time::Instant::now() >= expiry {
            return Ok(HttpResponse::InternalServerError().json(serde_json::json!({
                "status": "error",
                "message": "Forcing a restart via deadman timeout",
            })));
        }
    }

    let pool_state = state.db_pool.state();
    let active = pool_state.connections.saturating_sub(pool_state.idle_connections);

    let mut body = serde_json::Map::new();
    body.insert("active_connections".to_owned(), Value::from(active));
    body.insert("idle_connections".to_owned(), Value::from(pool_state.idle_connections));

    let status = if active >= deadman.max_size && pool_state.idle_connections == 0 {
        let clock_start = deadman.clock_start.unwrap_or_else(std::time::Instant::now);
        deadman.clock_start = Some(clock_start);
        body.insert(
            "duration_ms".to_owned(),
            Value::from(clock_start.elapsed().as_millis() as u64),
        );
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        deadman.clock_start = None;
        StatusCode::OK
    };
    deadman.previous_count = active as usize;

    *state
        .deadman
        .write()
        .map_err(|_| ApiError::internal("deadman lock poisoned".to_owned()))? = deadman;

    Ok(HttpResponse::build(status).json(body))
}

pub async fn test_error(_req: HttpRequest, _ter: TestErrorRequest) -> Result<HttpResponse, ApiError> {
    error!("Test Error");
    Err(ApiError::from(ApiErrorKind::Internal("Oh Noes!".to_owned())))
}
