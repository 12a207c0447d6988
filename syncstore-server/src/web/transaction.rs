//! Ties every handler's db work to a single locked transaction (spec.md §5, §7): acquire a
//! connection, take the appropriate collection lock (or a plain `begin` for storage-wide routes),
//! run the handler's closure, then commit on success or roll back on failure. `transaction_http`
//! additionally runs the precondition check (§7) before the handler's closure and stamps
//! `X-Last-Modified` on the way out.

use actix_web::{
    dev::Payload,
    http::header::{HeaderName, HeaderValue, Method},
    rt, Error, FromRequest, HttpMessage, HttpRequest, HttpResponse,
};
use futures::future::{FutureExt, LocalBoxFuture};
use rand::Rng;
use syncstore_cache::CoherentDb;
use syncstore_db_common::{params, Db, DbErrorIntrospect, DbPool, UserIdentifier};
use syncstore_mysql::DbError;

use super::extractors::{
    bso_param::BsoParam, collection_param::CollectionParam, precondition_header::PreConditionHeader,
    precondition_header::PreConditionHeaderOpt,
};
use crate::{error::ApiError, server::ServerState};

pub type DbActionResult<R> = (Box<dyn Db<Error = DbError>>, Result<R, ApiError>);
pub type DbAction<R> = Box<dyn FnOnce(Box<dyn Db<Error = DbError>>) -> LocalBoxFuture<'static, DbActionResult<R>>>;

/// Bound on lock-acquisition retries for spec.md §7's "Conflict (transient)" case: a
/// `lock_for_write` that loses a race reports a conflict rather than silently overwriting the
/// other writer's timestamp (see `MysqlDb::lock_for_write`); retrying with a fresh clock reading
/// a bounded number of times gives the losing request a chance to land strictly after the
/// winner before giving up with a 503 the client can act on via `Retry-After`.
const MAX_LOCK_RETRIES: u8 = 3;
const RETRY_BASE_DELAY_MS: u64 = 10;

#[derive(Clone)]
pub struct DbTransactionPool {
    pool: Box<dyn DbPool<Error = DbError>>,
    coherence: syncstore_cache::CollectionCoherence,
    is_read: bool,
    user_id: UserIdentifier,
    collection: Option<String>,
    bso_opt: Option<String>,
    precondition: PreConditionHeaderOpt,
}

impl DbTransactionPool {
    pub fn get_pool(&self) -> &Box<dyn DbPool<Error = DbError>> {
        &self.pool
    }

    fn get_lock_collection(&self) -> Option<params::LockCollection> {
        self.collection.as_ref().map(|collection| params::LockCollection {
            user_id: self.user_id.clone(),
            collection: collection.clone(),
        })
    }

    async fn get_db(&self) -> Result<Box<dyn Db<Error = DbError>>, ApiError> {
        let raw = self.pool.get().await.map_err(ApiError::from)?;
        Ok(Box::new(CoherentDb::new(
            raw,
            self.coherence.clone(),
            self.user_id.legacy_id,
        )) as Box<dyn Db<Error = DbError>>)
    }

    /// Acquires the collection lock (or a plain `begin`) this request needs, retrying a bounded
    /// number of times with jittered back-off on a write/write conflict before giving up with
    /// `ApiError::retries_exhausted()` (spec.md §7).
    async fn acquire_lock(&self, db: &mut Box<dyn Db<Error = DbError>>, for_write: bool) -> Result<(), ApiError> {
        let mut attempt: u8 = 0;
        loop {
            let locked = match self.get_lock_collection() {
                Some(params) if for_write => db.lock_for_write(params).await,
                Some(params) => db.lock_for_read(params).await,
                None => db.begin(for_write).await,
            };
            match locked {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < MAX_LOCK_RETRIES => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY_MS * attempt as u64
                        + rand::thread_rng().gen_range(0..RETRY_BASE_DELAY_MS);
                    rt::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(e) if e.is_conflict() => return Err(ApiError::retries_exhausted()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn transaction_internal<R: 'static>(
        &self,
        action: DbAction<R>,
    ) -> Result<(Box<dyn Db<Error = DbError>>, R), ApiError> {
        let mut db = self.get_db().await?;
        let for_write = !self.is_read;

        self.acquire_lock(&mut db, for_write).await?;

        let (db, result) = action(db).await;
        match result {
            Ok(r) => Ok((db, r)),
            Err(e) => {
                let _ = db.rollback().await;
                Err(e)
            }
        }
    }

    /// Runs `action` in a transaction, committing on success and rolling back on error. Used by
    /// routes with no response-status-dependent commit decision (dockerflow, `info/configuration`).
    pub async fn transaction<R: 'static>(&self, action: DbAction<R>) -> Result<R, ApiError> {
        let (mut db, r) = self.transaction_internal(action).await?;
        db.commit().await.map_err(ApiError::from)?;
        Ok(r)
    }

    /// Runs `action` behind the precondition check (§7): short-circuits with 304/412 if the
    /// targeted resource's timestamp fails the client's `X-If-*-Since` header, otherwise runs
    /// `action` and stamps `X-Last-Modified` on its response if `action` didn't set one itself.
    pub async fn transaction_http(&self, action: DbAction<HttpResponse>) -> Result<HttpResponse, ApiError> {
        let precondition = self.precondition.clone();
        let collection = self.collection.clone();
        let bso = self.bso_opt.clone();
        let user_id = self.user_id.clone();

        let wrapped: DbAction<HttpResponse> = Box::new(move |mut db| {
            async move {
                let resource_ts = match db.extract_resource(user_id, collection, bso).await {
                    Ok(ts) => ts,
                    Err(e) => return (db, Err(e.into())),
                };

                if let Some(cond) = &precondition.opt {
                    match cond {
                        PreConditionHeader::IfModifiedSince(ts) if resource_ts <= *ts => {
                            let resp = HttpResponse::NotModified()
                                .insert_header(("X-Last-Modified", resource_ts.as_header()))
                                .finish();
                            return (db, Ok(resp));
                        }
                        PreConditionHeader::IfUnmodifiedSince(ts) if resource_ts > *ts => {
                            let resp = HttpResponse::PreconditionFailed()
                                .insert_header(("X-Last-Modified", resource_ts.as_header()))
                                .finish();
                            return (db, Ok(resp));
                        }
                        _ => {}
                    }
                }

                let (db, result) = action(db).await;
                let result = result.map(|mut resp| {
                    let xlm = HeaderName::from_static("x-last-modified");
                    if !resp.headers().contains_key(&xlm) {
                        if let Ok(value) = HeaderValue::from_str(&resource_ts.as_header()) {
                            resp.headers_mut().insert(xlm, value);
                        }
                    }
                    resp
                });
                (db, result)
            }
            .boxed_local()
        });

        let (mut db, resp) = self.transaction_internal(wrapped).await?;
        db.commit().await.map_err(ApiError::from)?;
        Ok(resp)
    }
}

fn bso_from_path(req: &HttpRequest) -> Result<Option<String>, Error> {
    let elements: Vec<&str> = req.uri().path().split('/').collect();
    if elements.get(3) != Some(&"storage") || elements.len() != 6 {
        return Ok(None);
    }
    let bso = BsoParam::extrude(req.head(), &mut req.extensions_mut())?;
    Ok(Some(bso.bso))
}

/// Builds a `DbAction<HttpResponse>` out of an ordinary (non-closure-captured) async block,
/// since stable Rust has no async closures: `db_action!(db => { ... })` expands to a boxed
/// closure taking ownership of `db`, running `{ ... }` against it, and handing `db` back
/// alongside the `Result<HttpResponse, ApiError>` the block produced.
#[macro_export]
macro_rules! db_action {
    ($db:ident => $body:expr) => {
        Box::new(
            move |mut $db: Box<dyn ::syncstore_db_common::Db<Error = ::syncstore_mysql::DbError>>| {
                Box::pin(async move {
                    let result: Result<actix_web::HttpResponse, $crate::error::ApiError> =
                        async move { $body }.await;
                    ($db, result)
                })
                    as futures::future::LocalBoxFuture<
                        'static,
                        (
                            Box<dyn ::syncstore_db_common::Db<Error = ::syncstore_mysql::DbError>>,
                            Result<actix_web::HttpResponse, $crate::error::ApiError>,
                        ),
                    >
            },
        )
    };
}

impl FromRequest for DbTransactionPool {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        if let Some(cached) = req.extensions().get::<Self>() {
            return futures::future::ok(cached.clone()).boxed_local();
        }

        let req = req.clone();
        let user_id_fut = UserIdentifier::from_request(&req, payload);
        let precondition_fut = PreConditionHeaderOpt::from_request(&req, payload);

        let state = req
            .app_data::<actix_web::web::Data<ServerState>>()
            .map(|s| (s.db_pool.clone(), s.coherence.clone()));

        let is_read = matches!(*req.method(), Method::GET | Method::HEAD);

        async move {
            let (pool, coherence) = state.ok_or_else(|| {
                ApiError::from(crate::error::ApiErrorKind::NoServerState)
            })?;
            let user_id = user_id_fut.await?;
            let precondition = precondition_fut.await?;
            let collection = CollectionParam::extrude(req.uri(), &mut req.extensions_mut())?
                .map(|c| c.collection);
            let bso_opt = bso_from_path(&req)?;

            let pool = DbTransactionPool {
                pool,
                coherence,
                is_read,
                user_id,
                collection,
                bso_opt,
                precondition,
            };
            req.extensions_mut().insert(pool.clone());
            Ok(pool)
        }
        .boxed_local()
    }
}
