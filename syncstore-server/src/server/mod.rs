//! Main application server (spec.md §6): wires `Settings` into a running `actix-web` service —
//! builds the db pool, the process-wide coherence cache, and the route table, then binds and
//! hands back a `dev::Server` future the caller `await`s.

use std::{
    fmt,
    sync::{Arc, RwLock},
    time::Duration,
};

use actix_cors::Cors;
use actix_web::{
    dev,
    http::StatusCode,
    http::{header::LOCATION, Method},
    middleware::errhandlers::ErrorHandlerResponse,
    rt, web, App, HttpRequest, HttpResponse, HttpServer,
};
use cadence::{Gauged, StatsdClient};
use syncstore_cache::CollectionCoherence;
use syncstore_common::{metrics_from_opts, BlockingThreadpool, Metrics};
use syncstore_db_common::{DbPool, GetPoolState, PoolState};
use syncstore_mysql::{DbError, MysqlDbPool};
use syncstore_settings::{Deadman, Quota, ServerLimits, Settings};

use crate::error::ApiError;
use crate::web::{extractors::constants::BSO_ID_REGEX, extractors::constants::COLLECTION_ID_REGEX, handlers};

pub const SYNC_VERSION_PATH: &str = "1.5";
const UID_REGEX: &str = r"[0-9]{1,10}";
pub const SYNC_DOCS_URL: &str =
    "https://mozilla-services.readthedocs.io/en/latest/storage/apis-1.5.html";

/// The global HTTP state object made available to every handler/extractor via `web::Data`.
pub struct ServerState {
    pub db_pool: Box<dyn DbPool<Error = DbError>>,
    pub coherence: CollectionCoherence,
    pub limits: Arc<ServerLimits>,
    pub limits_json: String,
    pub metrics: Arc<StatsdClient>,
    pub quota: Quota,
    pub deadman: RwLock<Deadman>,
    pub port: u16,
}

/// Substitutes the `{collection}`/`{bso}` path placeholders with their validation regexes
/// (spec.md §3's charset restrictions) and prefixes the versioned, user-scoped root.
pub fn cfg_path(path: &str) -> String {
    let path = path
        .replace("{collection}", &format!("{{collection:{}}}", COLLECTION_ID_REGEX))
        .replace("{bso}", &format!("{{bso:{}}}", BSO_ID_REGEX));
    format!("/{}/{{uid:{}}}{}", SYNC_VERSION_PATH, UID_REGEX, path)
}

#[macro_export]
macro_rules! build_app {
    ($state: expr, $limits: expr, $cors: expr) => {
        App::new()
            .data($state)
            .wrap(actix_web::middleware::errhandlers::ErrorHandlers::new().handler(
                actix_web::http::StatusCode::NOT_FOUND,
                $crate::server::render_404,
            ))
            .wrap($crate::middleware::WeaveTimestamp::new())
            .wrap($crate::middleware::RejectUA::default())
            .wrap($cors)
            .service(
                web::resource(&$crate::server::cfg_path("/info/collections"))
                    .route(web::get().to(handlers::get_collections)),
            )
            .service(
                web::resource(&$crate::server::cfg_path("/info/collection_counts"))
                    .route(web::get().to(handlers::get_collection_counts)),
            )
            .service(
                web::resource(&$crate::server::cfg_path("/info/collection_usage"))
                    .route(web::get().to(handlers::get_collection_usage)),
            )
            .service(
                web::resource(&$crate::server::cfg_path("/info/configuration"))
                    .route(web::get().to(handlers::get_configuration)),
            )
            .service(
                web::resource(&$crate::server::cfg_path("/info/quota"))
                    .route(web::get().to(handlers::get_quota)),
            )
            .service(
                web::resource(&$crate::server::cfg_path(""))
                    .route(web::delete().to(handlers::delete_all)),
            )
            .service(
                web::resource(&$crate::server::cfg_path("/storage"))
                    .route(web::delete().to(handlers::delete_all)),
            )
            .service(
                web::resource(&$crate::server::cfg_path("/storage/{collection}"))
                    .app_data(web::PayloadConfig::new($limits.max_request_bytes as usize))
                    .app_data(
                        web::JsonConfig::default()
                            .limit($limits.max_request_bytes as usize)
                            .content_type(|ct| ct == mime::TEXT_PLAIN),
                    )
                    .route(web::delete().to(handlers::delete_collection))
                    .route(web::get().to(handlers::get_collection))
                    .route(web::post().to(handlers::post_collection)),
            )
            .service(
                web::resource(&$crate::server::cfg_path("/storage/{collection}/{bso}"))
                    .app_data(web::PayloadConfig::new($limits.max_request_bytes as usize))
                    .app_data(
                        web::JsonConfig::default()
                            .limit($limits.max_request_bytes as usize)
                            .content_type(|ct| ct == mime::TEXT_PLAIN),
                    )
                    .route(web::delete().to(handlers::delete_bso))
                    .route(web::get().to(handlers::get_bso))
                    .route(web::put().to(handlers::put_bso)),
            )
            // Dockerflow (spec.md's out-of-scope "outer load-balancer" operational surface).
            .service(web::resource("/__heartbeat__").route(web::get().to(handlers::heartbeat)))
            .service(
                web::resource("/__lbheartbeat__").route(web::get().to(handlers::lbheartbeat)),
            )
            .service(
                web::resource("/__version__").route(web::get().to(|_: HttpRequest| {
                    HttpResponse::Ok()
                        .content_type("application/json")
                        .body(include_str!("../../version.json"))
                })),
            )
            .service(web::resource("/__error__").route(web::get().to(handlers::test_error)))
            .service(web::resource("/").route(web::get().to(|_: HttpRequest| {
                HttpResponse::Found()
                    .header(LOCATION, $crate::server::SYNC_DOCS_URL)
                    .finish()
            })))
    };
}

pub struct Server;

impl Server {
    pub async fn with_settings(mut settings: Settings) -> Result<dev::Server, ApiError> {
        settings.normalize();
        let settings_copy = settings.clone();
        let metrics = metrics_from_opts(&settings.statsd_label, settings.statsd_host.as_deref(), settings.statsd_port)
            .map_err(ApiError::from)?;
        let host = settings.host.clone();
        let port = settings.port;
        let actix_keep_alive = settings.actix_keep_alive;
        let deadman = Deadman::from(&settings);
        let blocking_threadpool = Arc::new(BlockingThreadpool::default());

        let mut db_pool =
            MysqlDbPool::new(&settings, &Metrics::from(&metrics), blocking_threadpool.clone())
                .map_err(|e| ApiError::internal(e.to_string()))?;
        db_pool.init().await.map_err(|e| ApiError::internal(e.to_string()))?;
        let db_pool: Box<dyn DbPool<Error = DbError>> = Box::new(db_pool);

        let coherence = CollectionCoherence::new();
        let limits = Arc::new(settings.limits.clone());
        let limits_json = serde_json::to_string(&*limits).expect("ServerLimits failed to serialize");
        let quota = Quota {
            size: settings.limits.max_quota_limit as usize,
            enabled: settings.enable_quota,
            enforced: settings.enforce_quota,
        };

        spawn_metric_periodic_reporter(Duration::from_secs(10), metrics.clone(), db_pool.clone())?;

        let mut server = HttpServer::new(move || {
            let state = ServerState {
                db_pool: db_pool.clone(),
                coherence: coherence.clone(),
                limits: Arc::clone(&limits),
                limits_json: limits_json.clone(),
                metrics: metrics.clone(),
                quota,
                deadman: RwLock::new(deadman),
                port,
            };
            let limits = Arc::clone(&limits);
            build_app!(state, limits, build_cors(&settings_copy))
        });

        if let Some(keep_alive) = actix_keep_alive {
            server = server.keep_alive(keep_alive as usize);
        }

        let server = server
            .bind(format!("{}:{}", host, port))
            .map_err(|e| ApiError::internal(e.to_string()))?
            .run();
        Ok(server)
    }
}

fn build_cors(settings: &Settings) -> Cors {
    let mut cors = Cors::default();

    if let Some(allowed_methods) = &settings.cors_allowed_methods {
        let methods: Vec<Method> = allowed_methods
            .iter()
            .map(|m| Method::from_bytes(m.as_bytes()).unwrap())
            .collect();
        cors = cors.allowed_methods(methods);
    }
    if let Some(allowed_headers) = &settings.cors_allowed_headers {
        cors = cors.allowed_headers(allowed_headers);
    }
    if let Some(max_age) = &settings.cors_max_age {
        cors = cors.max_age(*max_age);
    }
    if let Some(ref origin) = settings.cors_allowed_origin {
        if origin == "*" {
            cors = cors.allow_any_origin();
        } else {
            cors = cors.allowed_origin(origin);
        }
    }

    cors
}

/// Replaces actix-web's default 404 body with the wire error contract's empty-object shape
/// (spec.md §7: a not-found *resource* carries a body, but an unmatched *route* is protocol-level
/// and gets the bare `{"code":1,...}` shape every other validation failure uses).
pub fn render_404<B>(res: dev::ServiceResponse<B>) -> actix_web::Result<ErrorHandlerResponse<B>> {
    let resp = HttpResponse::build(StatusCode::NOT_FOUND)
        .json(serde_json::json!({"code": 1, "message": "invalid protocol"}));
    Ok(ErrorHandlerResponse::Response(dev::ServiceResponse::new(
        res.request().clone(),
        resp.into_body(),
    )))
}

/// Emits database pool metrics periodically (spec.md's ambient observability stack).
fn spawn_metric_periodic_reporter(
    interval: Duration,
    metrics: Arc<StatsdClient>,
    pool: Box<dyn DbPool<Error = DbError>>,
) -> Result<(), ApiError> {
    let hostname = hostname::get()
        .map_err(|e| ApiError::internal(e.to_string()))?
        .into_string()
        .map_err(|_| ApiError::internal("non-utf8 hostname".to_owned()))?;

    rt::spawn(async move {
        loop {
            let PoolState {
                connections,
                idle_connections,
            } = GetPoolState::state(&pool);
            metrics
                .gauge_with_tags(
                    "storage.pool.connections.active",
                    (connections - idle_connections) as u64,
                )
                .with_tag("hostname", &hostname)
                .send();
            metrics
                .gauge_with_tags("storage.pool.connections.idle", idle_connections as u64)
                .with_tag("hostname", &hostname)
                .send();

            rt::time::sleep(interval).await;
        }
    });

    Ok(())
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerState").field("port", &self.port).finish()
    }
}
