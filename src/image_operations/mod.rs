// mod.rs

pub mod auth;
pub mod background_workers;
pub mod file_handlers;
pub mod handler_utils;
pub mod index;
pub mod record;
pub mod serve;
pub mod store;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware,
    routing::get,
    Router,
};
use tokio::sync::Semaphore;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;

use index::RecordIndex;
use serve::cache::ResultCache;
use serve::httploader::HttpLoader;
use store::BlobStore;

// --- Application State ---
pub struct AppState {
    pub config: Config,
    pub store: BlobStore,
    pub http_loader: Option<HttpLoader>,
    pub result_cache: ResultCache,
    pub serve_limiter: Arc<Semaphore>,
    pub serve_tickets: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let index = RecordIndex::open(&config.leveldb_path)?;
        let store = BlobStore::open(
            index,
            config.upload_path.clone(),
            config.max_upload_size,
            config.soft_delete,
            config.allowed_mime_types.clone(),
        )?;
        let http_loader = HttpLoader::new(
            &config.serve_allowed_http_sources,
            config.max_upload_size,
            config.request_timeout,
        )?;
        let result_cache = ResultCache::open(
            config.result_cache_path.clone(),
            config.serve_result_cache_ttl,
        )?;

        // Transform budget: a worker slot per concurrent codec call, and a
        // bounded waiting room on top of that.
        let serve_limiter = Arc::new(Semaphore::new(config.serve_concurrency));
        let serve_tickets = Arc::new(Semaphore::new(
            config.serve_concurrency + config.serve_queue_size,
        ));

        Ok(Self {
            config,
            store,
            http_loader,
            result_cache,
            serve_limiter,
            serve_tickets,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = if state.config.cors_allowed_origins == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_allowed_origins
            .split(',')
            .filter_map(|o| o.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let body_limit = DefaultBodyLimit::max((state.config.max_upload_size as usize).saturating_add(1024));

    let files_routes = Router::new()
        .route("/files", get(file_handlers::list_files))
        .route(
            "/files/{*key}",
            get(file_handlers::get_file)
                .put(file_handlers::put_file)
                .delete(file_handlers::delete_file),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::verify_access,
        ));

    let sign_routes = Router::new()
        .route("/sign/{*path}", get(auth::sign_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::verify_api_key,
        ));

    let serve_routes = Router::new().route("/serve/{*rest}", get(serve::serve_handler));

    Router::new()
        .merge(files_routes)
        .merge(sign_routes)
        .merge(serve_routes)
        .route("/health", get(|| async { "OK" }))
        .layer(body_limit)
        .layer(cors)
        .with_state(state)
}
