// main.rs

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mojo_images::{router, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Mojo Images Server...");

    if config.cert_file.is_some() || config.cert_key_file.is_some() {
        // TLS termination belongs to the fronting proxy; the vars are
        // recognized so existing deploy configs keep working.
        warn!("CERT_FILE/CERT_KEY_FILE are set but TLS is terminated by the platform proxy");
    }

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config).context("initialize application state")?);

    mojo_images::image_operations::background_workers::spawn_cache_sweep_worker(
        state.config.result_cache_path.clone(),
        state.config.serve_result_cache_ttl,
    );

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind TCP listener")?;

    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Axum server failed")?;

    info!("server shutdown gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
