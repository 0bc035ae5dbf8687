// serve/mod.rs
//
// The transformation pipeline surface. A request is admitted by the
// path-segment signature (or `unsafe` in development), resolved against
// the result cache, loaded from the blob store or an allow-listed HTTP
// origin, transformed under the bounded concurrency budget, cached, and
// streamed back with cache headers.

pub mod cache;
pub mod filters;
pub mod httploader;
pub mod params;
pub mod processor;

use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    body::Body,
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use tokio::time::timeout;

use super::auth;
use super::handler_utils::AppError;
use super::AppState;
use params::{Params, Source};
use processor::AcceptFormats;

enum Transformed {
    Image(processor::TransformOutput),
    Meta(processor::ImageMeta),
}

pub async fn serve_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(rest): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    // `meta` rides in front of the signature segment.
    let (meta, rest) = match rest.strip_prefix("meta/") {
        Some(stripped) => (true, stripped),
        None => (false, rest.as_str()),
    };

    let (first, op_path) = rest
        .split_once('/')
        .ok_or_else(|| AppError::BadRequest("missing operation path".to_string()))?;

    // Signature gate. The message is the raw path after the signature.
    if first == "unsafe" {
        if !state.config.unsafe_enabled() {
            return Err(AppError::Forbidden);
        }
    } else {
        let expected = auth::sign(op_path, &state.config.signature_secret_key);
        if first.len() != expected.len() {
            // First segment is not a signature at all.
            return Err(AppError::Forbidden);
        }
        if !auth::constant_time_eq(first, &expected) {
            return Err(AppError::Unauthorized);
        }
    }

    let params = Params::parse(op_path)?;

    let accept_header = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let accept = AcceptFormats {
        webp: state.config.serve_auto_webp && accept_header.contains("image/webp"),
        avif: state.config.serve_auto_avif && accept_header.contains("image/avif"),
    };

    // Negotiated output is part of the identity of a cached result.
    let cache_key = format!(
        "{}|webp={}|avif={}",
        params.format(),
        accept.webp,
        accept.avif
    );
    if !meta {
        if let Some((body, content_type)) = state.result_cache.get(&cache_key).await {
            tracing::debug!(key = %cache_key, "result cache hit");
            return Ok(image_response(&state, body, &content_type));
        }
    }

    // Admission: a queue ticket first (overflow fails fast), then a
    // worker slot bounded by the request deadline.
    let _ticket = state
        .serve_tickets
        .clone()
        .try_acquire_owned()
        .map_err(|_| AppError::ServiceUnavailable)?;
    let _permit = timeout(
        state.config.request_timeout,
        state.serve_limiter.clone().acquire_owned(),
    )
    .await
    .map_err(|_| AppError::GatewayTimeout)?
    .map_err(|e| AppError::Internal(anyhow!(e)))?;

    // Load phase.
    let src = timeout(state.config.request_timeout, load_source(&state, &params.source))
        .await
        .map_err(|_| AppError::GatewayTimeout)??;

    // Process phase runs the codec on the blocking pool.
    let worker_params = params.clone();
    let transformed = timeout(
        state.config.request_timeout,
        tokio::task::spawn_blocking(move || {
            if meta {
                processor::inspect(&src, &worker_params, accept).map(Transformed::Meta)
            } else {
                processor::process(&src, &worker_params, accept).map(Transformed::Image)
            }
        }),
    )
    .await
    .map_err(|_| AppError::GatewayTimeout)?
    .map_err(|e| AppError::Internal(anyhow!("transform task: {e}")))??;

    match transformed {
        Transformed::Meta(meta) => Ok(Json(meta).into_response()),
        Transformed::Image(out) => {
            // Save phase; a failed cache write only costs the next request.
            if let Err(err) = timeout(
                state.config.request_timeout,
                state
                    .result_cache
                    .put(&cache_key, &out.bytes, out.content_type),
            )
            .await
            .map_err(|_| anyhow!("cache write timed out"))
            .and_then(|r| r)
            {
                tracing::warn!(key = %cache_key, error = %err, "result cache write failed");
            }
            Ok(image_response(&state, out.bytes, out.content_type))
        }
    }
}

async fn load_source(state: &AppState, source: &Source) -> Result<Vec<u8>, AppError> {
    match source {
        Source::Blob(key) => state.store.get_bytes(key).await,
        Source::Url(url) => {
            let loader = state.http_loader.as_ref().ok_or(AppError::Forbidden)?;
            let (bytes, _content_type) = loader.load(url).await?;
            Ok(bytes)
        }
    }
}

fn image_response(state: &AppState, body: Vec<u8>, content_type: &str) -> Response {
    let cache_control = format!(
        "public, max-age={}, stale-while-revalidate={}",
        state.config.serve_cache_control_ttl.as_secs(),
        state.config.serve_cache_control_swr.as_secs()
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, body.len())
        .header(header::CACHE_CONTROL, cache_control)
        .body(Body::from(body))
        .expect("static response headers are valid")
}
