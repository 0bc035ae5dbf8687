// file_handlers.rs
//
// The /files HTTP surface over the blob store: streaming PUT/GET, DELETE
// with optional unlink, and prefix listing with signed pagination links.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path as AxumPath, Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use futures_util::TryStreamExt;
use tokio_util::io::ReaderStream;

use super::auth;
use super::handler_utils::{AppError, ListResponse};
use super::AppState;

pub async fn put_file(
    State(state): State<Arc<AppState>>,
    AxumPath(key): AxumPath<String>,
    req: Request,
) -> Result<StatusCode, AppError> {
    let declared_len = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let body = req
        .into_body()
        .into_data_stream()
        .map_err(anyhow::Error::from);
    state.store.put(&key, body, declared_len).await?;
    Ok(StatusCode::CREATED)
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    AxumPath(key): AxumPath<String>,
    method: Method,
) -> Result<Response, AppError> {
    let blob = state.store.get(&key).await?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, blob.content_type)
        .header(header::CONTENT_LENGTH, blob.size);
    if !blob.hash.is_empty() {
        builder = builder.header("Content-MD5", blob.hash.as_str());
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::with_capacity(blob.file, 64 * 1024))
    };

    builder
        .body(body)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("build response: {e}")))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    AxumPath(key): AxumPath<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<StatusCode, AppError> {
    let unlink = query.contains_key("unlink");
    state.store.delete(&key, unlink).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let starting_at = query.get("starting_at").cloned().filter(|s| !s.is_empty());
    let unlinked = query.contains_key("unlinked");
    let limit = match query.get("limit") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| AppError::BadRequest("invalid limit".to_string()))?,
        None => 0,
    };

    tracing::info!(prefix = %prefix, ?starting_at, limit, unlinked, "LIST");

    let (keys, has_more, next) = state
        .store
        .list(&prefix, starting_at, limit, unlinked)
        .await?;

    // The next-page link is pre-signed so a client holding only a signed
    // URL can keep paging without the API key.
    let next_page = match next {
        Some(cursor) => {
            let mut next_query = format!(
                "prefix={}&starting_at={}",
                encode_component(&prefix),
                encode_component(&cursor)
            );
            if limit > 0 {
                next_query.push_str(&format!("&limit={limit}"));
            }
            if unlinked {
                next_query.push_str("&unlinked=true");
            }
            auth::sign_url(
                "/files",
                Some(&next_query),
                &state.config.signature_secret_key,
                Utc::now().timestamp_millis(),
            )?
        }
        None => String::new(),
    };

    let mut resp = Json(ListResponse {
        keys,
        has_more,
        next_page,
    })
    .into_response();
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(resp)
}

fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
