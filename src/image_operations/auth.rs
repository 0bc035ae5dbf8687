// auth.rs
//
// HMAC-SHA256 URL signing and the access gate. Two surfaces:
//   /files  -> x-api-key header OR expiring (x-signature, x-expire) query
//   /sign   -> x-api-key header only
// The /serve surface carries its signature as the first path segment and
// is verified inside the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, RawQuery, Request, State},
    middleware::Next,
    response::Response,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::handler_utils::AppError;
use super::AppState;

type HmacSha256 = Hmac<Sha256>;

const SIGNED_URL_TTL_MS: i64 = 60 * 60 * 1000;

/// HMAC-SHA256 of `message` under `secret`, base64url without padding.
/// A single leading slash is stripped first so `/files/a` and `files/a`
/// sign identically.
pub fn sign(message: &str, secret: &str) -> String {
    let message = message.strip_prefix('/').unwrap_or(message);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Mint a signed URL for the path beneath `/sign`. `/files` paths get an
/// expiring query-string signature; `/serve` paths get the signature
/// inserted as the first path segment, which is where the pipeline
/// verifies it. The result is origin-relative.
pub fn sign_url(
    path: &str,
    query: Option<&str>,
    secret: &str,
    now_ms: i64,
) -> Result<String, AppError> {
    let path = path.strip_prefix("/sign").unwrap_or(path);

    if path.starts_with("/files") {
        let expire = now_ms + SIGNED_URL_TTL_MS;
        let signature = sign(&format!("{path}:{expire}"), secret);
        let mut url = path.to_string();
        url.push('?');
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push_str(query);
            url.push('&');
        }
        url.push_str(&format!("x-expire={expire}&x-signature={signature}"));
        return Ok(url);
    }

    if let Some(op_path) = path.strip_prefix("/serve") {
        let signature = sign(op_path, secret);
        let mut url = format!("/serve/{signature}{op_path}");
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        return Ok(url);
    }

    Err(AppError::BadRequest("invalid sign target".to_string()))
}

/// Query-string signature check for `/files` paths. Valid while
/// `now_ms <= x-expire`; any altered byte of path or expiry fails.
pub fn signature_valid(
    path: &str,
    signature: &str,
    expire: &str,
    now_ms: i64,
    secret: &str,
) -> bool {
    let expire_ms: i64 = match expire.parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    if now_ms > expire_ms {
        return false;
    }
    let expected = sign(&format!("{path}:{expire}"), secret);
    constant_time_eq(signature, &expected)
}

fn api_key_valid(req: &Request, secret: &str) -> bool {
    let presented = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    constant_time_eq(presented, secret)
}

/// Middleware for `/sign`: shared API key only.
pub async fn verify_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !api_key_valid(&req, &state.config.secret_key) {
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(req).await)
}

/// Middleware for `/files`: API key or a signed URL.
pub async fn verify_access(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if api_key_valid(&req, &state.config.secret_key) {
        return Ok(next.run(req).await);
    }

    let query: Query<HashMap<String, String>> =
        Query::try_from_uri(req.uri()).unwrap_or_else(|_| Query(HashMap::new()));
    if let (Some(signature), Some(expire)) = (query.get("x-signature"), query.get("x-expire")) {
        if signature_valid(
            req.uri().path(),
            signature,
            expire,
            Utc::now().timestamp_millis(),
            &state.config.signature_secret_key,
        ) {
            return Ok(next.run(req).await);
        }
    }

    Err(AppError::Unauthorized)
}

/// GET /sign/{*path}: responds with the signed URL as a text body.
pub async fn sign_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(path): AxumPath<String>,
    RawQuery(query): RawQuery,
) -> Result<String, AppError> {
    let signed = sign_url(
        &format!("/{path}"),
        query.as_deref(),
        &state.config.signature_secret_key,
        Utc::now().timestamp_millis(),
    )?;
    tracing::info!(path = %path, "signed URL issued");
    Ok(signed)
}
