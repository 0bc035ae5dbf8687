//! End-to-end tests over the in-process router: upload, signed access,
//! deletion, listing, and the transformation pipeline.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use tempfile::TempDir;
use tower::util::ServiceExt;

use mojo_images::config::{Config, Environment};
use mojo_images::image_operations::auth::sign;
use mojo_images::{router, AppState};

const API_KEY: &str = "pw";
const SIGN_SECRET: &str = "sign-secret";

fn test_config(root: &Path) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        cert_file: None,
        cert_key_file: None,
        max_upload_size: 10 * 1024 * 1024,
        upload_path: root.join("uploads"),
        leveldb_path: root.join("index"),
        result_cache_path: root.join("result-cache"),
        secret_key: API_KEY.to_string(),
        signature_secret_key: SIGN_SECRET.to_string(),
        soft_delete: false,
        allowed_mime_types: vec![
            "image/".to_string(),
            "text/".to_string(),
            "application/octet-stream".to_string(),
        ],
        serve_allowed_http_sources: String::new(),
        serve_auto_webp: true,
        serve_auto_avif: false,
        serve_concurrency: 2,
        serve_queue_size: 2,
        serve_result_cache_ttl: Duration::from_secs(3600),
        serve_cache_control_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        serve_cache_control_swr: Duration::from_secs(24 * 60 * 60),
        request_timeout: Duration::from_secs(30),
        cors_allowed_origins: "*".to_string(),
        log_level: "info".to_string(),
        environment: Environment::Development,
    }
}

fn test_app(config: Config) -> (Arc<AppState>, Router) {
    let state = Arc::new(AppState::new(config).unwrap());
    let app = router(state.clone());
    (state, app)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

fn put_request(key: &str, body: &[u8]) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(format!("/files/{key}"))
        .header("x-api-key", API_KEY)
        .header("content-length", body.len().to_string())
        .body(Body::from(body.to_vec()))
        .unwrap()
}

fn get_request(uri: &str, api_key: bool) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if api_key {
        builder = builder.header("x-api-key", API_KEY);
    }
    builder.body(Body::empty()).unwrap()
}

fn png_of(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        width,
        height,
        Rgba([200, 30, 30, 255]),
    ));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

#[tokio::test]
async fn upload_then_download_with_content_md5() {
    let dir = TempDir::new().unwrap();
    let (_state, app) = test_app(test_config(dir.path()));

    let (status, _, _) = send(&app, put_request("a/b.jpg", b"hello world!")).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, headers, body) = send(&app, get_request("/files/a/b.jpg", true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello world!");
    assert_eq!(
        headers.get("Content-MD5").unwrap(),
        "fc3ff98e8c6a0d3087d515c0473f8677"
    );
    assert_eq!(headers.get("content-type").unwrap(), "text/plain");
    assert_eq!(headers.get("content-length").unwrap(), "12");
}

#[tokio::test]
async fn put_without_content_length_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (_state, app) = test_app(test_config(dir.path()));

    let req = Request::builder()
        .method("PUT")
        .uri("/files/k")
        .header("x-api-key", API_KEY)
        .header("content-length", "0")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::LENGTH_REQUIRED);
}

#[tokio::test]
async fn signed_urls_replace_the_api_key() {
    let dir = TempDir::new().unwrap();
    let (_state, app) = test_app(test_config(dir.path()));

    send(&app, put_request("a/b.jpg", b"hello world!")).await;

    // Without credentials: 401.
    let (status, _, _) = send(&app, get_request("/files/a/b.jpg", false)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Mint a signed URL (requires the API key) and fetch through it.
    let (status, _, body) = send(&app, get_request("/sign/files/a/b.jpg", true)).await;
    assert_eq!(status, StatusCode::OK);
    let signed_url = String::from_utf8(body).unwrap();
    assert!(signed_url.starts_with("/files/a/b.jpg?"));

    let (status, _, body) = send(&app, get_request(&signed_url, false)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello world!");

    // An expired signature is rejected even when internally consistent.
    let expired_at = chrono::Utc::now().timestamp_millis() - 1000;
    let signature = sign(&format!("/files/a/b.jpg:{expired_at}"), SIGN_SECRET);
    let expired_url =
        format!("/files/a/b.jpg?x-expire={expired_at}&x-signature={signature}");
    let (status, _, _) = send(&app, get_request(&expired_url, false)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A tampered path fails too.
    let (status, _, _) = send(
        &app,
        get_request(&signed_url.replace("a/b.jpg", "a/c.jpg"), false),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn hard_delete_removes_record_and_file() {
    let dir = TempDir::new().unwrap();
    let (state, app) = test_app(test_config(dir.path()));

    send(&app, put_request("a/b.jpg", b"hello world!")).await;
    assert!(state.store.blob_path("a/b.jpg").exists());

    let req = Request::builder()
        .method("DELETE")
        .uri("/files/a/b.jpg")
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = send(&app, get_request("/files/a/b.jpg", true)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!state.store.blob_path("a/b.jpg").exists());

    // Deleting again: 404.
    let req = Request::builder()
        .method("DELETE")
        .uri("/files/a/b.jpg")
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unlink_keeps_the_record_for_listing() {
    let dir = TempDir::new().unwrap();
    let (_state, app) = test_app(test_config(dir.path()));

    send(&app, put_request("a/b.jpg", b"hello world!")).await;

    let req = Request::builder()
        .method("DELETE")
        .uri("/files/a/b.jpg?unlink=true")
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, body) =
        send(&app, get_request("/files?unlinked=true&prefix=a/", true)).await;
    assert_eq!(status, StatusCode::OK);
    let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed["keys"], serde_json::json!(["a/b.jpg"]));
    assert_eq!(listed["has_more"], serde_json::json!(false));

    let (_, _, body) = send(&app, get_request("/files?prefix=a/", true)).await;
    let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed["keys"], serde_json::json!([]));
}

#[tokio::test]
async fn list_paginates_with_signed_next_page() {
    let dir = TempDir::new().unwrap();
    let (_state, app) = test_app(test_config(dir.path()));

    for i in 0..5 {
        send(&app, put_request(&format!("p/{i}"), b"x")).await;
    }

    let (status, _, body) = send(&app, get_request("/files?prefix=p/&limit=2", true)).await;
    assert_eq!(status, StatusCode::OK);
    let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed["keys"], serde_json::json!(["p/0", "p/1"]));
    assert_eq!(listed["has_more"], serde_json::json!(true));

    // The next page link works without the API key.
    let next_page = listed["next_page"].as_str().unwrap().to_string();
    assert!(!next_page.is_empty());
    let (status, _, body) = send(&app, get_request(&next_page, false)).await;
    assert_eq!(status, StatusCode::OK);
    let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed["keys"], serde_json::json!(["p/2", "p/3"]));
}

#[tokio::test]
async fn concurrent_writer_conflicts() {
    let dir = TempDir::new().unwrap();
    let (state, app) = test_app(test_config(dir.path()));

    send(&app, put_request("x", b"winner")).await;

    // Simulate an in-flight writer holding the per-key lock.
    let guard = state.store.lock_key("x").unwrap();
    let (status, _, _) = send(&app, put_request("x", b"loser!")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    drop(guard);

    // The stored bytes are still the committed writer's.
    let (status, _, body) = send(&app, get_request("/files/x", true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"winner");
}

#[tokio::test]
async fn serve_resizes_an_uploaded_blob() {
    let dir = TempDir::new().unwrap();
    let (_state, app) = test_app(test_config(dir.path()));

    let png = png_of(200, 200);
    send(&app, put_request("a/b.jpg", &png)).await;

    // Dev mode allows the unsafe segment; no Accept header, so the source
    // format is kept.
    let (status, headers, body) =
        send(&app, get_request("/serve/unsafe/100x100/blob/a/b.jpg", false)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "image/png");
    let cache_control = headers.get("cache-control").unwrap().to_str().unwrap();
    assert!(cache_control.contains("max-age=604800"));
    assert!(cache_control.contains("stale-while-revalidate=86400"));

    let out = image::load_from_memory(&body).unwrap();
    assert_eq!(out.dimensions(), (100, 100));
}

#[tokio::test]
async fn serve_negotiates_webp_from_accept() {
    let dir = TempDir::new().unwrap();
    let (_state, app) = test_app(test_config(dir.path()));

    send(&app, put_request("pic", &png_of(50, 50))).await;

    let req = Request::builder()
        .method("GET")
        .uri("/serve/unsafe/25x25/blob/pic")
        .header("accept", "image/webp,image/*;q=0.8")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "image/webp");
}

#[tokio::test]
async fn serve_requires_a_valid_signature() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.environment = Environment::Production;
    let (_state, app) = test_app(config);

    send(&app, put_request("pic", &png_of(50, 50))).await;

    // unsafe is rejected outside development.
    let (status, _, _) = send(&app, get_request("/serve/unsafe/25x25/blob/pic", false)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // A wrong signature is unauthorized.
    let bogus = "A".repeat(43);
    let (status, _, _) = send(
        &app,
        get_request(&format!("/serve/{bogus}/25x25/blob/pic"), false),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // No signature segment at all is forbidden.
    let (status, _, _) = send(&app, get_request("/serve/25x25/blob/pic", false)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The matching signature is accepted.
    let signature = sign("25x25/blob/pic", SIGN_SECRET);
    let (status, _, _) = send(
        &app,
        get_request(&format!("/serve/{signature}/25x25/blob/pic"), false),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn sign_endpoint_mints_working_serve_urls() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.environment = Environment::Production;
    let (_state, app) = test_app(config);

    send(&app, put_request("pic", &png_of(60, 60))).await;

    let (status, _, body) = send(&app, get_request("/sign/serve/30x30/blob/pic", true)).await;
    assert_eq!(status, StatusCode::OK);
    let signed_url = String::from_utf8(body).unwrap();
    assert!(signed_url.starts_with("/serve/"));

    let (status, _, body) = send(&app, get_request(&signed_url, false)).await;
    assert_eq!(status, StatusCode::OK);
    let out = image::load_from_memory(&body).unwrap();
    assert_eq!(out.dimensions(), (30, 30));
}

#[tokio::test]
async fn serve_meta_reports_transformed_shape() {
    let dir = TempDir::new().unwrap();
    let (_state, app) = test_app(test_config(dir.path()));

    send(&app, put_request("pic", &png_of(200, 100))).await;

    let (status, _, body) = send(
        &app,
        get_request("/serve/meta/unsafe/fit-in/100x100/blob/pic", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let meta: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(meta["width"], serde_json::json!(100));
    assert_eq!(meta["height"], serde_json::json!(50));
    assert_eq!(meta["format"], serde_json::json!("png"));
}

#[tokio::test]
async fn transform_queue_overflow_returns_503() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.serve_concurrency = 1;
    config.serve_queue_size = 1;
    let (state, app) = test_app(config);

    send(&app, put_request("pic", &png_of(20, 20))).await;

    // Saturate both the worker slot and the waiting room.
    state
        .serve_tickets
        .clone()
        .try_acquire_many_owned(2)
        .unwrap()
        .forget();

    let (status, headers, _) =
        send(&app, get_request("/serve/unsafe/10x10/blob/pic", false)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(headers.contains_key("retry-after"));
}

#[tokio::test]
async fn serve_of_missing_blob_is_not_found() {
    let dir = TempDir::new().unwrap();
    let (_state, app) = test_app(test_config(dir.path()));

    let (status, _, _) = send(&app, get_request("/serve/unsafe/10x10/blob/nope", false)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // url/ sources are forbidden while the allow-list is empty.
    let (status, _, _) = send(
        &app,
        get_request("/serve/unsafe/10x10/url/example.com/x.png", false),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
