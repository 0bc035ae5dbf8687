// config.rs
//
// Environment-driven configuration. Loaded once at startup into an
// immutable value that gets passed to the component constructors.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

pub const MAX_QUERY_LIMIT: usize = 1000;
pub const SERVE_QUEUE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub cert_file: Option<String>,
    pub cert_key_file: Option<String>,

    pub max_upload_size: u64,
    pub upload_path: PathBuf,
    pub leveldb_path: PathBuf,
    pub result_cache_path: PathBuf,

    pub secret_key: String,
    pub signature_secret_key: String,
    pub soft_delete: bool,
    pub allowed_mime_types: Vec<String>,

    pub serve_allowed_http_sources: String,
    pub serve_auto_webp: bool,
    pub serve_auto_avif: bool,
    pub serve_concurrency: usize,
    pub serve_queue_size: usize,
    pub serve_result_cache_ttl: Duration,
    pub serve_cache_control_ttl: Duration,
    pub serve_cache_control_swr: Duration,
    pub request_timeout: Duration,

    pub cors_allowed_origins: String,
    pub log_level: String,
    pub environment: Environment,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let secret_key = var_str("SECRET_KEY", "");
        if secret_key.is_empty() {
            bail!("SECRET_KEY must be set");
        }
        // The signature secret falls back to the API secret when unset.
        let signature_secret_key = {
            let v = var_str("SIGNATURE_SECRET_KEY", "");
            if v.is_empty() {
                secret_key.clone()
            } else {
                v
            }
        };

        let environment = match var_str("ENVIRONMENT", "development").as_str() {
            "production" => Environment::Production,
            _ => Environment::Development,
        };

        Ok(Self {
            host: var_str("HOST", "0.0.0.0"),
            port: var_parse("PORT", 3000),
            cert_file: std::env::var("CERT_FILE").ok().filter(|v| !v.is_empty()),
            cert_key_file: std::env::var("CERT_KEY_FILE").ok().filter(|v| !v.is_empty()),

            max_upload_size: var_parse("MAX_UPLOAD_SIZE", 20 * 1024 * 1024),
            upload_path: PathBuf::from(var_str("UPLOAD_PATH", "./data/uploads")),
            leveldb_path: PathBuf::from(var_str("LEVELDB_PATH", "./data/index")),
            result_cache_path: PathBuf::from(var_str("RESULT_CACHE_PATH", "./data/result-cache")),

            secret_key,
            signature_secret_key,
            soft_delete: var_bool("SOFT_DELETE", false),
            allowed_mime_types: split_csv(&var_str(
                "UPLOAD_ALLOWED_MIME_TYPES",
                "image/,text/,application/octet-stream",
            )),

            serve_allowed_http_sources: var_str("SERVE_ALLOWED_HTTP_SOURCES", ""),
            serve_auto_webp: var_bool("SERVE_AUTO_WEBP", true),
            serve_auto_avif: var_bool("SERVE_AUTO_AVIF", false),
            serve_concurrency: var_parse("SERVE_CONCURRENCY", 20),
            serve_queue_size: SERVE_QUEUE_SIZE,
            serve_result_cache_ttl: Duration::from_secs(var_parse(
                "SERVE_RESULT_CACHE_TTL",
                24 * 60 * 60,
            )),
            serve_cache_control_ttl: Duration::from_secs(var_parse(
                "SERVE_CACHE_CONTROL_TTL",
                7 * 24 * 60 * 60,
            )),
            serve_cache_control_swr: Duration::from_secs(var_parse(
                "SERVE_CACHE_CONTROL_SWR",
                24 * 60 * 60,
            )),
            request_timeout: Duration::from_secs(var_parse("REQUEST_TIMEOUT", 30)),

            cors_allowed_origins: var_str("CORS_ALLOWED_ORIGINS", "*"),
            log_level: var_str("LOG_LEVEL", "info"),
            environment,
        })
    }

    /// Unsigned `/serve` URLs (the literal `unsafe` segment) are honored
    /// only in development.
    pub fn unsafe_enabled(&self) -> bool {
        self.environment == Environment::Development
    }
}

fn var_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn var_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name).as_deref() {
        Ok("true") | Ok("1") | Ok("yes") => true,
        Ok("false") | Ok("0") | Ok("no") => false,
        _ => default,
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
