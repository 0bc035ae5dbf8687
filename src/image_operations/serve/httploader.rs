// httploader.rs
//
// Loads `url/` sources from remote origins. Hosts are restricted by a
// comma-separated glob allow-list; responses must look like images and
// stay under the upload size cap.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use reqwest::redirect;

use crate::image_operations::handler_utils::AppError;

const MAX_REDIRECTS: usize = 10;

pub struct HttpLoader {
    client: reqwest::Client,
    allowed_sources: Vec<String>,
    max_size: u64,
    block_loopback: bool,
    block_private: bool,
    block_link_local: bool,
}

impl HttpLoader {
    pub fn new(
        allowed_sources_csv: &str,
        max_size: u64,
        timeout: Duration,
    ) -> anyhow::Result<Option<Self>> {
        let allowed_sources: Vec<String> = allowed_sources_csv
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if allowed_sources.is_empty() {
            return Ok(None);
        }

        // Redirects must stay inside the allow-list too.
        let redirect_allowed = allowed_sources.clone();
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            let host = attempt.url().host_str().unwrap_or("");
            if host_allowed(&redirect_allowed, host) {
                attempt.follow()
            } else {
                attempt.stop()
            }
        });

        let client = reqwest::Client::builder()
            .redirect(policy)
            .timeout(timeout)
            .user_agent(concat!("mojo-images/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http loader client")?;

        Ok(Some(Self {
            client,
            allowed_sources,
            max_size,
            block_loopback: false,
            block_private: false,
            block_link_local: false,
        }))
    }

    #[allow(dead_code)]
    pub fn block_networks(mut self, loopback: bool, private: bool, link_local: bool) -> Self {
        self.block_loopback = loopback;
        self.block_private = private;
        self.block_link_local = link_local;
        self
    }

    /// Fetch an allow-listed URL. Returns the body and the response
    /// content type.
    pub async fn load(&self, raw: &str) -> Result<(Vec<u8>, Option<String>), AppError> {
        // Default scheme is https for bare host/path sources.
        let candidate = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{raw}")
        };
        let url: reqwest::Url = candidate
            .parse()
            .map_err(|_| AppError::BadRequest("invalid source url".to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::Forbidden);
        }
        let host = url.host_str().unwrap_or("");
        if host.is_empty() || (!host.contains('.') && host != "localhost") {
            return Err(AppError::Forbidden);
        }
        if !host_allowed(&self.allowed_sources, host) {
            return Err(AppError::Forbidden);
        }
        self.check_networks(&url).await?;

        // Cheap size rejection before downloading the body.
        if self.max_size > 0 {
            let resp = self
                .client
                .head(url.clone())
                .header("Accept", "image/*")
                .send()
                .await
                .map_err(|_| AppError::NotFound)?;
            if resp.status().is_success() {
                if let Some(len) = resp.content_length() {
                    if len > self.max_size {
                        return Err(AppError::PayloadTooLarge);
                    }
                }
            }
        }

        let resp = self
            .client
            .get(url)
            .header("Accept", "image/*")
            .send()
            .await
            .map_err(|_| AppError::NotFound)?;

        if !resp.status().is_success() {
            return Err(AppError::NotFound);
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase());
        if let Some(ct) = &content_type {
            if !ct.starts_with("image/") {
                return Err(AppError::UnsupportedMediaType);
            }
        }

        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AppError::Internal(e.into()))?;
            if self.max_size > 0 && (body.len() + chunk.len()) as u64 > self.max_size {
                return Err(AppError::PayloadTooLarge);
            }
            body.extend_from_slice(&chunk);
        }

        Ok((body, content_type))
    }

    async fn check_networks(&self, url: &reqwest::Url) -> Result<(), AppError> {
        if !(self.block_loopback || self.block_private || self.block_link_local) {
            return Ok(());
        }
        let host = url.host_str().unwrap_or("");
        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| AppError::NotFound)?;
        for addr in addrs {
            let blocked = match addr.ip() {
                IpAddr::V4(ip) => {
                    (self.block_loopback && ip.is_loopback())
                        || (self.block_private && ip.is_private())
                        || (self.block_link_local && ip.is_link_local())
                }
                IpAddr::V6(ip) => self.block_loopback && ip.is_loopback(),
            };
            if blocked {
                return Err(AppError::Forbidden);
            }
        }
        Ok(())
    }
}

fn host_allowed(patterns: &[String], host: &str) -> bool {
    patterns.iter().any(|p| glob_match(p, host))
}

/// `*` matches any run of characters: `*.example.com`, `cdn-*.img.net`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*'.
    true
}
