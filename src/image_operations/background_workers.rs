// background_workers.rs

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tokio::{fs, task::JoinHandle, time::interval};
use tracing::{error, info};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Periodically removes expired result cache entries. Expiry is also
/// checked lazily on every cache read; the sweep reclaims disk for
/// entries nothing asks for anymore.
pub fn spawn_cache_sweep_worker(root: PathBuf, ttl: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if ttl.is_zero() {
            return;
        }
        let mut ticker = interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match sweep_expired(&root, ttl).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "swept expired result cache entries"),
                Err(e) => error!(error = %e, "result cache sweep failed"),
            }
        }
    })
}

// Walks the two shard levels under the cache root.
async fn sweep_expired(root: &Path, ttl: Duration) -> Result<u64> {
    let mut removed = 0u64;
    let mut level1 = fs::read_dir(root).await?;
    while let Some(shard1) = level1.next_entry().await? {
        if !shard1.file_type().await?.is_dir() {
            continue;
        }
        let mut level2 = fs::read_dir(shard1.path()).await?;
        while let Some(shard2) = level2.next_entry().await? {
            if !shard2.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(shard2.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if !meta.is_file() {
                    continue;
                }
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.elapsed().ok())
                    .unwrap_or_default();
                if age > ttl {
                    if let Err(e) = fs::remove_file(entry.path()).await {
                        error!(path = ?entry.path(), error = %e, "failed to remove expired cache entry");
                    } else {
                        removed += 1;
                    }
                }
            }
        }
    }
    Ok(removed)
}
