// cache.rs
//
// On-disk cache of transformed outputs. Entries are addressed by the
// SHA-256 of the normalized operation path; the filesystem hierarchy is
// the index. A `.meta` sidecar carries the content type. Expiry is
// checked lazily against the body file's mtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

pub struct ResultCache {
    root: PathBuf,
    ttl: Duration,
}

#[derive(Serialize, Deserialize)]
struct EntryMeta {
    content_type: String,
}

impl ResultCache {
    pub fn open(root: PathBuf, ttl: Duration) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create result cache root {}", root.display()))?;
        Ok(Self { root, ttl })
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(&digest[4..])
    }

    pub async fn get(&self, key: &str) -> Option<(Vec<u8>, String)> {
        if !self.enabled() {
            return None;
        }
        let path = self.entry_path(key);

        let modified = fs::metadata(&path).await.ok()?.modified().ok()?;
        let age = modified.elapsed().unwrap_or_default();
        if age > self.ttl {
            // Expired: drop the entry and report a miss.
            let _ = fs::remove_file(&path).await;
            let _ = fs::remove_file(meta_path(&path)).await;
            return None;
        }

        let body = fs::read(&path).await.ok()?;
        let meta: EntryMeta =
            serde_json::from_slice(&fs::read(meta_path(&path)).await.ok()?).ok()?;
        Some((body, meta.content_type))
    }

    pub async fn put(&self, key: &str, body: &[u8], content_type: &str) -> anyhow::Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let path = self.entry_path(key);
        let parent = path.parent().expect("cache entries are sharded");
        fs::create_dir_all(parent).await.context("create cache shard")?;

        let meta = serde_json::to_vec(&EntryMeta {
            content_type: content_type.to_string(),
        })?;
        write_atomic(&meta_path(&path), &meta).await?;
        write_atomic(&path, body).await?;
        Ok(())
    }
}

fn meta_path(path: &Path) -> PathBuf {
    let mut meta = path.as_os_str().to_os_string();
    meta.push(".meta");
    PathBuf::from(meta)
}

// Same temp-then-rename discipline as the blob store.
async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().expect("cache path has a parent");
    let tmp = parent.join(format!("tmp-{}", Uuid::new_v4()));
    fs::write(&tmp, data).await.context("write cache temp")?;
    match fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp).await;
            Err(err).context("rename cache temp")
        }
    }
}
