// store.rs
//
// Durable key -> bytes store. Blob bodies live under a two-level MD5
// fanout on the local filesystem; the per-key record (tombstone + content
// hash) lives in the ordered index. Writers take a per-key lock and fail
// fast with Conflict; readers never lock.

use std::io::SeekFrom;
use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use dashmap::DashSet;
use futures_util::{Stream, StreamExt};
use md5::Context as Md5Context;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::config::MAX_QUERY_LIMIT;

use super::handler_utils::AppError;
use super::index::RecordIndex;
use super::record::{key_to_path, Record};

const SNIFF_LEN: usize = 512;

pub struct BlobStore {
    index: RecordIndex,
    locked_keys: DashSet<String>,
    upload_root: PathBuf,
    max_size: u64,
    soft_delete: bool,
    allowed_mime_types: Vec<String>,
}

/// Open blob handle for GET/HEAD.
pub struct BlobGet {
    pub file: fs::File,
    pub size: u64,
    pub hash: String,
    pub content_type: &'static str,
}

/// Releases the per-key write lock on every exit path.
pub struct KeyLockGuard<'a> {
    set: &'a DashSet<String>,
    key: String,
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

// Temp file cleanup for failed or cancelled writes.
struct TempGuard {
    path: PathBuf,
    committed: bool,
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// Rolls back the reservation record written for a previously-absent key.
// Index writes are async, so the rollback is spawned off the drop.
struct ReservationGuard {
    index: Option<RecordIndex>,
    key: String,
    committed: bool,
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(index) = self.index.take() {
            let key = std::mem::take(&mut self.key);
            tokio::spawn(async move {
                if let Err(err) = index.delete(&key).await {
                    tracing::error!(key = %key, error = %err, "failed to roll back key reservation");
                }
            });
        }
    }
}

impl BlobStore {
    pub fn open(
        index: RecordIndex,
        upload_root: PathBuf,
        max_size: u64,
        soft_delete: bool,
        allowed_mime_types: Vec<String>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&upload_root)
            .with_context(|| format!("create upload root {}", upload_root.display()))?;
        Ok(Self {
            index,
            locked_keys: DashSet::new(),
            upload_root,
            max_size,
            soft_delete,
            allowed_mime_types,
        })
    }

    pub fn blob_path(&self, key: &str) -> PathBuf {
        self.upload_root.join(key_to_path(key))
    }

    /// Try to take the write lock for `key`. No queuing: a held lock is
    /// an immediate Conflict.
    pub fn lock_key(&self, key: &str) -> Result<KeyLockGuard<'_>, AppError> {
        if !self.locked_keys.insert(key.to_string()) {
            return Err(AppError::Conflict);
        }
        Ok(KeyLockGuard {
            set: &self.locked_keys,
            key: key.to_string(),
        })
    }

    pub async fn put(
        &self,
        key: &str,
        mut body: impl Stream<Item = anyhow::Result<Bytes>> + Unpin,
        declared_len: u64,
    ) -> Result<String, AppError> {
        if key.is_empty() {
            return Err(AppError::BadRequest("empty key".to_string()));
        }
        if declared_len == 0 {
            return Err(AppError::LengthRequired);
        }
        if declared_len > self.max_size {
            return Err(AppError::PayloadTooLarge);
        }

        let _lock = self.lock_key(key)?;
        tracing::info!(key = %key, declared_len, "PUT begin");

        // Reserve an absent key so the record exists while the first write
        // is in flight. Rolled back unless the write commits.
        let prior = self.index.get(key).await?;
        let mut reservation = ReservationGuard {
            index: prior.is_none().then(|| self.index.clone()),
            key: key.to_string(),
            committed: prior.is_some(),
        };
        if prior.is_none() {
            self.index.put(key, &Record::tombstoned("")).await?;
        }

        let final_path = self.blob_path(key);
        let parent = final_path
            .parent()
            .expect("fanout path always has a parent")
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .context("create shard directory")?;

        let tmp_path = parent.join(format!("tmp-{}", Uuid::new_v4()));
        let mut tmp = TempGuard {
            path: tmp_path.clone(),
            committed: false,
        };

        let file = fs::File::create(&tmp_path).await.context("create temp file")?;
        let mut writer = BufWriter::with_capacity(256 * 1024, file);

        let mut hasher = Md5Context::new();
        let mut written = 0u64;
        let mut sniff_buf: Vec<u8> = Vec::with_capacity(SNIFF_LEN);
        let mut sniffed = false;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("read body chunk")?;
            written += chunk.len() as u64;
            if written > self.max_size {
                return Err(AppError::PayloadTooLarge);
            }
            hasher.consume(&chunk);
            if !sniffed {
                let take = (SNIFF_LEN - sniff_buf.len()).min(chunk.len());
                sniff_buf.extend_from_slice(&chunk[..take]);
                if sniff_buf.len() >= SNIFF_LEN {
                    self.check_mime(&sniff_buf)?;
                    sniffed = true;
                }
            }
            writer
                .write_all(&chunk)
                .await
                .context("write body chunk")?;
        }

        if written == 0 {
            return Err(AppError::BadRequest("empty body".to_string()));
        }
        if !sniffed {
            self.check_mime(&sniff_buf)?;
        }

        writer.flush().await.context("flush temp file")?;
        writer
            .get_mut()
            .sync_all()
            .await
            .context("sync temp file")?;

        let hash = hex::encode(hasher.compute().0);

        fs::rename(&tmp_path, &final_path)
            .await
            .context("rename temp file into place")?;
        tmp.committed = true;

        self.index.put(key, &Record::live(&hash)).await?;
        reservation.committed = true;

        tracing::info!(key = %key, bytes = written, hash = %hash, "PUT commit");
        Ok(hash)
    }

    pub async fn get(&self, key: &str) -> Result<BlobGet, AppError> {
        let rec = self.index.get(key).await?.ok_or(AppError::NotFound)?;
        if !rec.is_live() {
            return Err(AppError::NotFound);
        }

        let path = self.blob_path(key);
        let mut file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound
            } else {
                AppError::Internal(e.into())
            }
        })?;
        let size = file.metadata().await.context("blob metadata")?.len();

        // Sniff the content type from the head of the file, then rewind.
        let mut prefix = [0u8; SNIFF_LEN];
        let mut n = 0;
        while n < SNIFF_LEN {
            let read = file.read(&mut prefix[n..]).await.context("sniff read")?;
            if read == 0 {
                break;
            }
            n += read;
        }
        file.seek(SeekFrom::Start(0)).await.context("rewind blob")?;

        Ok(BlobGet {
            file,
            size,
            hash: rec.hash().to_string(),
            content_type: sniff_mime(&prefix[..n]),
        })
    }

    /// Whole-body read for the transformation pipeline.
    pub async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, AppError> {
        let rec = self.index.get(key).await?.ok_or(AppError::NotFound)?;
        if !rec.is_live() {
            return Err(AppError::NotFound);
        }
        fs::read(self.blob_path(key)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound
            } else {
                AppError::Internal(e.into())
            }
        })
    }

    pub async fn delete(&self, key: &str, unlink: bool) -> Result<(), AppError> {
        let _lock = self.lock_key(key)?;

        let rec = self.index.get(key).await?.ok_or(AppError::NotFound)?;
        if unlink && rec.is_tombstoned() {
            return Err(AppError::NotFound);
        }
        if !unlink && self.soft_delete && rec.is_live() {
            return Err(AppError::Forbidden);
        }

        // Tombstone before touching the filesystem so a crash in between
        // never leaves a live record pointing at a missing file.
        self.index
            .put(key, &Record::tombstoned(rec.hash()))
            .await?;

        match fs::remove_file(self.blob_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if !unlink {
            self.index.delete(key).await?;
        }

        tracing::info!(key = %key, unlink, "DELETE");
        Ok(())
    }

    /// Keys in ascending order. `unlinked` selects soft-deleted records
    /// instead of live ones. Returns (keys, has_more, next_cursor).
    pub async fn list(
        &self,
        prefix: &str,
        starting_at: Option<String>,
        limit: usize,
        unlinked: bool,
    ) -> Result<(Vec<String>, bool, Option<String>), AppError> {
        let limit = limit.min(MAX_QUERY_LIMIT);
        let scan_max = if limit > 0 { limit + 1 } else { MAX_QUERY_LIMIT + 1 };

        let want = move |rec: &Record| {
            if unlinked {
                rec.is_tombstoned()
            } else {
                rec.is_live()
            }
        };
        let mut rows = self
            .index
            .scan_prefix(prefix.to_string(), starting_at, want, scan_max)
            .await?;

        if limit == 0 && rows.len() > MAX_QUERY_LIMIT {
            return Err(AppError::PayloadTooLarge);
        }

        let mut has_more = false;
        let mut next = None;
        if limit > 0 && rows.len() > limit {
            has_more = true;
            next = Some(rows[limit].0.clone());
            rows.truncate(limit);
        }

        Ok((rows.into_iter().map(|(k, _)| k).collect(), has_more, next))
    }

    fn check_mime(&self, prefix: &[u8]) -> Result<(), AppError> {
        let mime = sniff_mime(prefix);
        if self
            .allowed_mime_types
            .iter()
            .any(|allowed| mime.starts_with(allowed.as_str()))
        {
            Ok(())
        } else {
            Err(AppError::UnsupportedMediaType)
        }
    }
}

/// Best-effort content sniff over the first bytes of a body. Image
/// formats are recognized by magic number; everything else falls back to
/// text/plain for valid UTF-8 and application/octet-stream otherwise.
pub fn sniff_mime(prefix: &[u8]) -> &'static str {
    if prefix.is_empty() {
        return "application/octet-stream";
    }
    if let Ok(format) = image::guess_format(prefix) {
        return format.to_mime_type();
    }
    match std::str::from_utf8(prefix) {
        Ok(_) => "text/plain",
        // Truncated multi-byte sequence at the sniff boundary still
        // counts as text.
        Err(e) if e.error_len().is_none() => "text/plain",
        Err(_) => "application/octet-stream",
    }
}
