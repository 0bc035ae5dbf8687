// index.rs
//
// Ordered key -> record index backed by redb. redb gives us durable
// commits, single-writer/multi-reader transactions, and an exclusive
// process-level file lock on the database, so only one server instance
// can open a given data directory. Transactions are blocking, so every
// call goes through spawn_blocking.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, TableDefinition};

use super::record::Record;

const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

#[derive(Clone)]
pub struct RecordIndex {
    db: Arc<Database>,
}

impl RecordIndex {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create index directory {}", dir.display()))?;
        let db = Database::create(dir.join("records.redb")).context("open record index")?;

        // Make sure the table exists so reads never race table creation.
        let wtx = db.begin_write()?;
        wtx.open_table(RECORDS)?;
        wtx.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Record>> {
        let db = self.db.clone();
        let key = key.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || {
            let rtx = db.begin_read()?;
            let table = rtx.open_table(RECORDS)?;
            let rec = table.get(key.as_slice())?.map(|v| Record::decode(v.value()));
            Ok(rec)
        })
        .await
        .context("index get task")?
    }

    pub async fn put(&self, key: &str, record: &Record) -> Result<()> {
        let db = self.db.clone();
        let key = key.as_bytes().to_vec();
        let value = record.encode();
        tokio::task::spawn_blocking(move || {
            let wtx = db.begin_write()?;
            {
                let mut table = wtx.open_table(RECORDS)?;
                table.insert(key.as_slice(), value.as_slice())?;
            }
            wtx.commit()?;
            Ok(())
        })
        .await
        .context("index put task")?
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let db = self.db.clone();
        let key = key.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || {
            let wtx = db.begin_write()?;
            {
                let mut table = wtx.open_table(RECORDS)?;
                table.remove(key.as_slice())?;
            }
            wtx.commit()?;
            Ok(())
        })
        .await
        .context("index delete task")?
    }

    /// Ascending scan over keys carrying `prefix`, starting at
    /// `max(prefix, start)` inclusive. Records failing `want` are
    /// skipped; iteration stops once `max` matches are collected or the
    /// prefix range is exhausted.
    pub async fn scan_prefix<F>(
        &self,
        prefix: String,
        start: Option<String>,
        want: F,
        max: usize,
    ) -> Result<Vec<(String, Record)>>
    where
        F: Fn(&Record) -> bool + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let prefix = prefix.into_bytes();
            let mut lower = prefix.clone();
            if let Some(start) = start {
                let start = start.into_bytes();
                if start > lower {
                    lower = start;
                }
            }

            let rtx = db.begin_read()?;
            let table = rtx.open_table(RECORDS)?;
            let mut out = Vec::new();
            for entry in table.range::<&[u8]>(lower.as_slice()..)? {
                if out.len() >= max {
                    break;
                }
                let (key, value) = entry?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                let rec = Record::decode(value.value());
                if !want(&rec) {
                    continue;
                }
                out.push((String::from_utf8_lossy(key.value()).into_owned(), rec));
            }
            Ok(out)
        })
        .await
        .context("index scan task")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn point_ops_round_trip() {
        let dir = TempDir::new().unwrap();
        let index = RecordIndex::open(dir.path()).unwrap();

        assert!(index.get("a").await.unwrap().is_none());

        let rec = Record::live("fc3ff98e8c6a0d3087d515c0473f8677");
        index.put("a", &rec).await.unwrap();
        assert_eq!(index.get("a").await.unwrap(), Some(rec));

        index.delete("a").await.unwrap();
        assert!(index.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prefix_scan_is_ordered_and_bounded() {
        let dir = TempDir::new().unwrap();
        let index = RecordIndex::open(dir.path()).unwrap();

        for key in ["a/1", "a/2", "a/3", "b/1"] {
            index.put(key, &Record::live("")).await.unwrap();
        }
        index.put("a/2", &Record::tombstoned("")).await.unwrap();

        let live = index
            .scan_prefix("a/".to_string(), None, |r| r.is_live(), 100)
            .await
            .unwrap();
        let keys: Vec<_> = live.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["a/1", "a/3"]);

        let tombstoned = index
            .scan_prefix("a/".to_string(), None, |r| r.is_tombstoned(), 100)
            .await
            .unwrap();
        assert_eq!(tombstoned.len(), 1);
        assert_eq!(tombstoned[0].0, "a/2");

        // Start bound is inclusive and the max is respected.
        let bounded = index
            .scan_prefix("a/".to_string(), Some("a/2".to_string()), |_| true, 1)
            .await
            .unwrap();
        assert_eq!(bounded[0].0, "a/2");
        assert_eq!(bounded.len(), 1);
    }
}
