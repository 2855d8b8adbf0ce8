use std::path::{Path, PathBuf};

use amplab_protocol::{AmpError, AmpResult, StateRecord, StateStorePort};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, instrument, warn};

fn persistence(context: impl std::fmt::Display, error: impl std::fmt::Display) -> AmpError {
    AmpError::Persistence(format!("{context}: {error}"))
}

/// State table persisted as one JSONL file, `{root}/state/{table}.jsonl`.
///
/// Writes are blind appends serialized by a per-store lock; readers skip rows
/// whose TTL has passed and [`StateStorePort::purge_expired`] compacts them
/// away. Lines that do not parse are skipped with a warning and dropped
/// whenever a purge rewrites the table.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>, table: &str) -> Self {
        let path = root.into().join("state").join(format!("{table}.jsonl"));
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(path: &Path) -> AmpResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|error| persistence(format!("failed to create state dir {parent:?}"), error))?;
        }
        Ok(())
    }

    async fn read_all(path: &Path) -> AmpResult<Vec<StateRecord>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .await
            .map_err(|error| persistence(format!("failed opening state table {path:?}"), error))?;
        let mut reader = BufReader::new(file).lines();
        let mut records = Vec::new();

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|error| persistence(format!("failed reading state table {path:?}"), error))?
        {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StateRecord>(&line) {
                Ok(record) => records.push(record),
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping unreadable state line");
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl StateStorePort for FileStateStore {
    #[instrument(
        skip(self, record),
        fields(pk = %record.pk, outcome = record.outcome.as_str(), receive_count = record.approx_receive_count)
    )]
    async fn put(&self, record: StateRecord) -> AmpResult<()> {
        Self::ensure_parent(&self.path).await?;
        let line = serde_json::to_string(&record)?;

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|error| persistence(format!("failed opening state table {:?}", self.path), error))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|error| persistence("failed writing state record", error))?;
        file.write_all(b"\n")
            .await
            .map_err(|error| persistence("failed writing state record", error))?;
        file.flush()
            .await
            .map_err(|error| persistence("failed flushing state table", error))?;
        debug!("state record written");
        Ok(())
    }

    async fn records_for(&self, pk: &str, now: i64) -> AmpResult<Vec<StateRecord>> {
        Ok(Self::read_all(&self.path)
            .await?
            .into_iter()
            .filter(|record| record.pk == pk && !record.is_expired(now))
            .collect())
    }

    async fn scan(&self, now: i64) -> AmpResult<Vec<StateRecord>> {
        let records: Vec<_> = Self::read_all(&self.path)
            .await?
            .into_iter()
            .filter(|record| !record.is_expired(now))
            .collect();
        debug!(count = records.len(), "state records scanned");
        Ok(records)
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn purge_expired(&self, now: i64) -> AmpResult<usize> {
        let _guard = self.write_lock.lock().await;
        let records = Self::read_all(&self.path).await?;
        let before = records.len();
        let live: Vec<_> = records
            .into_iter()
            .filter(|record| !record.is_expired(now))
            .collect();
        let removed = before - live.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut contents = String::new();
        for record in &live {
            contents.push_str(&serde_json::to_string(record)?);
            contents.push('\n');
        }
        let staging = self.path.with_extension("jsonl.tmp");
        fs::write(&staging, contents)
            .await
            .map_err(|error| persistence(format!("failed writing {staging:?}"), error))?;
        fs::rename(&staging, &self.path)
            .await
            .map_err(|error| persistence(format!("failed replacing {:?}", self.path), error))?;
        info!(removed, remaining = live.len(), "expired state records purged");
        Ok(removed)
    }
}

/// Append-only state table held in memory.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: Mutex<Vec<StateRecord>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row ever written, expired or not.
    pub fn all(&self) -> Vec<StateRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl StateStorePort for InMemoryStateStore {
    async fn put(&self, record: StateRecord) -> AmpResult<()> {
        debug!(pk = %record.pk, outcome = record.outcome.as_str(), "state record written");
        self.records.lock().push(record);
        Ok(())
    }

    async fn records_for(&self, pk: &str, now: i64) -> AmpResult<Vec<StateRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|record| record.pk == pk && !record.is_expired(now))
            .cloned()
            .collect())
    }

    async fn scan(&self, now: i64) -> AmpResult<Vec<StateRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|record| !record.is_expired(now))
            .cloned()
            .collect())
    }

    async fn purge_expired(&self, now: i64) -> AmpResult<usize> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|record| !record.is_expired(now));
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use amplab_protocol::{Event, Outcome, STATE_TTL_SECS, StateRecord, StateStorePort};
    use anyhow::Result;
    use serde_json::json;
    use tokio::fs;

    use crate::{FileStateStore, InMemoryStateStore};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn record(event_id: &str, receive_count: u32, outcome: Outcome, now: i64) -> StateRecord {
        let event = Event::normalize_at(
            &json!({"eventId": event_id, "correlationId": "run-1"}),
            now,
        )
        .expect("valid event");
        StateRecord::new(&event, receive_count, outcome, now)
    }

    #[tokio::test]
    async fn file_store_keeps_every_delivery_attempt() -> Result<()> {
        let root = unique_test_root("amplab-store-attempts");
        let store = FileStateStore::new(&root, "state");

        store.put(record("e-1", 1, Outcome::FailPoison, 1_000)).await?;
        store.put(record("e-1", 2, Outcome::FailPoison, 1_010)).await?;
        store.put(record("e-2", 1, Outcome::Success, 1_020)).await?;

        let attempts = store.records_for("ev#run-1#e-1", 1_030).await?;
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].approx_receive_count, 1);
        assert_eq!(attempts[1].approx_receive_count, 2);
        assert_eq!(store.scan(1_030).await?.len(), 3);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_store_hides_and_purges_expired_rows() -> Result<()> {
        let root = unique_test_root("amplab-store-ttl");
        let store = FileStateStore::new(&root, "state");

        store.put(record("old", 1, Outcome::Success, 0)).await?;
        store.put(record("new", 1, Outcome::Success, 5_000)).await?;

        let now = STATE_TTL_SECS + 1;
        let visible = store.scan(now).await?;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].event_id.as_str(), "new");

        assert_eq!(store.purge_expired(now).await?, 1);
        assert_eq!(store.purge_expired(now).await?, 0);
        let raw = fs::read_to_string(store.path()).await?;
        assert_eq!(raw.lines().count(), 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_store_skips_unreadable_lines() -> Result<()> {
        let root = unique_test_root("amplab-store-corrupt");
        let store = FileStateStore::new(&root, "state");

        store.put(record("e-1", 1, Outcome::Success, 1_000)).await?;
        let mut raw = fs::read_to_string(store.path()).await?;
        raw.push_str("{truncated\n");
        fs::write(store.path(), raw).await?;
        store.put(record("e-2", 1, Outcome::Success, 1_000)).await?;

        let records = store.scan(1_010).await?;
        assert_eq!(records.len(), 2);
        assert_eq!(store.records_for("ev#run-1#e-2", 1_010).await?.len(), 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_store_reads_empty_when_table_missing() -> Result<()> {
        let root = unique_test_root("amplab-store-missing");
        let store = FileStateStore::new(&root, "state");
        assert!(store.scan(0).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_store_applies_ttl() -> Result<()> {
        let store = InMemoryStateStore::new();
        store.put(record("a", 1, Outcome::Success, 0)).await?;
        store.put(record("b", 1, Outcome::Success, 100)).await?;

        let now = STATE_TTL_SECS + 50;
        assert_eq!(store.scan(now).await?.len(), 1);
        assert!(store.records_for("ev#run-1#a", now).await?.is_empty());
        assert_eq!(store.purge_expired(now).await?, 1);
        assert_eq!(store.all().len(), 1);
        Ok(())
    }
}
