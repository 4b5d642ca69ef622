use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Result, StoreError};
use crate::record::Counter;
use crate::store::{KvStore, PutOutcome, check_successor};
use crate::wal::Wal;

struct LogState {
    /// `None` after a failed rewrite left no usable handle; reopened on next use
    wal: Option<Wal>,
    records: HashMap<String, Counter>,
}

impl LogState {
    async fn wal(&mut self, path: &Path) -> Result<&mut Wal> {
        if self.wal.is_none() {
            self.wal = Some(Wal::new(path.to_path_buf()).await?);
        }
        self.wal.as_mut().ok_or_else(|| StoreError::Unavailable("counter log is closed".into()))
    }

    fn log_size(&self) -> u64 {
        self.wal.as_ref().map_or(0, Wal::offset)
    }
}

/// Durable single-process store.
///
/// Each accepted write is appended to the log and fsynced before it is
/// acknowledged. The latest record per key is kept in memory; the log is
/// only read back on open.
pub struct LogStore {
    state: Mutex<LogState>,
    path: PathBuf,
    compaction_threshold: u64,
}

impl LogStore {
    /// Open (or create) the log `<dir>/<table>.log` and replay it
    pub async fn open(
        dir: impl AsRef<Path>,
        table: &str,
        compaction_threshold: u64,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{table}.log"));

        let recovered = Wal::recover(&path).await?;
        let replayed = recovered.records.len();
        let mut records: HashMap<String, Counter> = HashMap::new();
        for record in recovered.records {
            // Equal versions: the later entry is the one that was acknowledged
            let newer =
                records.get(&record.id).is_none_or(|existing| existing.version <= record.version);
            if newer {
                records.insert(record.id.clone(), record);
            }
        }

        let wal = Wal::new(path.clone()).await?;
        let torn = wal.offset().saturating_sub(recovered.valid_len);
        let store = Self {
            state: Mutex::new(LogState { wal: Some(wal), records }),
            path,
            compaction_threshold,
        };

        {
            let mut state = store.state.lock().await;
            info!(
                path = %store.path.display(),
                entries = replayed,
                keys = state.records.len(),
                "counter log recovered"
            );
            if torn > 0 {
                // New entries must not land behind bytes replay cannot get past
                warn!(path = %store.path.display(), bytes = torn, "dropping unreadable log tail");
            }
            if torn > 0 || replayed > state.records.len() {
                store.compact(&mut state).await?;
            }
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the log file in bytes
    pub async fn log_size(&self) -> u64 {
        self.state.lock().await.log_size()
    }

    /// Rewrite the log down to one entry per key
    async fn compact(&self, state: &mut LogState) -> Result<()> {
        let before = state.log_size();
        let mut live: Vec<Counter> = state.records.values().cloned().collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));

        match Wal::rewrite(&self.path, &live).await {
            Ok(wal) => {
                debug!(before, after = wal.offset(), "counter log compacted");
                state.wal = Some(wal);
                Ok(())
            }
            Err(err) => {
                // The rename may already have happened; only a fresh handle on the path is safe
                state.wal = Wal::new(self.path.clone()).await.ok();
                Err(err)
            }
        }
    }

    /// Append `record` durably, then publish it
    async fn commit(&self, state: &mut LogState, record: Counter) -> Result<()> {
        state.wal(&self.path).await?.append(&record).await?;
        state.records.insert(record.id.clone(), record);

        if state.log_size() > self.compaction_threshold {
            // The write is already durable; a failed rewrite only delays compaction
            if let Err(err) = self.compact(state).await {
                warn!(path = %self.path.display(), "counter log compaction failed: {err}");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for LogStore {
    async fn get(&self, key: &str) -> Result<Option<Counter>> {
        Ok(self.state.lock().await.records.get(key).cloned())
    }

    async fn put_if_version_matches(
        &self,
        key: &str,
        record: Counter,
        expected_version: u64,
    ) -> Result<PutOutcome> {
        check_successor(key, &record, expected_version)?;

        let mut state = self.state.lock().await;
        match state.records.get(key) {
            None => return Ok(PutOutcome::Absent),
            Some(stored) if stored.version != expected_version => {
                return Ok(PutOutcome::VersionMismatch);
            }
            Some(_) => {}
        }

        // Durable before visible
        self.commit(&mut state, record.clone()).await?;
        Ok(PutOutcome::Written(record))
    }

    async fn insert_if_absent(&self, record: Counter) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&record.id) {
            return Ok(false);
        }

        self.commit(&mut state, record).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::helpers::{MEBI, TABLE_NAME};
    use crate::wal::HEADER_SIZE;

    #[tokio::test]
    async fn test_reopen_keeps_latest_record() {
        let db_dir = tempdir().unwrap().keep();

        {
            let store = LogStore::open(&db_dir, TABLE_NAME, MEBI as u64).await.unwrap();
            assert!(store.insert_if_absent(Counter::new("global", 10, 1)).await.unwrap());
            let outcome = store
                .put_if_version_matches("global", Counter::new("global", 11, 2), 1)
                .await
                .unwrap();
            assert_eq!(outcome, PutOutcome::Written(Counter::new("global", 11, 2)));
        } // Drop simulates crash

        let store = LogStore::open(&db_dir, TABLE_NAME, MEBI as u64).await.unwrap();
        assert_eq!(store.get("global").await.unwrap(), Some(Counter::new("global", 11, 2)));

        let _ = tokio::fs::remove_dir_all(&db_dir).await;
    }

    #[tokio::test]
    async fn test_conflict_is_not_logged() {
        let db_dir = tempdir().unwrap().keep();

        let store = LogStore::open(&db_dir, TABLE_NAME, MEBI as u64).await.unwrap();
        store.insert_if_absent(Counter::new("global", 10, 3)).await.unwrap();
        let size = store.log_size().await;

        let outcome =
            store.put_if_version_matches("global", Counter::new("global", 11, 2), 1).await.unwrap();
        assert_eq!(outcome, PutOutcome::VersionMismatch);
        assert_eq!(store.log_size().await, size, "Rejected write must not reach the log");
        assert_eq!(store.get("global").await.unwrap(), Some(Counter::new("global", 10, 3)));

        let _ = tokio::fs::remove_dir_all(&db_dir).await;
    }

    #[tokio::test]
    async fn test_put_absent() {
        let db_dir = tempdir().unwrap().keep();

        let store = LogStore::open(&db_dir, TABLE_NAME, MEBI as u64).await.unwrap();
        let outcome =
            store.put_if_version_matches("global", Counter::new("global", 1, 1), 0).await.unwrap();
        assert_eq!(outcome, PutOutcome::Absent);
        assert_eq!(store.log_size().await, 0);

        let _ = tokio::fs::remove_dir_all(&db_dir).await;
    }

    #[tokio::test]
    async fn test_compaction_bounds_log() {
        let db_dir = tempdir().unwrap().keep();
        let entry = (HEADER_SIZE + "global".len()) as u64;

        let store = LogStore::open(&db_dir, TABLE_NAME, entry * 8).await.unwrap();
        store.insert_if_absent(Counter::new("global", 0, 0)).await.unwrap();
        for version in 0..100 {
            let next = Counter::new("global", version as i64 + 1, version + 1);
            store.put_if_version_matches("global", next, version).await.unwrap();
            assert!(store.log_size().await <= entry * 8);
        }
        drop(store);

        let store = LogStore::open(&db_dir, TABLE_NAME, entry * 8).await.unwrap();
        assert_eq!(store.get("global").await.unwrap(), Some(Counter::new("global", 100, 100)));
        assert_eq!(store.log_size().await, entry, "Reopen compacts to one entry per key");

        let _ = tokio::fs::remove_dir_all(&db_dir).await;
    }

    #[tokio::test]
    async fn test_writes_after_torn_tail_survive_restart() {
        let db_dir = tempdir().unwrap().keep();
        let log_path = db_dir.join(format!("{TABLE_NAME}.log"));

        {
            let store = LogStore::open(&db_dir, TABLE_NAME, MEBI as u64).await.unwrap();
            store.insert_if_absent(Counter::new("global", 10, 0)).await.unwrap();
            store.put_if_version_matches("global", Counter::new("global", 11, 1), 0).await.unwrap();
        }

        // Crash mid-write of the second entry
        let len = tokio::fs::metadata(&log_path).await.unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&log_path).unwrap();
        file.set_len(len - 10).unwrap();

        {
            let store = LogStore::open(&db_dir, TABLE_NAME, MEBI as u64).await.unwrap();
            assert_eq!(store.get("global").await.unwrap(), Some(Counter::new("global", 10, 0)));
            let size = tokio::fs::metadata(&log_path).await.unwrap().len();
            assert_eq!(store.log_size().await, size, "Unreadable tail must be cut off");

            for (value, version) in [(11, 1), (12, 2)] {
                let next = Counter::new("global", value, version);
                let outcome =
                    store.put_if_version_matches("global", next.clone(), version - 1).await.unwrap();
                assert_eq!(outcome, PutOutcome::Written(next));
            }
        }

        let store = LogStore::open(&db_dir, TABLE_NAME, MEBI as u64).await.unwrap();
        assert_eq!(
            store.get("global").await.unwrap(),
            Some(Counter::new("global", 12, 2)),
            "Acknowledged writes must survive restart"
        );

        let _ = tokio::fs::remove_dir_all(&db_dir).await;
    }

    #[tokio::test]
    async fn test_failed_compaction_keeps_write() {
        let db_dir = tempdir().unwrap().keep();
        let entry = (HEADER_SIZE + "global".len()) as u64;

        // A directory in the way of the side file makes every rewrite fail
        let side_path = db_dir.join(format!("{TABLE_NAME}.compact"));
        tokio::fs::create_dir_all(&side_path).await.unwrap();

        {
            let store = LogStore::open(&db_dir, TABLE_NAME, entry).await.unwrap();
            store.insert_if_absent(Counter::new("global", 0, 0)).await.unwrap();
            for version in 0..3 {
                let next = Counter::new("global", version as i64 + 1, version + 1);
                let outcome =
                    store.put_if_version_matches("global", next.clone(), version).await.unwrap();
                assert_eq!(outcome, PutOutcome::Written(next));
            }
            assert_eq!(store.log_size().await, entry * 4, "Log keeps growing while rewrite fails");
            assert_eq!(store.get("global").await.unwrap(), Some(Counter::new("global", 3, 3)));
        }

        tokio::fs::remove_dir_all(&side_path).await.unwrap();

        let store = LogStore::open(&db_dir, TABLE_NAME, entry).await.unwrap();
        assert_eq!(store.get("global").await.unwrap(), Some(Counter::new("global", 3, 3)));
        assert_eq!(store.log_size().await, entry);

        let _ = tokio::fs::remove_dir_all(&db_dir).await;
    }

    #[tokio::test]
    async fn test_replay_prefers_later_entry_of_same_version() {
        let db_dir = tempdir().unwrap().keep();

        {
            // An unacknowledged append followed by the acknowledged retry of the same version
            let mut wal = Wal::new(db_dir.join(format!("{TABLE_NAME}.log"))).await.unwrap();
            wal.append_batch(&[
                Counter::new("global", 0, 0),
                Counter::new("global", 5, 1),
                Counter::new("global", 9, 1),
            ])
            .await
            .unwrap();
        }

        let store = LogStore::open(&db_dir, TABLE_NAME, MEBI as u64).await.unwrap();
        assert_eq!(store.get("global").await.unwrap(), Some(Counter::new("global", 9, 1)));

        let _ = tokio::fs::remove_dir_all(&db_dir).await;
    }

    #[tokio::test]
    async fn test_tables_are_separate_files() {
        let db_dir = tempdir().unwrap().keep();

        let a = LogStore::open(&db_dir, "a", MEBI as u64).await.unwrap();
        let b = LogStore::open(&db_dir, "b", MEBI as u64).await.unwrap();
        a.insert_if_absent(Counter::new("global", 1, 0)).await.unwrap();

        assert_eq!(b.get("global").await.unwrap(), None);
        assert_ne!(a.path(), b.path());

        let _ = tokio::fs::remove_dir_all(&db_dir).await;
    }
}
