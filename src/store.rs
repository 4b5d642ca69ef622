use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::{Result, StoreError};
use crate::record::Counter;

/// Outcome of a conditional write that reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored version matched; the new record is now persisted.
    Written(Counter),
    /// Another writer got there first.
    VersionMismatch,
    /// No record under the key.
    Absent,
}

/// Backing key-value store holding versioned counter records.
///
/// The only consistency primitive the update protocol relies on is
/// [`KvStore::put_if_version_matches`]: comparing the stored version and
/// replacing the record must happen as one atomic step per key.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the record under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Counter>>;

    /// Replace the record under `key` with `record` iff its stored version is
    /// still `expected_version`.
    ///
    /// `record.version` must be `expected_version + 1` and `record.id` must be `key`.
    async fn put_if_version_matches(
        &self,
        key: &str,
        record: Counter,
        expected_version: u64,
    ) -> Result<PutOutcome>;

    /// Provision `record` unless its key already exists. Returns whether it was created.
    async fn insert_if_absent(&self, record: Counter) -> Result<bool>;
}

pub(crate) fn check_successor(key: &str, record: &Counter, expected_version: u64) -> Result<()> {
    if record.id != key {
        return Err(StoreError::InvalidData(
            format!("record id `{}` does not match key `{key}`", record.id).into(),
        ));
    }

    if expected_version.checked_add(1) != Some(record.version) {
        return Err(StoreError::InvalidData(
            format!(
                "record version {} is not the successor of {expected_version}",
                record.version
            )
            .into(),
        ));
    }

    Ok(())
}

/// Volatile store; the lock is held across compare and replace.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Counter>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `record`
    pub fn with_record(record: Counter) -> Self {
        let records = HashMap::from([(record.id.clone(), record)]);
        Self { records: Mutex::new(records) }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Counter>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn put_if_version_matches(
        &self,
        key: &str,
        record: Counter,
        expected_version: u64,
    ) -> Result<PutOutcome> {
        check_successor(key, &record, expected_version)?;

        let mut records = self.records.lock().await;
        let Some(stored) = records.get_mut(key) else {
            return Ok(PutOutcome::Absent);
        };

        if stored.version != expected_version {
            return Ok(PutOutcome::VersionMismatch);
        }

        *stored = record.clone();
        Ok(PutOutcome::Written(record))
    }

    async fn insert_if_absent(&self, record: Counter) -> Result<bool> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id.clone(), record);
        Ok(true)
    }
}
