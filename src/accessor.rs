use std::sync::Arc;

use tracing::trace;

use crate::errors::{CounterError, StoreError};
use crate::record::Counter;
use crate::store::{KvStore, PutOutcome};

/// Result of a conditional write that the caller has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAttempt {
    Written(Counter),
    /// The stored version moved on since it was read.
    Conflict,
}

/// Read and compare-and-swap access to the one counter record.
///
/// Every call is exactly one round trip to the store.
#[derive(Clone)]
pub struct CounterAccessor {
    store: Arc<dyn KvStore>,
    key: String,
}

impl CounterAccessor {
    pub fn new(store: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        Self { store, key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current record. Missing record is [`CounterError::NotFound`].
    pub async fn fetch(&self) -> Result<Counter, CounterError> {
        let record = self.store.get(&self.key).await?;
        trace!(key = %self.key, found = record.is_some(), "fetch");
        record.ok_or_else(|| CounterError::NotFound { key: self.key.clone() })
    }

    /// Set `value` with version `expected_version + 1` iff the stored version
    /// is still `expected_version`.
    pub async fn conditional_write(
        &self,
        value: i64,
        expected_version: u64,
    ) -> Result<WriteAttempt, CounterError> {
        let version = expected_version
            .checked_add(1)
            .ok_or_else(|| StoreError::InvalidData("record version overflow".into()))?;
        let record = Counter::new(self.key.as_str(), value, version);

        match self.store.put_if_version_matches(&self.key, record, expected_version).await? {
            PutOutcome::Written(record) => Ok(WriteAttempt::Written(record)),
            PutOutcome::VersionMismatch => Ok(WriteAttempt::Conflict),
            PutOutcome::Absent => Err(CounterError::NotFound { key: self.key.clone() }),
        }
    }

    /// Create the record at [`Counter::INITIAL_VERSION`] if it does not exist yet
    pub async fn provision(&self, value: i64) -> Result<bool, CounterError> {
        let record = Counter::new(self.key.as_str(), value, Counter::INITIAL_VERSION);
        Ok(self.store.insert_if_absent(record).await?)
    }
}
