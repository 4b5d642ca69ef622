use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::accessor::{CounterAccessor, WriteAttempt};
use crate::config::Config;
use crate::errors::CounterError;
use crate::helpers::backoff_delay;
use crate::record::Counter;
use crate::store::KvStore;

/// Bounded counter with optimistic concurrency.
///
/// Holds no mutable state: concurrent callers coordinate only through the
/// store's conditional write, so the service can be shared freely behind an
/// `Arc` across tasks.
pub struct CounterService {
    accessor: CounterAccessor,
    min_value: i64,
    max_value: i64,
    max_retry_attempts: u32,
    base_delay: Duration,
}

impl CounterService {
    pub fn new(store: Arc<dyn KvStore>, config: &Config) -> Self {
        Self {
            accessor: CounterAccessor::new(store, config.key.as_str()),
            min_value: config.min_value,
            max_value: config.max_value,
            max_retry_attempts: config.max_retry_attempts,
            base_delay: config.base_delay,
        }
    }

    pub fn key(&self) -> &str {
        self.accessor.key()
    }

    /// Inclusive `(min, max)` range of the counter
    pub fn bounds(&self) -> (i64, i64) {
        (self.min_value, self.max_value)
    }

    /// Current record, without mutation
    pub async fn get(&self) -> Result<Counter, CounterError> {
        self.accessor.fetch().await
    }

    pub async fn increment(&self) -> Result<Counter, CounterError> {
        self.update(1).await
    }

    pub async fn decrement(&self) -> Result<Counter, CounterError> {
        self.update(-1).await
    }

    /// Apply `delta` to the counter and return the record that was written.
    ///
    /// Each attempt re-reads the record and writes conditionally on the version
    /// it saw. A version conflict backs off and retries, up to
    /// `max_retry_attempts` attempts in total. A result outside the range fails
    /// at once with [`CounterError::Boundary`] and is never retried, even though
    /// a concurrent writer might move the value back into range. Store failures
    /// propagate unchanged.
    pub async fn update(&self, delta: i64) -> Result<Counter, CounterError> {
        let mut conflicts = 0;

        loop {
            let current = self.accessor.fetch().await?;
            let proposed = i128::from(current.value) + i128::from(delta);

            let Some(value) = self.checked_value(proposed) else {
                warn!(
                    key = self.key(),
                    current = current.value,
                    delta,
                    min = self.min_value,
                    max = self.max_value,
                    "counter boundary violation"
                );
                return Err(CounterError::Boundary {
                    proposed,
                    min: self.min_value,
                    max: self.max_value,
                });
            };

            debug!(key = self.key(), version = current.version, value, "writing counter");

            match self.accessor.conditional_write(value, current.version).await? {
                WriteAttempt::Written(updated) => {
                    info!(
                        key = self.key(),
                        from = current.value,
                        to = updated.value,
                        version = updated.version,
                        attempt = conflicts + 1,
                        "counter updated"
                    );
                    return Ok(updated);
                }
                WriteAttempt::Conflict => {
                    conflicts += 1;
                    if conflicts >= self.max_retry_attempts {
                        warn!(key = self.key(), attempts = conflicts, "counter retries exhausted");
                        return Err(CounterError::RetryExhausted { attempts: conflicts });
                    }

                    let delay = backoff_delay(self.base_delay, conflicts - 1);
                    warn!(
                        key = self.key(),
                        retry = conflicts,
                        max = self.max_retry_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        "concurrent update detected"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Create the record with `value` unless it already exists.
    ///
    /// Provisioning happens out of band; [`CounterService::update`] never creates a record.
    pub async fn provision(&self, value: i64) -> Result<bool, CounterError> {
        if self.checked_value(i128::from(value)).is_none() {
            return Err(CounterError::Boundary {
                proposed: i128::from(value),
                min: self.min_value,
                max: self.max_value,
            });
        }

        let created = self.accessor.provision(value).await?;
        info!(key = self.key(), value, created, "counter provisioned");
        Ok(created)
    }

    fn checked_value(&self, proposed: i128) -> Option<i64> {
        let in_range =
            proposed >= i128::from(self.min_value) && proposed <= i128::from(self.max_value);
        if in_range { i64::try_from(proposed).ok() } else { None }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::Builder;
    use crate::errors::{Result, StoreError};
    use crate::helpers::{BASE_DELAY, MAX_COUNTER_VALUE};
    use crate::store::{MemoryStore, PutOutcome};

    /// Memory store that loses a scripted number of write races.
    ///
    /// When `competitor` is set, a rival writer applies that delta between the
    /// caller's read and write, so the stored version really moves.
    #[derive(Default)]
    struct ContendedStore {
        inner: MemoryStore,
        conflicts: AtomicU32,
        competitor: Option<i64>,
        fail_puts: bool,
        gets: AtomicUsize,
        puts: AtomicUsize,
    }

    impl ContendedStore {
        fn new(record: Counter) -> Self {
            Self { inner: MemoryStore::with_record(record), ..Default::default() }
        }

        fn conflicts(self, n: u32) -> Self {
            self.conflicts.store(n, Ordering::SeqCst);
            self
        }

        fn competitor(mut self, delta: i64) -> Self {
            self.competitor = Some(delta);
            self
        }

        fn failing_puts(mut self) -> Self {
            self.fail_puts = true;
            self
        }

        fn calls(&self) -> (usize, usize) {
            (self.gets.load(Ordering::SeqCst), self.puts.load(Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl KvStore for ContendedStore {
        async fn get(&self, key: &str) -> Result<Option<Counter>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn put_if_version_matches(
            &self,
            key: &str,
            record: Counter,
            expected_version: u64,
        ) -> Result<PutOutcome> {
            self.puts.fetch_add(1, Ordering::SeqCst);

            if self.fail_puts {
                return Err(StoreError::Unavailable("request timed out".into()));
            }

            let lose = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !lose {
                return self.inner.put_if_version_matches(key, record, expected_version).await;
            }

            if let Some(delta) = self.competitor {
                let stored = self.inner.get(key).await?.expect("record provisioned");
                let rival = Counter::new(key, stored.value + delta, stored.version + 1);
                self.inner.put_if_version_matches(key, rival, stored.version).await?;
            }
            Ok(PutOutcome::VersionMismatch)
        }

        async fn insert_if_absent(&self, record: Counter) -> Result<bool> {
            self.inner.insert_if_absent(record).await
        }
    }

    fn service(store: &Arc<ContendedStore>) -> CounterService {
        Builder::new().base_delay(Duration::from_millis(1)).build_with_store(store.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_uncontended_increment() {
        let store = Arc::new(ContendedStore::new(Counter::new("global", 10, 1)));
        let counter = service(&store);

        let updated = counter.increment().await.unwrap();
        assert_eq!(updated, Counter::new("global", 11, 2));
        assert_eq!(store.calls(), (1, 1));
    }

    #[tokio::test]
    async fn test_arbitrary_delta() {
        let store = Arc::new(ContendedStore::new(Counter::new("global", 500, 9)));
        let counter = service(&store);

        assert_eq!(counter.update(-200).await.unwrap(), Counter::new("global", 300, 10));
        assert_eq!(counter.update(0).await.unwrap(), Counter::new("global", 300, 11));
    }

    #[tokio::test]
    async fn test_increment_at_max_is_boundary_error() {
        let store = Arc::new(ContendedStore::new(Counter::new("global", MAX_COUNTER_VALUE, 1)));
        let counter = service(&store);

        let err = counter.increment().await.unwrap_err();
        assert!(matches!(err, CounterError::Boundary { proposed: 1_000_000_001, .. }));
        assert_eq!(store.calls(), (1, 0), "Boundary failure must not write or re-fetch");
        assert_eq!(
            store.inner.get("global").await.unwrap(),
            Some(Counter::new("global", MAX_COUNTER_VALUE, 1))
        );
    }

    #[tokio::test]
    async fn test_decrement_at_min_is_boundary_error() {
        let store = Arc::new(ContendedStore::new(Counter::new("global", 0, 1)));
        let counter = service(&store);

        assert!(matches!(counter.decrement().await, Err(CounterError::Boundary { .. })));
        assert_eq!(store.calls(), (1, 0));
    }

    #[tokio::test]
    async fn test_extreme_delta_does_not_overflow() {
        let store = Arc::new(ContendedStore::new(Counter::new("global", 10, 1)));
        let counter = service(&store);

        assert!(matches!(counter.update(i64::MAX).await, Err(CounterError::Boundary { .. })));
        assert!(matches!(counter.update(i64::MIN).await, Err(CounterError::Boundary { .. })));
        assert_eq!(store.calls(), (2, 0));
    }

    #[tokio::test]
    async fn test_conflict_then_success_returns_fresh_record() {
        let store = Arc::new(
            ContendedStore::new(Counter::new("global", 10, 1)).conflicts(1).competitor(1),
        );
        let counter = service(&store);

        let updated = counter.increment().await.unwrap();
        assert_eq!(updated, Counter::new("global", 12, 3));
        assert_eq!(store.calls(), (2, 2));
    }

    #[tokio::test]
    async fn test_retry_exhausted_after_max_attempts() {
        let store =
            Arc::new(ContendedStore::new(Counter::new("global", 10, 1)).conflicts(u32::MAX));
        let counter = service(&store);

        let err = counter.increment().await.unwrap_err();
        assert!(matches!(err, CounterError::RetryExhausted { attempts: 5 }));
        assert_eq!(store.calls(), (5, 5), "Exactly five fetch+write pairs");
        assert_eq!(
            store.inner.get("global").await.unwrap(),
            Some(Counter::new("global", 10, 1)),
            "Caller's delta must never land"
        );
    }

    #[tokio::test]
    async fn test_retry_exhausted_with_rival_writers() {
        let store = Arc::new(
            ContendedStore::new(Counter::new("global", 10, 1)).conflicts(5).competitor(2),
        );
        let counter = service(&store);

        assert!(matches!(counter.increment().await, Err(CounterError::RetryExhausted { .. })));
        // Only the five rival deltas were applied
        assert_eq!(
            store.inner.get("global").await.unwrap(),
            Some(Counter::new("global", 20, 6))
        );
    }

    #[tokio::test]
    async fn test_last_attempt_can_still_succeed() {
        let store = Arc::new(ContendedStore::new(Counter::new("global", 10, 1)).conflicts(4));
        let counter = service(&store);

        assert_eq!(counter.increment().await.unwrap(), Counter::new("global", 11, 2));
        assert_eq!(store.calls(), (5, 5));
    }

    #[tokio::test]
    async fn test_single_attempt_budget() {
        let store = Arc::new(ContendedStore::new(Counter::new("global", 10, 1)).conflicts(1));
        let counter = Builder::new().max_retry_attempts(1).build_with_store(store.clone()).unwrap();

        assert!(matches!(
            counter.increment().await,
            Err(CounterError::RetryExhausted { attempts: 1 })
        ));
        assert_eq!(store.calls(), (1, 1));
    }

    #[tokio::test]
    async fn test_store_failure_is_not_retried() {
        let store =
            Arc::new(ContendedStore::new(Counter::new("global", 10, 1)).failing_puts());
        let counter = service(&store);

        assert!(matches!(
            counter.increment().await,
            Err(CounterError::Store(StoreError::Unavailable(_)))
        ));
        assert_eq!(store.calls(), (1, 1));
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let counter = Builder::new().build_with_store(Arc::new(MemoryStore::new())).unwrap();

        assert!(matches!(counter.get().await, Err(CounterError::NotFound { .. })));
        assert!(matches!(counter.increment().await, Err(CounterError::NotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule() {
        let store =
            Arc::new(ContendedStore::new(Counter::new("global", 10, 1)).conflicts(u32::MAX));
        let counter =
            Builder::new().base_delay(BASE_DELAY).build_with_store(store.clone()).unwrap();

        let started = tokio::time::Instant::now();
        assert!(counter.increment().await.is_err());
        let elapsed = started.elapsed();

        // 50 + 100 + 200 + 400ms, each with up to 30% jitter; no sleep after the last
        assert!(elapsed >= Duration::from_millis(750), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(975), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_provision() {
        let counter = Builder::new().build_with_store(Arc::new(MemoryStore::new())).unwrap();

        assert!(counter.provision(0).await.unwrap());
        assert!(!counter.provision(42).await.unwrap(), "Existing record is left alone");
        assert_eq!(counter.get().await.unwrap(), Counter::new("global", 0, 0));

        assert!(matches!(counter.provision(-1).await, Err(CounterError::Boundary { .. })));
    }
}
