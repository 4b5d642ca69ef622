use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{Result, StoreError};
use crate::helpers::{
    BASE_DELAY, COUNTER_ITEM_ID, DATA_DIR, KIBI, MAX_COUNTER_VALUE, MAX_RETRY_ATTEMPTS, MEBI,
    MIN_COUNTER_VALUE, TABLE_NAME,
};
use crate::log_store::LogStore;
use crate::service::CounterService;
use crate::store::{KvStore, MemoryStore};

/// Which [`KvStore`] backs the counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Volatile, process local
    Memory,
    /// Append-only log under the data directory
    #[default]
    Log,
}

impl FromStr for Backend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Backend::Memory),
            "log" | "file" => Ok(Backend::Log),
            other => Err(StoreError::InvalidData(format!("unknown backend `{other}`").into())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Memory => f.write_str("memory"),
            Backend::Log => f.write_str("log"),
        }
    }
}

/// Configuration for a counter service
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,

    /// Directory holding the log store (default: `./tally-data`)
    pub data_dir: PathBuf,

    /// Table identifier; the log file is `<data_dir>/<table>.log`
    pub table: String,

    /// Key of the singleton record (default: `global`)
    pub key: String,

    pub min_value: i64,
    pub max_value: i64,

    /// Version conflicts tolerated per update (default: 5)
    pub max_retry_attempts: u32,

    /// Backoff unit between conflicting attempts (default: 50ms)
    pub base_delay: Duration,

    /// Log size in bytes above which it is compacted (default: 1MB)
    pub compaction_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            data_dir: DATA_DIR.into(),
            table: TABLE_NAME.into(),
            key: COUNTER_ITEM_ID.into(),
            min_value: MIN_COUNTER_VALUE,
            max_value: MAX_COUNTER_VALUE,
            max_retry_attempts: MAX_RETRY_ATTEMPTS,
            base_delay: BASE_DELAY,
            compaction_threshold: MEBI as u64,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.min_value > self.max_value {
            return Err(StoreError::InvalidData(
                format!("min_value {} exceeds max_value {}", self.min_value, self.max_value)
                    .into(),
            ));
        }

        if self.max_retry_attempts == 0 {
            return Err(StoreError::InvalidData(
                "max_retry_attempts must be greater than 0".into(),
            ));
        }

        if self.key.is_empty() {
            return Err(StoreError::InvalidData("key must not be empty".into()));
        }

        if self.table.is_empty() {
            return Err(StoreError::InvalidData("table must not be empty".into()));
        }

        if self.compaction_threshold < 4 * KIBI as u64 {
            return Err(StoreError::InvalidData(
                "compaction_threshold must be at least 4KB".into(),
            ));
        }

        Ok(())
    }

    async fn open_store(&self) -> Result<Arc<dyn KvStore>> {
        Ok(match self.backend {
            Backend::Memory => Arc::new(MemoryStore::new()),
            Backend::Log => Arc::new(
                LogStore::open(&self.data_dir, &self.table, self.compaction_threshold).await?,
            ),
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| {
            raw.trim().parse().map_err(|err| {
                StoreError::InvalidData(format!("invalid value for {name}: {err}").into())
            })
        })
        .transpose()
}

/// Builder for configuring a [`CounterService`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
///
/// use tally::{Backend, Builder};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let counter = Builder::from_env()?
///         .backend(Backend::Log)
///         .data_dir("./data")
///         .base_delay(Duration::from_millis(20))
///         .build()
///         .await?;
///
///     let record = counter.increment().await?;
///     println!("{} (version {})", record.value, record.version);
///     Ok(())
/// }
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    /// Creates a new [`Builder`] instance with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the process environment.
    ///
    /// Recognized variables: `TALLY_BACKEND`, `TALLY_DATA_DIR`, `TABLE_NAME`,
    /// `COUNTER_ITEM_ID`, `MIN_COUNTER_VALUE`, `MAX_COUNTER_VALUE`,
    /// `MAX_RETRY_ATTEMPTS`, `TALLY_BASE_DELAY_MS`, `TALLY_COMPACTION_BYTES`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Builder::from_env`] with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(backend) = parse_var(&lookup, "TALLY_BACKEND")? {
            config.backend = backend;
        }
        if let Some(dir) = lookup("TALLY_DATA_DIR") {
            config.data_dir = dir.into();
        }
        if let Some(table) = lookup("TABLE_NAME") {
            config.table = table;
        }
        if let Some(key) = lookup("COUNTER_ITEM_ID") {
            config.key = key;
        }
        if let Some(min) = parse_var(&lookup, "MIN_COUNTER_VALUE")? {
            config.min_value = min;
        }
        if let Some(max) = parse_var(&lookup, "MAX_COUNTER_VALUE")? {
            config.max_value = max;
        }
        if let Some(attempts) = parse_var(&lookup, "MAX_RETRY_ATTEMPTS")? {
            config.max_retry_attempts = attempts;
        }
        if let Some(millis) = parse_var(&lookup, "TALLY_BASE_DELAY_MS")? {
            config.base_delay = Duration::from_millis(millis);
        }
        if let Some(bytes) = parse_var(&lookup, "TALLY_COMPACTION_BYTES")? {
            config.compaction_threshold = bytes;
        }

        Ok(Self { config })
    }

    /// Configuration as it stands
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Set the directory the log store lives in.
    #[must_use]
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the table identifier, which names the log file.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.config.table = table.into();
        self
    }

    /// Set the key of the counter record.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.config.key = key.into();
        self
    }

    /// Set the closed range the counter value must stay in.
    #[must_use]
    pub fn bounds(mut self, min: i64, max: i64) -> Self {
        self.config.min_value = min;
        self.config.max_value = max;
        self
    }

    /// Set how many version conflicts one update tolerates before failing.
    ///
    /// **NOTE**: The least value is 1 and default is 5.
    #[must_use]
    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.config.max_retry_attempts = attempts;
        self
    }

    /// Set the backoff unit.
    ///
    /// After the `n`th conflict (zero-based) an update sleeps
    /// `base * 2^n` plus uniform jitter of up to 30% of that.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Set the log size that triggers compaction.
    ///
    /// **NOTE**: The least value is 4KB and default is 1MB.
    #[must_use]
    pub fn compaction_threshold(mut self, bytes: u64) -> Self {
        self.config.compaction_threshold = bytes;
        self
    }

    /// Open the configured store and wrap it in a [`CounterService`].
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - The data directory cannot be created
    /// - Log recovery fails
    pub async fn build(self) -> Result<CounterService> {
        self.config.validate()?;
        let store = self.config.open_store().await?;
        Ok(CounterService::new(store, &self.config))
    }

    /// Like [`Builder::build`] over an already constructed store; the backend
    /// and storage settings are ignored.
    pub fn build_with_store(self, store: Arc<dyn KvStore>) -> Result<CounterService> {
        self.config.validate()?;
        Ok(CounterService::new(store, &self.config))
    }
}
