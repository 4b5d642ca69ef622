use std::borrow::Cow;
use std::{io, result};

use thiserror::Error;

/// Raw failure reported by a [`KvStore`](crate::KvStore).
///
/// Version mismatches are not errors; they come back as
/// [`PutOutcome::VersionMismatch`](crate::PutOutcome::VersionMismatch).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Data corruption: {0}")]
    Corruption(Cow<'static, str>),

    #[error("Invalid data: {0}")]
    InvalidData(Cow<'static, str>),

    /// The store could not be reached or answered with garbage.
    #[error("Store unavailable: {0}")]
    Unavailable(Cow<'static, str>),
}

impl From<std::array::TryFromSliceError> for StoreError {
    fn from(err: std::array::TryFromSliceError) -> Self {
        StoreError::InvalidData(err.to_string().into())
    }
}

pub type Result<T> = result::Result<T, StoreError>;

/// Terminal failure of a counter operation.
///
/// Each variant is a distinct signal: callers retry later on
/// [`CounterError::RetryExhausted`] but never on [`CounterError::Boundary`].
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Counter item not found in database (key `{key}`)")]
    NotFound { key: String },

    #[error("Counter value {proposed} is out of valid range [{min}, {max}]")]
    Boundary { proposed: i128, min: i64, max: i64 },

    #[error("Maximum retry attempts ({attempts}) exceeded")]
    RetryExhausted { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CounterError {
    /// Stable machine readable code, as used on the wire.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            CounterError::NotFound { .. } => "NotFound",
            CounterError::Boundary { .. } => "BoundaryViolation",
            CounterError::RetryExhausted { .. } => "ConcurrentUpdateConflict",
            CounterError::Store(_) => "InternalServerError",
        }
    }
}
