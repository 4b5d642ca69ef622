use serde::{Deserialize, Serialize};

/// The singleton counter record.
///
/// `version` is the optimistic-lock token: it grows by exactly one on every
/// accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub id: String,
    pub value: i64,
    pub version: u64,
}

impl Counter {
    /// Version assigned to a freshly provisioned record
    pub const INITIAL_VERSION: u64 = 0;

    pub fn new(id: impl Into<String>, value: i64, version: u64) -> Self {
        Self { id: id.into(), value, version }
    }
}
