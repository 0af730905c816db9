//! Cluster Identities
//!
//! Member identities used to address peers, and store identities used to
//! make sure a store copy only ever comes from the same logical database.

use serde::{Deserialize, Serialize};

/// Identity of a cluster member (core or read replica)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MemberId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MemberId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of a store.
///
/// Two stores with the same id were created from the same initial store and
/// may exchange transactions; a store copy between different ids is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    /// Creation time in milliseconds since the Unix epoch
    pub creation_time: i64,
    /// Random component chosen at creation
    pub random_id: uuid::Uuid,
}

impl StoreId {
    /// Generate a fresh store id for a newly created store
    pub fn generate() -> Self {
        Self {
            creation_time: chrono::Utc::now().timestamp_millis(),
            random_id: uuid::Uuid::new_v4(),
        }
    }

    /// Create from raw parts
    pub fn from_parts(creation_time: i64, random_id: uuid::Uuid) -> Self {
        Self {
            creation_time,
            random_id,
        }
    }

    /// Creation time as a UTC timestamp
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.creation_time)
    }
}

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Store{{created={}, id={}}}", self.creation_time, self.random_id)
    }
}
