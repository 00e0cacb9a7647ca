//! Data models for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One denied tunnel attempt, as appended to the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedRecord {
    /// The host the client tried to reach.
    pub domain: String,
    /// When the attempt was denied (RFC 3339).
    pub timestamp: DateTime<Utc>,
}

impl BlockedRecord {
    /// Creates a record stamped with the current time.
    pub fn now(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A user's request to have a domain added to the whitelist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistRequest {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub description: String,
}
