//! Content-derived deduplication keys.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use folio_core::AggregateId;

/// Deterministic fingerprint of an event's content.
///
/// Derived from `(aggregate_id, occurred_at, event_type)` only, never from a
/// transport id, so the same logical event maps to the same key no matter how
/// many times (or under which broker message id) it is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn derive(aggregate_id: AggregateId, occurred_at: DateTime<Utc>, event_type: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(aggregate_id.as_uuid().as_bytes());
        hasher.update(b"|");
        hasher.update(occurred_at.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
        hasher.update(b"|");
        hasher.update(event_type.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-computed key (e.g. read back from storage).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
