// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record data structure.
//!
//! A [`Record`] is the unit that flows through the engine: an opaque JSON
//! payload plus identity, a category tag (`kind`) and replication metadata.
//!
//! # Example
//!
//! ```
//! use failover_engine::{Record, SyncState};
//! use serde_json::json;
//!
//! let record = Record::new("session", json!({"user": "alice", "seconds": 42}));
//!
//! assert_eq!(record.kind, "session");
//! assert_eq!(record.sync_state, SyncState::Pending);
//! assert_eq!(record.sync_attempts, 0);
//! assert_eq!(record.content_hash.len(), 64);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Current time as epoch millis.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Replication progress of a record held by the fallback store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Waiting to be replayed into the primary store
    Pending,
    /// Present, unmodified, in the primary store
    Synced,
    /// Exceeded the retry budget; excluded from automatic drains
    Failed,
}

impl SyncState {
    /// Column value used by the SQL backends.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    /// Parse a column value. Unknown values are treated as pending so a
    /// row is never silently dropped from the drain queue.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "synced" => Self::Synced,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured record with identity and sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique id, assigned at creation (UUID v4 unless supplied)
    pub id: String,
    /// Category tag, e.g. "session" or "event"
    pub kind: String,
    /// Arbitrary structured payload
    pub payload: Value,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
    /// Last update timestamp (epoch millis)
    pub updated_at: i64,
    /// Replication state (meaningful in the fallback store)
    pub sync_state: SyncState,
    /// Number of failed replay attempts. Only ever increases.
    pub sync_attempts: u32,
    /// Timestamp of the last replay attempt (epoch millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
    /// Hex SHA-256 of `kind` + canonical payload JSON
    pub content_hash: String,
}

impl Record {
    /// Create a new record with a generated id.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, payload)
    }

    /// Create a new record with a caller-supplied id.
    pub fn with_id(id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        let now = now_millis();
        let kind = kind.into();
        let content_hash = Self::compute_hash(&kind, &payload);
        Self {
            id: id.into(),
            kind,
            payload,
            created_at: now,
            updated_at: now,
            sync_state: SyncState::Pending,
            sync_attempts: 0,
            last_attempt_at: None,
            content_hash,
        }
    }

    /// Override both timestamps. Mostly useful for replaying external data
    /// and for tests that need a deterministic order.
    #[must_use]
    pub fn at(mut self, created_at: i64, updated_at: i64) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    /// Replace the payload and bump `updated_at`.
    pub fn update_payload(&mut self, payload: Value) {
        self.payload = payload;
        self.updated_at = now_millis().max(self.updated_at + 1);
        self.rehash();
    }

    /// Recompute `content_hash` after mutating `kind` or `payload` directly.
    pub fn rehash(&mut self) {
        self.content_hash = Self::compute_hash(&self.kind, &self.payload);
    }

    /// Hash of kind + payload. `serde_json` maps are ordered, so the
    /// serialized form is canonical.
    #[must_use]
    pub fn compute_hash(kind: &str, payload: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(payload.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// True when both records carry the same kind and payload.
    #[must_use]
    pub fn same_content(&self, other: &Record) -> bool {
        self.content_hash == other.content_hash
    }
}
