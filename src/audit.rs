// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync audit log types.
//!
//! One [`SyncLogEntry`] is appended per replay attempt. Entries are never
//! mutated or deleted by the engine; they are persisted next to the fallback
//! records (see [`FallbackStore::sync_log`](crate::FallbackStore::sync_log))
//! and exposed read-only for operational tooling.

use serde::{Deserialize, Serialize};

use crate::record::{now_millis, Record};

/// Outcome of a single replay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncResult {
    /// Written to the primary and marked synced
    Success,
    /// Primary write failed; the record stays pending or becomes failed
    Failed,
    /// Written to the primary but the fallback row could not be marked
    /// synced. The record stays pending and is replayed idempotently.
    Partial,
}

impl SyncResult {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record of one replay attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Insertion sequence, assigned by the store (0 until persisted)
    pub seq: i64,
    pub record_id: String,
    pub kind: String,
    pub result: SyncResult,
    /// Epoch millis
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// The record's `sync_attempts` after this attempt
    pub attempt: u32,
    /// Drain pass that produced the entry
    pub pass_id: String,
}

impl SyncLogEntry {
    pub fn new(record: &Record, result: SyncResult, pass_id: impl Into<String>) -> Self {
        Self {
            seq: 0,
            record_id: record.id.clone(),
            kind: record.kind.clone(),
            result,
            timestamp: now_millis(),
            error_detail: None,
            attempt: record.sync_attempts,
            pass_id: pass_id.into(),
        }
    }

    #[must_use]
    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Read filter for the audit log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub record_id: Option<String>,
    pub result: Option<SyncResult>,
    /// Inclusive lower bound on `timestamp`
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    #[must_use]
    pub fn for_record(id: impl Into<String>) -> Self {
        Self {
            record_id: Some(id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn result(mut self, result: SyncResult) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn since(mut self, ts: i64) -> Self {
        self.since = Some(ts);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_from_record() {
        let mut record = Record::with_id("r-1", "event", json!({}));
        record.sync_attempts = 2;

        let entry = SyncLogEntry::new(&record, SyncResult::Failed, "pass-1").with_error("timeout");

        assert_eq!(entry.record_id, "r-1");
        assert_eq!(entry.kind, "event");
        assert_eq!(entry.attempt, 2);
        assert_eq!(entry.error_detail.as_deref(), Some("timeout"));
        assert_eq!(entry.seq, 0);
    }

    #[test]
    fn test_result_parse() {
        for result in [SyncResult::Success, SyncResult::Failed, SyncResult::Partial] {
            assert_eq!(SyncResult::parse(result.as_str()), Some(result));
        }
        assert_eq!(SyncResult::parse("nope"), None);
    }

    #[test]
    fn test_serialize_skips_missing_error() {
        let record = Record::new("event", json!({}));
        let entry = SyncLogEntry::new(&record, SyncResult::Success, "p");
        let json_str = serde_json::to_string(&entry).unwrap();
        assert!(!json_str.contains("error_detail"));
        assert!(json_str.contains("\"result\":\"success\""));
    }
}
