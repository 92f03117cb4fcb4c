// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict resolution between the primary copy of a record and the
//! fallback copy being replayed.
//!
//! Resolution is a pure function of the two versions, so replaying the same
//! pair always produces the same result:
//!
//! 1. A strictly newer `updated_at` wins outright.
//! 2. On equal timestamps, object payloads are merged field by field:
//!    a non-null value beats null, and when both sides hold different
//!    non-null values the fallback's value is kept. Non-object payloads
//!    resolve to the fallback's payload unless it is null.
//!
//! ```
//! use failover_engine::conflict::{resolve, ConflictOutcome};
//! use failover_engine::Record;
//! use serde_json::json;
//!
//! let primary = Record::with_id("r", "event", json!({"a": 1, "b": null})).at(0, 100);
//! let fallback = Record::with_id("r", "event", json!({"a": 2, "b": 3})).at(0, 100);
//!
//! let resolution = resolve(&primary, &fallback);
//! assert_eq!(resolution.outcome, ConflictOutcome::Merged);
//! assert_eq!(resolution.record.payload, json!({"a": 2, "b": 3}));
//! ```

use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::record::Record;

/// Which side determined the resolved version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictOutcome {
    PrimaryNewer,
    FallbackNewer,
    Merged,
}

impl ConflictOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryNewer => "primary_newer",
            Self::FallbackNewer => "fallback_newer",
            Self::Merged => "merged",
        }
    }
}

/// The version both stores should converge on.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub record: Record,
    pub outcome: ConflictOutcome,
}

/// Resolve two versions of the same record.
///
/// Sync metadata (`sync_state`, `sync_attempts`, `last_attempt_at`) is taken
/// from the fallback copy, since that is the row being replayed.
#[must_use]
pub fn resolve(primary: &Record, fallback: &Record) -> Resolution {
    match fallback.updated_at.cmp(&primary.updated_at) {
        Ordering::Greater => Resolution {
            record: fallback.clone(),
            outcome: ConflictOutcome::FallbackNewer,
        },
        Ordering::Less => {
            let mut record = primary.clone();
            record.sync_state = fallback.sync_state;
            record.sync_attempts = fallback.sync_attempts;
            record.last_attempt_at = fallback.last_attempt_at;
            Resolution {
                record,
                outcome: ConflictOutcome::PrimaryNewer,
            }
        }
        Ordering::Equal => {
            let mut record = fallback.clone();
            record.payload = merge_values(&primary.payload, &fallback.payload);
            record.created_at = primary.created_at.min(fallback.created_at);
            record.rehash();
            Resolution {
                record,
                outcome: ConflictOutcome::Merged,
            }
        }
    }
}

fn merge_values(primary: &Value, fallback: &Value) -> Value {
    match (primary, fallback) {
        (Value::Object(p), Value::Object(f)) => Value::Object(merge_objects(p, f)),
        (p, Value::Null) => p.clone(),
        (_, f) => f.clone(),
    }
}

fn merge_objects(primary: &Map<String, Value>, fallback: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = primary.clone();
    for (key, f_value) in fallback {
        // A null from the fallback never overwrites a key the primary has
        if f_value.is_null() && merged.contains_key(key) {
            continue;
        }
        merged.insert(key.clone(), f_value.clone());
    }
    merged
}
