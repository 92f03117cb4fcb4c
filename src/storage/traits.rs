// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The record store contract shared by the primary and fallback backends.

use async_trait::async_trait;
use thiserror::Error;

use crate::filter::RecordFilter;
use crate::record::{Record, SyncState};

/// Id used by the default [`RecordStore::ping`] probe read.
pub const PROBE_ID: &str = "__failover_probe__";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Record not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Operation '{operation}' timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },
    #[error("Data corruption detected for '{id}': {detail}")]
    Corruption { id: String, detail: String },
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The fallback store could not persist a write. There is nothing left
    /// to fall back to, so this is the one error producers see.
    #[error("Fallback store failed to persist record '{id}': {source}")]
    Durability {
        id: String,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Wrap a fallback-store failure for the producer-facing API.
    pub fn durability(id: impl Into<String>, source: StorageError) -> Self {
        Self::Durability {
            id: id.into(),
            source: Box::new(source),
        }
    }

    /// True for errors that say "the store is unreachable or slow" rather
    /// than "this record is bad".
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout { .. })
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// Uniform contract implemented by every backend.
///
/// `insert` is an upsert keyed by `id`: re-inserting a record updates it in
/// place instead of duplicating it, which is what makes replay idempotent.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &str;

    /// Insert or replace a record. Returns the record id.
    async fn insert(&self, record: &Record) -> Result<String, StorageError>;

    async fn get(&self, id: &str) -> Result<Option<Record>, StorageError>;

    /// Records matching the filter, ordered by `(created_at, id)`.
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, StorageError>;

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError>;

    /// Cheap reachability probe. Default implementation reads a sentinel id.
    async fn ping(&self) -> Result<(), StorageError> {
        self.get(PROBE_ID).await.map(|_| ())
    }

    /// Update the sync state tag of a stored record. Returns whether a row
    /// changed. Stores that do not track sync state (a primary holds only
    /// synced data) keep the default, which changes nothing.
    async fn set_sync_state(&self, _id: &str, _state: SyncState) -> Result<bool, StorageError> {
        Ok(false)
    }
}
