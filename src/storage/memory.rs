// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{RecordStore, StorageError};
use crate::filter::RecordFilter;
use crate::record::{Record, SyncState};

/// Concurrent in-memory record store.
///
/// Useful as a primary for embedded deployments and tests. Not durable.
pub struct InMemoryStore {
    name: String,
    data: DashMap<String, Record>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::named("memory")
    }

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: DashMap::new(),
        }
    }

    /// Get current record count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all records
    pub fn clear(&self) {
        self.data.clear();
    }

    fn matching(&self, filter: &RecordFilter) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .data
            .iter()
            .filter(|r| filter.matches(r.value(), true))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        records
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert(&self, record: &Record) -> Result<String, StorageError> {
        let mut stored = record.clone();
        stored.rehash();
        self.data.insert(record.id.clone(), stored);
        Ok(record.id.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        Ok(self.data.get(id).map(|r| r.value().clone()))
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, StorageError> {
        let mut records = self.matching(filter);
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError> {
        Ok(self
            .data
            .iter()
            .filter(|r| filter.matches(r.value(), true))
            .count() as u64)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn set_sync_state(&self, id: &str, state: SyncState) -> Result<bool, StorageError> {
        match self.data.get_mut(id) {
            Some(mut entry) => {
                entry.sync_state = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
