// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store routing.
//!
//! | Mode       | Writes                        | Reads                                   |
//! |------------|-------------------------------|-----------------------------------------|
//! | Primary    | primary (fallback on failure) | primary (fallback on failure)           |
//! | Fallback   | fallback, tagged pending      | fallback                                |
//! | Recovering | fallback, tagged pending      | primary merged with unsynced fallback   |
//!
//! Writes land in exactly one store. Producers only ever see an error when
//! the fallback store itself cannot persist a record.

use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, error, warn};

use super::{FailoverEngine, Mode, WriteTarget};
use crate::filter::RecordFilter;
use crate::metrics;
use crate::record::{Record, SyncState};
use crate::storage::traits::{RecordStore, StorageError};

// Keep IN (...) lists well below SQLite's bound-parameter limit
const ID_CHUNK: usize = 500;

impl FailoverEngine {
    /// Insert or update a record in whichever store the current mode selects.
    #[tracing::instrument(skip(self, record), fields(id = %record.id, kind = %record.kind, store))]
    pub async fn insert(&self, record: &Record) -> Result<String, StorageError> {
        let mode = self.health.mode();
        // `payload` is public; never trust a caller-maintained hash
        let mut record = record.clone();
        record.rehash();

        if mode == Mode::Primary {
            match self.primary_call("insert", self.primary.insert(&record)).await {
                Ok(id) => {
                    tracing::Span::current().record("store", WriteTarget::Primary.as_str());
                    metrics::record_routed(WriteTarget::Primary.as_str(), "insert");
                    return Ok(id);
                }
                Err(e) => {
                    warn!(error = %e, "Primary write failed, redirecting to fallback store");
                    metrics::record_write_redirect();
                    self.health.report_primary_failure(&e.to_string());
                }
            }
        }

        tracing::Span::current().record("store", WriteTarget::Fallback.as_str());
        record.sync_state = SyncState::Pending;
        self.insert_fallback(&record).await
    }

    async fn insert_fallback(&self, pending: &Record) -> Result<String, StorageError> {
        match self.fallback.insert(pending).await {
            Ok(id) => {
                debug!(id = %id, "Record queued in fallback store");
                metrics::record_routed(WriteTarget::Fallback.as_str(), "insert");
                Ok(id)
            }
            Err(e) => {
                error!(id = %pending.id, error = %e, "Fallback store failed to persist record");
                metrics::record_durability_error();
                Err(StorageError::durability(&pending.id, e))
            }
        }
    }

    /// Fetch a record by id, routed like [`query`](Self::query).
    pub async fn get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        match self.health.mode() {
            Mode::Primary => match self.primary_call("get", self.primary.get(id)).await {
                Ok(record) => Ok(record),
                Err(e) => {
                    self.primary_read_failed("get", e)?;
                    self.fallback.get(id).await
                }
            },
            Mode::Fallback => self.fallback.get(id).await,
            Mode::Recovering => {
                let primary = match self.primary_call("get", self.primary.get(id)).await {
                    Ok(record) => record,
                    Err(e) => {
                        self.primary_read_failed("get", e)?;
                        return self.fallback.get(id).await;
                    }
                };
                let unsynced = self
                    .fallback
                    .get(id)
                    .await?
                    .filter(|r| r.sync_state != SyncState::Synced);

                Ok(match (primary, unsynced) {
                    (Some(p), Some(f)) if f.updated_at > p.updated_at => Some(f),
                    (Some(p), _) => Some(p),
                    (None, f) => f,
                })
            }
        }
    }

    /// Records matching `filter`, ordered by `(created_at, id)`.
    pub async fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, StorageError> {
        match self.health.mode() {
            Mode::Primary => match self.primary_call("query", self.primary.query(filter)).await {
                Ok(records) => {
                    metrics::record_routed(WriteTarget::Primary.as_str(), "query");
                    Ok(records)
                }
                Err(e) => {
                    self.primary_read_failed("query", e)?;
                    self.fallback.query(filter).await
                }
            },
            Mode::Fallback => {
                metrics::record_routed(WriteTarget::Fallback.as_str(), "query");
                self.fallback.query(filter).await
            }
            Mode::Recovering => self.merged_query(filter).await,
        }
    }

    /// Number of records matching `filter`. `limit` is ignored.
    pub async fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError> {
        match self.health.mode() {
            Mode::Primary => match self.primary_call("count", self.primary.count(filter)).await {
                Ok(n) => Ok(n),
                Err(e) => {
                    self.primary_read_failed("count", e)?;
                    self.fallback.count(filter).await
                }
            },
            Mode::Fallback => self.fallback.count(filter).await,
            Mode::Recovering => self.merged_count(filter).await,
        }
    }

    /// Primary results plus fallback records not yet synced. The fallback
    /// copy replaces the primary's when strictly newer.
    ///
    /// Both sides are fetched with the caller's limit: the first `limit`
    /// entries of the merged order always come from the first `limit` of
    /// each side.
    async fn merged_query(&self, filter: &RecordFilter) -> Result<Vec<Record>, StorageError> {
        let primary = match self.primary_call("query", self.primary.query(filter)).await {
            Ok(records) => records,
            Err(e) => {
                self.primary_read_failed("query", e)?;
                return self.fallback.query(filter).await;
            }
        };
        let unsynced = self.unsynced_fallback(filter).await?;
        metrics::record_routed("merged", "query");

        let mut by_id: HashMap<String, Record> =
            primary.into_iter().map(|r| (r.id.clone(), r)).collect();
        for record in unsynced {
            match by_id.get(&record.id) {
                Some(existing) if existing.updated_at >= record.updated_at => {}
                _ => {
                    by_id.insert(record.id.clone(), record);
                }
            }
        }

        let mut merged: Vec<Record> = by_id.into_values().collect();
        merged.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        if let Some(limit) = filter.limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    /// Size of the merged set: primary count, plus unsynced fallback records
    /// whose id the primary does not already count.
    async fn merged_count(&self, filter: &RecordFilter) -> Result<u64, StorageError> {
        let unlimited = filter.without_limit();
        let primary_count = match self.primary_call("count", self.primary.count(&unlimited)).await {
            Ok(n) => n,
            Err(e) => {
                self.primary_read_failed("count", e)?;
                return self.fallback.count(&unlimited).await;
            }
        };

        let unsynced = self.unsynced_fallback(&unlimited).await?;
        if unsynced.is_empty() {
            return Ok(primary_count);
        }

        let ids: Vec<String> = unsynced.iter().map(|r| r.id.clone()).collect();
        let mut overlap = 0u64;
        for chunk in ids.chunks(ID_CHUNK) {
            let mut chunk_filter = unlimited.clone();
            chunk_filter.ids = Some(chunk.to_vec());
            overlap += match self.primary_call("count", self.primary.count(&chunk_filter)).await {
                Ok(n) => n,
                Err(e) => {
                    self.primary_read_failed("count", e)?;
                    return self.fallback.count(&unlimited).await;
                }
            };
        }

        Ok(primary_count + unsynced.len() as u64 - overlap.min(unsynced.len() as u64))
    }

    /// Pending and failed fallback records matching `filter`, limit applied
    /// per state.
    async fn unsynced_fallback(&self, filter: &RecordFilter) -> Result<Vec<Record>, StorageError> {
        let mut records = self
            .fallback
            .query(&filter.clone().sync_state(SyncState::Pending))
            .await?;
        records.extend(
            self.fallback
                .query(&filter.clone().sync_state(SyncState::Failed))
                .await?,
        );
        Ok(records)
    }

    /// Decide what a failed primary read means. Connectivity errors switch
    /// the engine to fallback and the caller answers from the fallback store;
    /// anything else (corruption) is returned.
    fn primary_read_failed(&self, operation: &'static str, err: StorageError) -> Result<(), StorageError> {
        if !err.is_connectivity() {
            return Err(err);
        }
        warn!(operation, error = %err, "Primary read failed, serving from fallback store");
        self.health.report_primary_failure(&err.to_string());
        Ok(())
    }

    /// Run a primary operation under `write_timeout_ms`.
    pub(super) async fn primary_call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        let _timer = metrics::LatencyTimer::new("primary", operation);
        let timeout = self.config.write_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => {
                if let Err(StorageError::Corruption { .. }) = result {
                    metrics::record_corruption(self.primary.name());
                }
                result
            }
            Err(_) => {
                metrics::record_timeout(self.primary.name(), operation);
                Err(StorageError::Timeout {
                    operation: operation.to_string(),
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailoverConfig;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    async fn engine(dir: &TempDir, primary: Arc<InMemoryStore>) -> FailoverEngine {
        let config = FailoverConfig {
            fallback_path: dir.path().join("fb.db").to_string_lossy().to_string(),
            ..Default::default()
        };
        FailoverEngine::open(config, primary).await.unwrap()
    }

    fn record(id: &str, created_at: i64) -> Record {
        Record::with_id(id, "event", json!({"id": id})).at(created_at, created_at)
    }

    #[tokio::test]
    async fn test_primary_mode_writes_to_primary_only() {
        let dir = tempdir().unwrap();
        let primary = Arc::new(InMemoryStore::new());
        let engine = engine(&dir, primary.clone()).await;

        engine.insert(&record("a", 1)).await.unwrap();

        assert_eq!(primary.len(), 1);
        assert_eq!(engine.fallback.count(&RecordFilter::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fallback_mode_writes_pending_to_fallback() {
        let dir = tempdir().unwrap();
        let primary = Arc::new(InMemoryStore::new());
        let engine = engine(&dir, primary.clone()).await;
        engine.health.report_primary_failure("test");

        engine.insert(&record("a", 1)).await.unwrap();

        assert!(primary.is_empty());
        assert_eq!(engine.fallback.count_pending(None).await.unwrap(), 1);
        assert_eq!(engine.query(&RecordFilter::all()).await.unwrap().len(), 1);
        assert_eq!(engine.get("a").await.unwrap().unwrap().sync_state, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_recovering_merges_and_prefers_newer_fallback_copy() {
        let dir = tempdir().unwrap();
        let primary = Arc::new(InMemoryStore::new());
        primary.insert(&record("p-only", 1)).await.unwrap();
        primary.insert(&record("shared", 2).at(2, 10)).await.unwrap();

        let engine = engine(&dir, primary.clone()).await;
        engine.health.report_primary_failure("test");

        let mut newer = record("shared", 2);
        newer.payload = json!({"v": "fallback"});
        engine.insert(&newer.at(2, 20)).await.unwrap();
        engine.insert(&record("f-only", 3)).await.unwrap();

        // Synced rows are not merged
        engine.insert(&record("synced", 4)).await.unwrap();
        engine.fallback.mark_synced("synced").await.unwrap();

        engine.health.record_probe(&crate::resilience::health::ProbeOutcome::Healthy);
        assert_eq!(engine.mode(), Mode::Recovering);

        let results = engine.query(&RecordFilter::all()).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["p-only", "shared", "f-only"]);
        assert_eq!(results[1].payload["v"], "fallback");

        assert_eq!(engine.count(&RecordFilter::all()).await.unwrap(), 3);
        assert_eq!(engine.query(&RecordFilter::all().limit(2)).await.unwrap().len(), 2);
        assert_eq!(engine.get("shared").await.unwrap().unwrap().payload["v"], "fallback");
        assert!(engine.get("synced").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recovering_keeps_primary_copy_on_equal_timestamp() {
        let dir = tempdir().unwrap();
        let primary = Arc::new(InMemoryStore::new());
        primary.insert(&record("r", 1)).await.unwrap();

        let engine = engine(&dir, primary.clone()).await;
        engine.health.report_primary_failure("test");

        let mut same_ts = record("r", 1);
        same_ts.payload = json!({"v": "fallback"});
        engine.insert(&same_ts).await.unwrap();
        engine.health.record_probe(&crate::resilience::health::ProbeOutcome::Healthy);

        let results = engine.query(&RecordFilter::all()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].payload["id"], "r");
    }

    #[tokio::test]
    async fn test_insert_recomputes_stale_hash() {
        let dir = tempdir().unwrap();
        let primary = Arc::new(InMemoryStore::new());
        let engine = engine(&dir, primary.clone()).await;

        let mut edited = Record::with_id("s", "event", json!({"v": 1}));
        edited.payload = json!({"v": 2});
        engine.insert(&edited).await.unwrap();
        let stored = primary.get("s").await.unwrap().unwrap();
        assert_eq!(stored.content_hash, Record::compute_hash("event", &json!({"v": 2})));

        engine.health.report_primary_failure("test");
        let mut edited = Record::with_id("t", "event", json!({"v": 1}));
        edited.payload = json!({"v": 3});
        engine.insert(&edited).await.unwrap();

        let queued = engine.get("t").await.unwrap().unwrap();
        assert_eq!(queued.payload["v"], 3);
        assert_eq!(queued.content_hash, Record::compute_hash("event", &json!({"v": 3})));
        assert_eq!(engine.query(&RecordFilter::all()).await.unwrap().len(), 1);
    }
}
