//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use failover_engine::{
    FailoverConfig, FailoverEngine, InMemoryStore, Record, RecordFilter, RecordStore, StorageError,
};

/// Install a test subscriber once; `RUST_LOG=failover_engine=debug` for detail.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// An in-memory primary that can be taken offline, slowed down, or made to
/// reject specific records.
pub struct FailingStore {
    inner: InMemoryStore,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    /// Ids whose inserts always fail
    poisoned: Mutex<HashSet<String>>,
    /// Ids in the order they were successfully inserted
    insert_log: Mutex<Vec<String>>,
    calls: AtomicU64,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::named("failing"),
            offline: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            poisoned: Mutex::new(HashSet::new()),
            insert_log: Mutex::new(Vec::new()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn poison(&self, id: &str) {
        self.poisoned.lock().insert(id.to_string());
    }

    pub fn cure(&self, id: &str) {
        self.poisoned.lock().remove(id);
    }

    pub fn insert_log(&self) -> Vec<String> {
        self.insert_log.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    fn name(&self) -> &str {
        "failing"
    }

    async fn insert(&self, record: &Record) -> Result<String, StorageError> {
        self.gate().await?;
        if self.poisoned.lock().contains(&record.id) {
            return Err(StorageError::Backend(format!("constraint violation on {}", record.id)));
        }
        let id = self.inner.insert(record).await?;
        self.insert_log.lock().push(id.clone());
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        self.gate().await?;
        self.inner.get(id).await
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, StorageError> {
        self.gate().await?;
        self.inner.query(filter).await
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError> {
        self.gate().await?;
        self.inner.count(filter).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.gate().await
    }
}

/// Config with tight timings so tests run fast. Backoff is disabled
/// (base 0) unless a test overrides it.
pub fn fast_config(dir: &TempDir) -> FailoverConfig {
    FailoverConfig {
        fallback_path: dir.path().join("fallback.db").to_string_lossy().to_string(),
        probe_interval_ms: 20,
        probe_timeout_ms: 50,
        failure_threshold: 3,
        recovery_threshold: 1,
        sync_interval_ms: 20,
        write_timeout_ms: 100,
        backoff_base_ms: 0,
        backoff_cap_ms: 0,
        ..Default::default()
    }
}

pub async fn engine_with(config: FailoverConfig, primary: Arc<FailingStore>) -> FailoverEngine {
    FailoverEngine::open(config, primary).await.expect("open engine")
}

pub fn record(id: &str, kind: &str, created_at: i64) -> Record {
    Record::with_id(id, kind, serde_json::json!({"id": id})).at(created_at, created_at)
}

/// Poll until `check` holds or the deadline passes.
pub async fn wait_for<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
