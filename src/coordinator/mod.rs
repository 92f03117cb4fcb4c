// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failover coordinator.
//!
//! The [`FailoverEngine`] ties the components together:
//! - a primary [`RecordStore`] (MySQL/SQLite via [`SqlStore`], or any other backend)
//! - the durable SQLite [`FallbackStore`]
//! - the [`HealthMonitor`] that owns the current [`Mode`]
//! - the router (`insert`/`get`/`query`/`count`) and the drain loop that
//!   replays fallback records into the primary once it recovers
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use failover_engine::{FailoverEngine, FailoverConfig, InMemoryStore, Record, EngineState};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), failover_engine::StorageError> {
//! let config = FailoverConfig {
//!     fallback_path: "/tmp/ingest-fallback.db".into(),
//!     ..Default::default()
//! };
//! let engine = Arc::new(FailoverEngine::open(config, Arc::new(InMemoryStore::new())).await?);
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start()?;
//! engine.insert(&Record::new("event", json!({"clicks": 3}))).await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod drain;
mod lifecycle;
mod router;
mod types;

pub use types::{DrainReport, EngineState, Mode, ModeChange};
use types::WriteTarget;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::audit::{AuditFilter, SyncLogEntry};
use crate::config::FailoverConfig;
use crate::resilience::health::{HealthMonitor, HealthStats};
use crate::storage::fallback::{FallbackStats, FallbackStore};
use crate::storage::sql::SqlStore;
use crate::storage::traits::{RecordStore, StorageError};

use drain::DrainProgress;

/// Point-in-time view of the engine for dashboards and health endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub state: EngineState,
    pub health: HealthStats,
    pub fallback: FallbackStats,
}

/// Routes reads and writes between a primary store and a durable fallback
/// store, and reconciles the two after an outage.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`. Share it behind an `Arc`; [`start`](Self::start)
/// takes `self: &Arc<Self>` so the background loops can hold a handle.
pub struct FailoverEngine {
    /// Configuration (fixed at construction)
    pub(super) config: FailoverConfig,

    pub(super) primary: Arc<dyn RecordStore>,

    pub(super) fallback: Arc<FallbackStore>,

    /// Owns the mode state machine
    pub(super) health: Arc<HealthMonitor>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Set once on shutdown; background loops exit when they see it
    pub(super) shutdown_tx: watch::Sender<bool>,

    /// Background loop handles, awaited on shutdown
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Serializes drain passes and tracks recovery progress
    pub(super) drain: tokio::sync::Mutex<DrainProgress>,
}

impl FailoverEngine {
    /// Create an engine over already-opened stores. Fails if `config` does
    /// not validate.
    ///
    /// The engine starts in `Created` state and [`Mode::Primary`]. Call
    /// [`start()`](Self::start) to spawn the probe and drain loops.
    pub fn new(
        config: FailoverConfig,
        primary: Arc<dyn RecordStore>,
        fallback: Arc<FallbackStore>,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        let health = Arc::new(HealthMonitor::new(&config));

        Ok(Self {
            config,
            primary,
            fallback,
            health,
            state: state_tx,
            state_rx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            drain: tokio::sync::Mutex::new(DrainProgress::default()),
        })
    }

    /// Validate the config and open the fallback store at
    /// `config.fallback_path`.
    pub async fn open(config: FailoverConfig, primary: Arc<dyn RecordStore>) -> Result<Self, StorageError> {
        config.validate()?;
        let fallback = Arc::new(FallbackStore::open(&config.fallback_path).await?);
        info!(
            primary = primary.name(),
            fallback = %fallback.path(),
            "Failover engine opened"
        );
        Self::new(config, primary, fallback)
    }

    /// Connect to the SQL primary named by `config.primary_url` and open the
    /// fallback store.
    pub async fn connect(config: FailoverConfig) -> Result<Self, StorageError> {
        let url = config
            .primary_url
            .clone()
            .ok_or_else(|| StorageError::Config("primary_url is required to connect".to_string()))?;
        config.validate()?;
        let primary = SqlStore::new(&url).await?;
        Self::open(config, Arc::new(primary)).await
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Which store currently serves traffic.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.health.mode()
    }

    /// Subscribe to mode-change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ModeChange> {
        self.health.subscribe()
    }

    /// Watch the current mode.
    #[must_use]
    pub fn subscribe_mode(&self) -> watch::Receiver<Mode> {
        self.health.subscribe_mode()
    }

    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    #[must_use]
    pub fn fallback(&self) -> &Arc<FallbackStore> {
        &self.fallback
    }

    #[must_use]
    pub fn primary(&self) -> &Arc<dyn RecordStore> {
        &self.primary
    }

    #[must_use]
    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Read the sync audit log.
    pub async fn sync_log(&self, filter: &AuditFilter) -> Result<Vec<SyncLogEntry>, StorageError> {
        self.fallback.sync_log(filter).await
    }

    /// Put a record that exhausted its retry budget back in the queue.
    pub async fn requeue(&self, id: &str) -> Result<bool, StorageError> {
        self.fallback.requeue(id).await
    }

    pub async fn stats(&self) -> Result<EngineStats, StorageError> {
        Ok(EngineStats {
            state: self.state(),
            health: self.health.stats(),
            fallback: self.fallback.stats().await?,
        })
    }

    pub(super) fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}
