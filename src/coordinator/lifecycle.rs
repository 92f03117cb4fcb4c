// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: background loops and graceful shutdown.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{EngineState, FailoverEngine, Mode};
use crate::metrics;
use crate::storage::traits::StorageError;

impl FailoverEngine {
    /// Spawn the health probe loop and the drain loop.
    ///
    /// Pending records left by a previous run are picked up by the first
    /// drain pass.
    #[tracing::instrument(skip(self))]
    pub fn start(self: &Arc<Self>) -> Result<(), StorageError> {
        if self.state() != EngineState::Created {
            return Err(StorageError::Config(format!(
                "engine cannot start from state {}",
                self.state()
            )));
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            Arc::clone(self).run_health_loop(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(self).run_sync_loop(self.shutdown_tx.subscribe()),
        ));
        drop(tasks);

        let _ = self.state.send(EngineState::Running);
        metrics::set_engine_state("running");
        info!(
            primary = self.primary.name(),
            probe_interval_ms = self.config.probe_interval_ms,
            sync_interval_ms = self.config.sync_interval_ms,
            "Failover engine running"
        );
        Ok(())
    }

    async fn run_health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.probe_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.health.check(self.primary.as_ref()).await;
                }
            }
        }
        debug!("Health loop stopped");
    }

    async fn run_sync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut mode_rx = self.health.subscribe_mode();
        let mut interval = tokio::time::interval(self.config.sync_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = mode_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let mode = *mode_rx.borrow_and_update();
                    if mode != Mode::Recovering {
                        continue;
                    }
                    info!("Primary recovered, draining fallback store");
                }
                _ = interval.tick() => {}
            }

            if *shutdown.borrow() {
                break;
            }
            self.drain_until_idle().await;
        }
        debug!("Sync loop stopped");
    }

    /// Run passes back to back while they make progress, so a recovery
    /// does not wait a full interval between batches.
    async fn drain_until_idle(&self) {
        loop {
            let report = match self.sync_now().await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "Drain pass failed");
                    return;
                }
            };
            if report.skipped || report.synced == 0 || report.residual == 0 || self.is_shutting_down() {
                return;
            }
        }
    }

    /// Stop the background loops and wait for them to exit.
    ///
    /// A drain pass in progress finishes the record it is replaying and
    /// stops; the rest stays pending in the fallback store.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }

        info!("Initiating failover engine shutdown...");
        let _ = self.state.send(EngineState::ShuttingDown);
        metrics::set_engine_state("shutting_down");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let pending = self.fallback.count_pending(None).await.unwrap_or(0);
        let _ = self.state.send(EngineState::Stopped);
        metrics::set_engine_state("stopped");
        info!(pending, mode = %self.mode(), "Failover engine shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailoverConfig;
    use crate::storage::memory::InMemoryStore;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempdir().unwrap();
        let config = FailoverConfig {
            fallback_path: dir.path().join("fb.db").to_string_lossy().to_string(),
            probe_interval_ms: 10,
            sync_interval_ms: 10,
            ..Default::default()
        };
        let engine = Arc::new(
            FailoverEngine::open(config, Arc::new(InMemoryStore::new())).await.unwrap(),
        );

        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(engine.start().is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.health.stats().last_probe_at.is_some());

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.tasks.lock().is_empty());

        // Idempotent
        engine.shutdown().await;
    }
}
