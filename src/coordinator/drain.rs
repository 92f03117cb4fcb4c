// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Draining the fallback queue into the primary.
//!
//! A pass walks every kind with pending records (kinds in parallel, records
//! within a kind strictly oldest-first). Each record is resolved against the
//! primary's copy, written, and marked synced together with its audit entry.
//! A record that fails, or is still backing off, ends its kind's pass so
//! nothing queued after it reaches the primary first.

use futures::future::join_all;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::{DrainReport, FailoverEngine, Mode};
use crate::audit::{SyncLogEntry, SyncResult};
use crate::conflict::{self, ConflictOutcome};
use crate::metrics;
use crate::record::{now_millis, Record, SyncState};
use crate::storage::fallback::PendingRow;
use crate::storage::traits::StorageError;

/// Residual tracking used to decide when recovery is over.
#[derive(Debug, Default)]
pub(crate) struct DrainProgress {
    last_residual: Option<u64>,
    stalled_passes: u32,
    last_mode: Option<Mode>,
}

#[derive(Debug, Default, Clone, Copy)]
struct KindTally {
    synced: usize,
    failed: usize,
    deferred: usize,
    partial: usize,
}

enum Replayed {
    Synced,
    /// Primary holds the record but the fallback row could not be marked
    Partial,
}

impl FailoverEngine {
    /// Run one drain pass now. Passes are serialized; a pass requested
    /// while another runs waits for it.
    ///
    /// Skipped (and reported as such) in fallback mode or during shutdown.
    #[tracing::instrument(skip(self))]
    pub async fn sync_now(&self) -> Result<DrainReport, StorageError> {
        let mut progress = self.drain.lock().await;
        let pass_id = uuid::Uuid::new_v4().to_string();
        let mode = self.health.mode();

        if mode == Mode::Fallback || self.is_shutting_down() {
            debug!(mode = %mode, "Skipping drain pass");
            return Ok(DrainReport {
                pass_id,
                skipped: true,
                ..DrainReport::default()
            });
        }

        let start = Instant::now();
        let kinds = self.fallback.pending_kinds().await?;

        let tallies = join_all(kinds.iter().map(|kind| self.drain_kind(kind, &pass_id))).await;

        let mut report = DrainReport {
            pass_id,
            kinds: kinds.len(),
            ..DrainReport::default()
        };
        for tally in tallies {
            report.synced += tally.synced;
            report.failed += tally.failed;
            report.deferred += tally.deferred;
            report.partial += tally.partial;
        }

        let stats = self.fallback.stats().await?;
        report.residual = stats.pending;
        metrics::set_pending(stats.pending);
        metrics::set_failed(stats.failed);
        metrics::record_drain_pass(start.elapsed());

        if report.synced > 0 || report.failed > 0 {
            info!(
                pass_id = %report.pass_id,
                kinds = report.kinds,
                synced = report.synced,
                failed = report.failed,
                deferred = report.deferred,
                residual = report.residual,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Drain pass complete"
            );
        }

        self.after_pass(&mut progress, mode, &report).await;
        Ok(report)
    }

    /// Recovery ends when the queue is empty or stops shrinking.
    async fn after_pass(&self, progress: &mut DrainProgress, mode: Mode, report: &DrainReport) {
        if progress.last_mode != Some(mode) {
            progress.last_residual = None;
            progress.stalled_passes = 0;
            progress.last_mode = Some(mode);
        }

        progress.stalled_passes = match progress.last_residual {
            Some(last) if report.residual >= last => progress.stalled_passes + 1,
            _ => 0,
        };
        progress.last_residual = Some(report.residual);

        if report.residual == 0 && report.synced > 0 {
            if let Err(e) = self.fallback.checkpoint().await {
                warn!(error = %e, "Fallback checkpoint failed");
            }
        }

        if mode != Mode::Recovering {
            return;
        }

        let reason = if report.residual == 0 {
            "fallback queue drained".to_string()
        } else if progress.stalled_passes >= self.config.recovery_stall_passes {
            warn!(
                residual = report.residual,
                passes = progress.stalled_passes,
                "Fallback queue stopped shrinking, resuming primary mode with residual records"
            );
            format!(
                "{} pending records stalled for {} passes",
                report.residual, progress.stalled_passes
            )
        } else {
            return;
        };

        if self.health.complete_recovery(&reason) {
            progress.last_residual = None;
            progress.stalled_passes = 0;
            progress.last_mode = Some(Mode::Primary);
        }
    }

    async fn drain_kind(&self, kind: &str, pass_id: &str) -> KindTally {
        let mut tally = KindTally::default();

        let batch = match self.fallback.pending_rows(kind, self.config.sync_batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(kind, error = %e, "Failed to read pending records");
                return tally;
            }
        };

        let backoff = self.config.backoff();

        for row in batch {
            if self.is_shutting_down() || self.health.mode() == Mode::Fallback {
                break;
            }

            let record = match row {
                PendingRow::Ready(record) => record,
                PendingRow::Unreadable { id, kind, detail } => {
                    // Can never be replayed, so it does not hold back the kind
                    tally.failed += 1;
                    self.fail_unreadable(&id, &kind, &detail, pass_id).await;
                    continue;
                }
            };

            if !backoff.is_eligible(record.sync_attempts, record.last_attempt_at, now_millis()) {
                debug!(id = %record.id, kind, attempts = record.sync_attempts, "Record still backing off");
                tally.deferred += 1;
                metrics::record_sync(kind, "deferred");
                break;
            }

            match self.replay(&record, pass_id).await {
                Ok(Replayed::Synced) => {
                    tally.synced += 1;
                    metrics::record_sync(kind, "success");
                }
                Ok(Replayed::Partial) => {
                    tally.partial += 1;
                    metrics::record_sync(kind, "partial");
                }
                Err(e) => {
                    tally.failed += 1;
                    self.handle_replay_failure(&record, &e, pass_id).await;
                    break;
                }
            }
        }

        tally
    }

    /// Resolve against the primary copy, write the winner, mark synced.
    /// Errors are primary-side failures; local bookkeeping problems come
    /// back as [`Replayed::Partial`].
    async fn replay(&self, pending: &Record, pass_id: &str) -> Result<Replayed, StorageError> {
        let existing = self
            .primary_call("sync_get", self.primary.get(&pending.id))
            .await?;

        let (resolved, needs_write) = match existing {
            None => (pending.clone(), true),
            Some(primary_copy) => {
                let resolution = conflict::resolve(&primary_copy, pending);
                metrics::record_conflict(resolution.outcome.as_str());
                if resolution.outcome != ConflictOutcome::FallbackNewer {
                    debug!(
                        id = %pending.id,
                        outcome = resolution.outcome.as_str(),
                        "Primary copy kept or merged"
                    );
                }
                let already_held = resolution.record.same_content(&primary_copy)
                    && resolution.record.updated_at == primary_copy.updated_at
                    && resolution.record.created_at == primary_copy.created_at;
                (resolution.record, !already_held)
            }
        };

        if needs_write {
            self.primary_call("sync_insert", self.primary.insert(&resolved))
                .await?;
        }

        let detail = match self.fallback.complete_sync(pending, &resolved, pass_id).await {
            Ok(true) => {
                debug!(id = %pending.id, kind = %pending.kind, "Record synced");
                return Ok(Replayed::Synced);
            }
            Ok(false) => "fallback row changed during replay".to_string(),
            Err(e) => {
                warn!(id = %pending.id, error = %e, "Failed to mark record synced");
                e.to_string()
            }
        };

        let entry = SyncLogEntry::new(pending, SyncResult::Partial, pass_id).with_error(detail);
        if let Err(e) = self.fallback.append_sync_log(&entry).await {
            warn!(id = %pending.id, error = %e, "Failed to append partial sync entry");
        }
        Ok(Replayed::Partial)
    }

    async fn fail_unreadable(&self, id: &str, kind: &str, detail: &str, pass_id: &str) {
        match self.fallback.fail_unreadable(id, kind, detail, pass_id).await {
            Ok(Some(_)) => {
                error!(id, kind, error = %detail, "Unreadable fallback record marked failed");
                metrics::record_corruption("fallback");
                metrics::record_sync(kind, "failed");
            }
            Ok(None) => {
                debug!(id, "Record no longer pending, failure not recorded");
            }
            Err(e) => {
                error!(id, error = %e, "Failed to record unreadable fallback record");
            }
        }
    }

    async fn handle_replay_failure(&self, record: &Record, err: &StorageError, pass_id: &str) {
        let detail = err.to_string();
        let outcome = self
            .fallback
            .record_sync_failure(record, &detail, self.config.max_sync_attempts, pass_id)
            .await;

        match outcome {
            Ok(Some(outcome)) if outcome.state == SyncState::Failed => {
                error!(
                    id = %record.id,
                    kind = %record.kind,
                    attempts = outcome.attempts,
                    error = %detail,
                    "Record exhausted its retry budget, marked failed"
                );
                metrics::record_sync(&record.kind, "failed");
            }
            Ok(Some(outcome)) => {
                warn!(
                    id = %record.id,
                    kind = %record.kind,
                    attempts = outcome.attempts,
                    retry_in_ms = self.config.backoff().delay_for(outcome.attempts).as_millis() as u64,
                    error = %detail,
                    "Replay failed, will retry"
                );
                metrics::record_sync(&record.kind, "retry");
            }
            Ok(None) => {
                debug!(id = %record.id, "Record no longer pending, failure not recorded");
            }
            Err(e) => {
                error!(id = %record.id, error = %e, "Failed to record replay failure");
            }
        }
    }
}
