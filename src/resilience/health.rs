// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary-store health monitoring and the mode state machine.
//!
//! ```text
//!            N consecutive failures              recovery_threshold successes
//!  Primary ─────────────────────────► Fallback ─────────────────────────────► Recovering
//!     ▲      (or a failed routed op)     ▲                                        │
//!     │                                  └──── N consecutive failures ────────────┤
//!     └─────────────────────── queue drained or stalled ─────────────────────────┘
//! ```
//!
//! Counters track *consecutive* outcomes only; an opposite outcome resets
//! them, so a flapping primary cannot bounce the mode on every probe.
//! Transitions are serialized under one lock and published on two channels:
//! a `watch` holding the current mode (wakes the sync loop) and a
//! `broadcast` of [`ModeChange`] events for external observers.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::FailoverConfig;
use crate::coordinator::{Mode, ModeChange};
use crate::metrics;
use crate::record::now_millis;
use crate::storage::traits::RecordStore;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

impl ProbeOutcome {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Snapshot of the monitor's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStats {
    pub mode: Mode,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Mode transitions since the monitor was created
    pub transitions: u64,
    pub last_probe_at: Option<i64>,
}

#[derive(Debug, Default)]
struct Counters {
    consecutive_failures: u32,
    consecutive_successes: u32,
    transitions: u64,
    last_probe_at: Option<i64>,
}

pub struct HealthMonitor {
    failure_threshold: u32,
    recovery_threshold: u32,
    probe_timeout: Duration,
    mode_tx: watch::Sender<Mode>,
    events: broadcast::Sender<ModeChange>,
    /// Guards counters and every mode transition
    counters: Mutex<Counters>,
    /// Lock for probes (prevent thundering herd)
    checking: tokio::sync::Mutex<()>,
}

impl HealthMonitor {
    /// Starts in [`Mode::Primary`]: assume healthy until proven otherwise.
    #[must_use]
    pub fn new(config: &FailoverConfig) -> Self {
        let (mode_tx, _) = watch::channel(Mode::Primary);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        metrics::set_mode(Mode::Primary);
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_threshold: config.recovery_threshold.max(1),
            probe_timeout: config.probe_timeout(),
            mode_tx,
            events,
            counters: Mutex::new(Counters::default()),
            checking: tokio::sync::Mutex::new(()),
        }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.mode_tx.borrow()
    }

    /// Watch the current mode. The receiver is notified on every transition.
    #[must_use]
    pub fn subscribe_mode(&self) -> watch::Receiver<Mode> {
        self.mode_tx.subscribe()
    }

    /// Subscribe to [`ModeChange`] events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ModeChange> {
        self.events.subscribe()
    }

    /// Cheap reachability check with a bounded timeout. Never errors.
    pub async fn probe(&self, store: &dyn RecordStore) -> ProbeOutcome {
        match tokio::time::timeout(self.probe_timeout, store.ping()).await {
            Ok(Ok(())) => ProbeOutcome::Healthy,
            Ok(Err(e)) => ProbeOutcome::Unhealthy(e.to_string()),
            Err(_) => ProbeOutcome::Unhealthy(format!(
                "probe timed out after {}ms",
                self.probe_timeout.as_millis()
            )),
        }
    }

    /// Probe the store and feed the outcome into the state machine.
    /// Returns the mode after the probe.
    pub async fn check(&self, store: &dyn RecordStore) -> Mode {
        let _guard = self.checking.lock().await;
        let outcome = self.probe(store).await;
        self.record_probe(&outcome)
    }

    /// Apply one probe outcome. Returns the mode afterwards.
    pub fn record_probe(&self, outcome: &ProbeOutcome) -> Mode {
        metrics::record_probe(outcome.is_healthy());
        let mut counters = self.counters.lock();
        counters.last_probe_at = Some(now_millis());
        let mode = self.mode();

        match outcome {
            ProbeOutcome::Healthy => {
                counters.consecutive_failures = 0;
                counters.consecutive_successes = counters.consecutive_successes.saturating_add(1);
                debug!(mode = %mode, successes = counters.consecutive_successes, "Primary probe healthy");

                if mode == Mode::Fallback && counters.consecutive_successes >= self.recovery_threshold {
                    let reason = format!(
                        "{} consecutive successful probes",
                        counters.consecutive_successes
                    );
                    counters.consecutive_successes = 0;
                    return self.transition(&mut counters, Mode::Recovering, reason);
                }
            }
            ProbeOutcome::Unhealthy(reason) => {
                counters.consecutive_successes = 0;
                counters.consecutive_failures = counters.consecutive_failures.saturating_add(1);
                warn!(
                    mode = %mode,
                    failures = counters.consecutive_failures,
                    threshold = self.failure_threshold,
                    error = %reason,
                    "Primary probe failed"
                );

                if mode != Mode::Fallback && counters.consecutive_failures >= self.failure_threshold {
                    let reason = format!(
                        "{} consecutive probe failures: {}",
                        counters.consecutive_failures, reason
                    );
                    counters.consecutive_failures = 0;
                    return self.transition(&mut counters, Mode::Fallback, reason);
                }
            }
        }
        mode
    }

    /// A routed operation against the primary failed: switch to fallback
    /// immediately instead of waiting for probes.
    pub fn report_primary_failure(&self, reason: &str) -> Mode {
        let mut counters = self.counters.lock();
        counters.consecutive_successes = 0;
        if self.mode() == Mode::Fallback {
            return Mode::Fallback;
        }
        counters.consecutive_failures = 0;
        self.transition(&mut counters, Mode::Fallback, format!("primary operation failed: {}", reason))
    }

    /// The sync engine finished (or gave up on) draining: Recovering → Primary.
    /// Returns false if the monitor was not recovering.
    pub fn complete_recovery(&self, reason: &str) -> bool {
        let mut counters = self.counters.lock();
        if self.mode() != Mode::Recovering {
            return false;
        }
        self.transition(&mut counters, Mode::Primary, reason.to_string());
        true
    }

    #[must_use]
    pub fn stats(&self) -> HealthStats {
        let counters = self.counters.lock();
        HealthStats {
            mode: self.mode(),
            consecutive_failures: counters.consecutive_failures,
            consecutive_successes: counters.consecutive_successes,
            transitions: counters.transitions,
            last_probe_at: counters.last_probe_at,
        }
    }

    // Caller holds the counters lock, which serializes transitions.
    fn transition(&self, counters: &mut Counters, to: Mode, reason: String) -> Mode {
        let from = self.mode_tx.send_replace(to);
        if from == to {
            return to;
        }
        counters.transitions += 1;

        info!(from = %from, to = %to, reason = %reason, "Mode transition");
        metrics::set_mode(to);
        metrics::record_transition(from, to);

        // No subscribers is fine
        let _ = self.events.send(ModeChange {
            from,
            mode: to,
            timestamp: now_millis(),
            reason,
        });
        to
    }
}
