// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the failover coordinator.

use serde::{Deserialize, Serialize};

/// Which store serves reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Primary is healthy; all traffic goes there
    Primary,
    /// Primary is unreachable; all traffic goes to the fallback store
    Fallback,
    /// Primary is back and the fallback queue is being drained into it.
    /// Writes still go to the fallback store; reads merge both.
    Recovering,
}

impl Mode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Recovering => "recovering",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "Primary"),
            Self::Fallback => write!(f, "Fallback"),
            Self::Recovering => write!(f, "Recovering"),
        }
    }
}

/// Emitted on every mode transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChange {
    pub from: Mode,
    pub mode: Mode,
    /// Epoch millis
    pub timestamp: i64,
    pub reason: String,
}

/// Engine lifecycle state.
///
/// Use [`super::FailoverEngine::state()`] to check the current state or
/// [`super::FailoverEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Background loops running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Background loops exited
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub pass_id: String,
    /// Kinds that had pending records
    pub kinds: usize,
    /// Records replayed and marked synced
    pub synced: usize,
    /// Failed replay attempts (including records that became failed)
    pub failed: usize,
    /// Records skipped because they were still backing off
    pub deferred: usize,
    /// Records written to the primary whose fallback row changed meanwhile
    pub partial: usize,
    /// Pending records left after the pass
    pub residual: u64,
    /// Set when the pass did not run (fallback mode or shutting down)
    pub skipped: bool,
}

impl DrainReport {
    /// True when nothing is left to replay.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        !self.skipped && self.residual == 0
    }
}

/// Where a routed write was persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WriteTarget {
    Primary,
    Fallback,
}

impl WriteTarget {
    pub(super) fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}
