//! Per-task sync progress, shared between the running strategy and
//! status queries.

use std::sync::RwLock;
use std::time::Instant;

use chrono::{DateTime, Utc};

/// A point-in-time view of a running task.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub phase: String,
    pub processed_rows: u64,
    pub error_rows: u64,
    /// Rows per second since the run started.
    pub speed: f64,
    pub updated_at: DateTime<Utc>,
}

struct ProgressState {
    phase: String,
    processed_rows: u64,
    error_rows: u64,
    updated_at: DateTime<Utc>,
}

/// Mutable progress for one running task. One instance per run; the
/// engine holds it in the running map, the strategy updates it.
pub struct SyncProgress {
    started: Instant,
    state: RwLock<ProgressState>,
}

impl SyncProgress {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            state: RwLock::new(ProgressState {
                phase: "starting".to_owned(),
                processed_rows: 0,
                error_rows: 0,
                updated_at: Utc::now(),
            }),
        }
    }

    /// Set the current phase string.
    pub fn set_phase(&self, phase: impl Into<String>) {
        let mut state = self.state.write().expect("progress lock poisoned");
        state.phase = phase.into();
        state.updated_at = Utc::now();
    }

    /// Add processed and errored row counts.
    pub fn add_rows(&self, processed: u64, errored: u64) {
        let mut state = self.state.write().expect("progress lock poisoned");
        state.processed_rows += processed;
        state.error_rows += errored;
        state.updated_at = Utc::now();
    }

    /// Snapshot the current progress, computing speed from elapsed time.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.read().expect("progress lock poisoned");
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            state.processed_rows as f64 / elapsed
        } else {
            0.0
        };
        ProgressSnapshot {
            phase: state.phase.clone(),
            processed_rows: state.processed_rows,
            error_rows: state.error_rows,
            speed,
            updated_at: state.updated_at,
        }
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}
