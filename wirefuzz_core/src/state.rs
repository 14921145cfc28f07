use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

/// Why a run stopped. The first reason recorded wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum StopReason {
    /// The configured run time elapsed.
    Timeout,
    /// The user interrupted the run.
    Interrupted,
    /// A crash oracle fired or the target became unreachable.
    TargetCrashed(String),
    /// The log monitor matched this line.
    LogMatch(String),
    /// A worker hit an unrecoverable error.
    WorkerFailed(String),
}

impl StopReason {
    /// Whether in-flight testcases should be written out as evidence.
    pub fn persists_evidence(&self) -> bool {
        matches!(self, StopReason::TargetCrashed(_) | StopReason::LogMatch(_))
    }
}

/// Stop state guarded by the run mutex.
#[derive(Debug, Default)]
pub struct StopControl {
    reason: Option<StopReason>,
}

impl StopControl {
    pub fn is_stopped(&self) -> bool {
        self.reason.is_some()
    }

    pub fn reason(&self) -> Option<&StopReason> {
        self.reason.as_ref()
    }

    /// Records `reason` unless the run is already stopping. Returns whether it was recorded.
    pub fn request(&mut self, reason: StopReason) -> bool {
        if self.reason.is_some() {
            return false;
        }
        info!(?reason, "stopping run");
        self.reason = Some(reason);
        true
    }
}

/// Counters published for progress reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub sent: u64,
    pub jettisoned: u64,
    pub paths: u64,
}

/// Final totals written at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub stats: RunStats,
    pub elapsed_secs: f64,
    pub stop_reason: Option<StopReason>,
}

impl RunSummary {
    pub fn write_json(&self, path: &Path) -> Result<(), anyhow::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize run summary: {}", e))?;
        std::fs::write(path, json)
            .map_err(|e| anyhow::anyhow!("Failed to write run summary to {:?}: {}", path, e))
    }
}

/// Process-wide state shared by the workers, the watchdog and the monitors.
///
/// Stopping and evidence persistence happen under one mutex. The counters are
/// observational and use relaxed atomics.
#[derive(Debug)]
pub struct RunState {
    control: Mutex<StopControl>,
    sent: AtomicU64,
    jettisoned: AtomicU64,
    paths: AtomicU64,
    started: Instant,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            control: Mutex::new(StopControl::default()),
            sent: AtomicU64::new(0),
            jettisoned: AtomicU64::new(0),
            paths: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Locks the stop state. A panicked holder does not poison the run.
    pub fn lock(&self) -> MutexGuard<'_, StopControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().is_stopped()
    }

    pub fn request_stop(&self, reason: StopReason) -> bool {
        self.lock().request(reason)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.lock().reason().cloned()
    }

    pub fn stopped_by_timeout(&self) -> bool {
        matches!(self.lock().reason(), Some(StopReason::Timeout))
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_jettisoned(&self) {
        self.jettisoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_path(&self) {
        self.paths.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            sent: self.sent.load(Ordering::Relaxed),
            jettisoned: self.jettisoned.load(Ordering::Relaxed),
            paths: self.paths.load(Ordering::Relaxed),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            stats: self.stats(),
            elapsed_secs: self.elapsed().as_secs_f64(),
            stop_reason: self.stop_reason(),
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
