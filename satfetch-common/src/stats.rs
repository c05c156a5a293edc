//! Per-source attempt statistics.
//!
//! One [`StatsTracker`] is owned by each source and by the fallback
//! orchestrator. [`StatsTracker::update`] is the only mutation point and runs
//! under a single lock, so concurrent callers never lose an update. Every
//! 10th cumulative attempt logs a summary; every 5th cumulative failure hands
//! a snapshot to the diagnostics hook on a detached task.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::ErrorKind;

pub const ATTEMPT_HISTORY_CAP: usize = 50;
pub const ERROR_HISTORY_CAP: usize = 20;
const STATS_LOG_INTERVAL: u64 = 10;
const DIAGNOSTICS_INTERVAL: u64 = 5;

/// Outcome of one attempt against one source.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub success: bool,
    pub elapsed: Duration,
    pub bytes: u64,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn success(elapsed: Duration, bytes: u64) -> Self {
        Self {
            success: true,
            elapsed,
            bytes,
            error_kind: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(elapsed: Duration, kind: Option<ErrorKind>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            elapsed,
            bytes: 0,
            error_kind: kind,
            message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub total_time: Duration,
    pub total_bytes: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Derived figures for ordering and reporting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceMetrics {
    /// Successes over attempts; 0 when nothing was attempted.
    pub success_rate: f64,
    /// Mean wall time per attempt, successful or not.
    pub avg_time: Duration,
    /// Bytes per second across successful attempts.
    pub throughput: f64,
}

impl SourceMetrics {
    pub fn failure_rate(&self, attempts: u64) -> f64 {
        if attempts == 0 {
            0.0
        } else {
            1.0 - self.success_rate
        }
    }
}

/// Snapshot handed to the diagnostics hook.
#[derive(Debug, Clone)]
pub struct DiagnosticsTrigger {
    pub source: String,
    pub total_failures: u64,
    pub recent_errors: Vec<AttemptRecord>,
}

/// Advisory collector run when failures pile up. Must not panic; its result is ignored.
#[async_trait::async_trait]
pub trait DiagnosticsHook: Send + Sync {
    async fn collect(&self, trigger: DiagnosticsTrigger);
}

#[derive(Debug, Default)]
struct SourceEntry {
    stats: SourceStats,
    history: VecDeque<AttemptRecord>,
    errors: VecDeque<AttemptRecord>,
    success_time: Duration,
    success_bytes: u64,
}

#[derive(Debug, Default)]
struct TrackerState {
    sources: HashMap<String, SourceEntry>,
    total_attempts: u64,
    total_failures: u64,
}

pub struct StatsTracker {
    state: Mutex<TrackerState>,
    attempt_cap: usize,
    error_cap: usize,
    diagnostics: Option<Arc<dyn DiagnosticsHook>>,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::with_caps(ATTEMPT_HISTORY_CAP, ERROR_HISTORY_CAP)
    }

    pub fn with_caps(attempt_cap: usize, error_cap: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            attempt_cap: attempt_cap.max(1),
            error_cap: error_cap.max(1),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, hook: Arc<dyn DiagnosticsHook>) -> Self {
        self.diagnostics = Some(hook);
        self
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one attempt for `source`.
    pub fn update(&self, source: &str, record: AttemptRecord) {
        let mut summary = None;
        let mut trigger = None;
        {
            let mut state = self.lock();
            state.total_attempts += 1;
            if !record.success {
                state.total_failures += 1;
            }
            let total_attempts = state.total_attempts;
            let total_failures = state.total_failures;

            let entry = state.sources.entry(source.to_string()).or_default();
            let stats = &mut entry.stats;
            stats.attempts += 1;
            stats.total_time += record.elapsed;
            stats.total_bytes += record.bytes;
            if record.success {
                stats.successes += 1;
                stats.consecutive_failures = 0;
                stats.last_success_at = Some(record.timestamp);
                entry.success_time += record.elapsed;
                entry.success_bytes += record.bytes;
            } else {
                stats.failures += 1;
                stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
                stats.last_failure_at = Some(record.timestamp);
                if entry.errors.len() == self.error_cap {
                    entry.errors.pop_front();
                }
                entry.errors.push_back(record.clone());
            }
            let failed = !record.success;
            if entry.history.len() == self.attempt_cap {
                entry.history.pop_front();
            }
            entry.history.push_back(record);

            if failed && total_failures % DIAGNOSTICS_INTERVAL == 0 {
                trigger = Some(DiagnosticsTrigger {
                    source: source.to_string(),
                    total_failures,
                    recent_errors: entry.errors.iter().cloned().collect(),
                });
            }
            if total_attempts % STATS_LOG_INTERVAL == 0 {
                summary = Some(summarize(&state.sources));
            }
        }

        if let Some(summary) = summary {
            info!(summary = %summary, "Source statistics");
        }
        if let Some(trigger) = trigger {
            self.spawn_diagnostics(trigger);
        }
    }

    fn spawn_diagnostics(&self, trigger: DiagnosticsTrigger) {
        let Some(hook) = self.diagnostics.clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { hook.collect(trigger).await });
            }
            Err(_) => debug!(source = %trigger.source, "No runtime, skipping diagnostics"),
        }
    }

    pub fn stats(&self, source: &str) -> Option<SourceStats> {
        self.lock().sources.get(source).map(|e| e.stats.clone())
    }

    pub fn history(&self, source: &str) -> Vec<AttemptRecord> {
        self.lock()
            .sources
            .get(source)
            .map(|e| e.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn recent_errors(&self, source: &str) -> Vec<AttemptRecord> {
        self.lock()
            .sources
            .get(source)
            .map(|e| e.errors.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn metrics(&self, source: &str) -> SourceMetrics {
        let state = self.lock();
        match state.sources.get(source) {
            Some(entry) => metrics_for(entry),
            None => SourceMetrics {
                success_rate: 0.0,
                avg_time: Duration::ZERO,
                throughput: 0.0,
            },
        }
    }

    /// Clear one source, or everything when `source` is `None`.
    pub fn reset(&self, source: Option<&str>) {
        let mut state = self.lock();
        match source {
            Some(name) => {
                state.sources.remove(name);
            }
            None => *state = TrackerState::default(),
        }
    }

    pub fn total_attempts(&self) -> u64 {
        self.lock().total_attempts
    }
}

fn metrics_for(entry: &SourceEntry) -> SourceMetrics {
    let stats = &entry.stats;
    if stats.attempts == 0 {
        return SourceMetrics {
            success_rate: 0.0,
            avg_time: Duration::ZERO,
            throughput: 0.0,
        };
    }
    let success_secs = entry.success_time.as_secs_f64();
    SourceMetrics {
        success_rate: stats.successes as f64 / stats.attempts as f64,
        avg_time: stats.total_time.div_f64(stats.attempts as f64),
        throughput: if success_secs > 0.0 {
            entry.success_bytes as f64 / success_secs
        } else {
            0.0
        },
    }
}

fn summarize(sources: &HashMap<String, SourceEntry>) -> String {
    let mut names: Vec<&String> = sources.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let entry = &sources[name];
            let m = metrics_for(entry);
            format!(
                "{name}: {}/{} ok ({:.0}%), avg {:.2}s, {:.1} KiB/s, {} consecutive failures",
                entry.stats.successes,
                entry.stats.attempts,
                m.success_rate * 100.0,
                m.avg_time.as_secs_f64(),
                m.throughput / 1024.0,
                entry.stats.consecutive_failures
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}
