//! In-process counters for the task controller and the upload/download
//! engines (§5, task controller metrics_interval).
//!
//! Grounded in the reference node's `PerformanceMonitor`/`OperationTimer`
//! (`performance.rs`): a shared `Mutex`-guarded map of running totals plus an
//! RAII timer that records on drop, logged through `tracing` rather than
//! pushed to an external collector (no metrics exporter crate appears
//! anywhere in the corpus, so this stays in-process).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct PriorityStats {
    pub count: u64,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Default)]
struct Totals {
    submitted: u64,
    completed: u64,
    failed: u64,
    retried: u64,
    total_duration_ms: u64,
    min_duration_ms: Option<u64>,
    max_duration_ms: Option<u64>,
    by_priority: HashMap<String, PriorityStats>,
    by_error_kind: HashMap<String, u64>,
}

/// Snapshot returned to callers; independent of the live `Totals` so readers
/// never block a writer mid-update.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub queue_len: usize,
    pub by_priority: HashMap<String, PriorityStats>,
    pub by_error_kind: HashMap<String, u64>,
}

/// Shared metrics sink for a single task controller instance.
#[derive(Clone)]
pub struct TaskMetrics {
    totals: Arc<Mutex<Totals>>,
}

impl TaskMetrics {
    pub fn new() -> Self {
        Self {
            totals: Arc::new(Mutex::new(Totals::default())),
        }
    }

    pub fn record_submitted(&self, priority: &str) {
        let mut t = self.totals.lock().unwrap();
        t.submitted += 1;
        t.by_priority.entry(priority.to_string()).or_default().count += 1;
    }

    pub fn record_retry(&self) {
        self.totals.lock().unwrap().retried += 1;
    }

    pub fn record_completed(&self, priority: &str, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let mut t = self.totals.lock().unwrap();
        t.completed += 1;
        t.total_duration_ms += ms;
        t.min_duration_ms = Some(t.min_duration_ms.map_or(ms, |m| m.min(ms)));
        t.max_duration_ms = Some(t.max_duration_ms.map_or(ms, |m| m.max(ms)));
        t.by_priority
            .entry(priority.to_string())
            .or_default()
            .total_duration_ms += ms;
        debug!(priority, duration_ms = ms, "task completed");
    }

    pub fn record_failed(&self, error_kind: &str) {
        let mut t = self.totals.lock().unwrap();
        t.failed += 1;
        *t.by_error_kind.entry(error_kind.to_string()).or_insert(0) += 1;
        debug!(error_kind, "task failed");
    }

    pub fn snapshot(&self, queue_len: usize) -> MetricsSnapshot {
        let t = self.totals.lock().unwrap();
        let avg = if t.completed > 0 {
            t.total_duration_ms as f64 / t.completed as f64
        } else {
            0.0
        };
        MetricsSnapshot {
            submitted: t.submitted,
            completed: t.completed,
            failed: t.failed,
            retried: t.retried,
            avg_duration_ms: avg,
            min_duration_ms: t.min_duration_ms.unwrap_or(0),
            max_duration_ms: t.max_duration_ms.unwrap_or(0),
            queue_len,
            by_priority: t.by_priority.clone(),
            by_error_kind: t.by_error_kind.clone(),
        }
    }

}

impl Default for TaskMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII timer: records completion or failure depending on which method is
/// called, or records nothing if simply dropped (caller bailed early).
pub struct OperationTimer {
    priority: String,
    start: Instant,
    metrics: TaskMetrics,
}

impl TaskMetrics {
    pub fn start_operation(&self, priority: &str) -> OperationTimer {
        OperationTimer {
            priority: priority.to_string(),
            start: Instant::now(),
            metrics: self.clone(),
        }
    }
}

impl OperationTimer {
    pub fn success(self) {
        self.metrics
            .record_completed(&self.priority, self.start.elapsed());
    }

    pub fn failure(self, error_kind: &str) {
        self.metrics.record_failed(error_kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_completed_and_failed_counts() {
        let metrics = TaskMetrics::new();
        metrics.record_submitted("normal");
        metrics.record_completed("normal", Duration::from_millis(50));
        metrics.record_submitted("high");
        metrics.record_failed("timeout");

        let snap = metrics.snapshot(3);
        assert_eq!(snap.submitted, 2);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.queue_len, 3);
        assert_eq!(snap.by_error_kind.get("timeout"), Some(&1));
    }

    #[test]
    fn operation_timer_records_on_success() {
        let metrics = TaskMetrics::new();
        let timer = metrics.start_operation("normal");
        timer.success();
        let snap = metrics.snapshot(0);
        assert_eq!(snap.completed, 1);
    }
}
