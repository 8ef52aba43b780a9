//! Generic bounded worker pool (C6) the upload and download engines submit
//! per-file work to instead of spawning tasks directly.
//!
//! Grounded in `resilience.rs`'s `retry_async`/`with_timeout` (the retry and
//! timeout discipline here reuses that classification through
//! `MeshError::retryable`/`timeout`) and `concurrent_chunks.rs`'s
//! semaphore-bounded worker pattern, generalized from "N concurrent chunk
//! fetches" to "N concurrent tasks of any kind, priority-ordered, with
//! retries and a drain-on-shutdown path".

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::TaskControllerConfig;
use crate::error::{MeshError, MeshResult};
use crate::metrics::TaskMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl TaskPriority {
    fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub attempts: u32,
    pub created_at: Instant,
    pub error_message: Option<String>,
}

pub type TaskFuture = Pin<Box<dyn Future<Output = MeshResult<()>> + Send>>;
pub type TaskHandler = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

struct QueueItem {
    task_id: String,
    priority: TaskPriority,
    seq: u64,
    attempt: u32,
    handler: TaskHandler,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueItem {}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; among equal priorities, earlier submission first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    config: TaskControllerConfig,
    metrics: TaskMetrics,
    tasks: Mutex<HashMap<String, TaskRecord>>,
    queue: Mutex<BinaryHeap<QueueItem>>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<TaskStatus>>>>,
    notify: Notify,
    seq: AtomicU64,
    active_workers: AtomicU64,
    shutting_down: AtomicBool,
}

/// A running worker pool. Cloning shares the same queue and workers.
#[derive(Clone)]
pub struct TaskController {
    inner: Arc<Inner>,
}

impl TaskController {
    pub fn start(config: TaskControllerConfig, metrics: TaskMetrics) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BinaryHeap::new()),
            tasks: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            metrics,
            config,
        });

        for worker_id in 0..inner.config.max_workers {
            let inner = inner.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, inner).await;
            });
        }

        let cleanup_inner = inner.clone();
        tokio::spawn(async move {
            cleanup_loop(cleanup_inner).await;
        });

        TaskController { inner }
    }

    /// Reject duplicate `task_id`s (§4.6) and full queues with `SystemBusy`.
    pub async fn submit(
        &self,
        task_id: &str,
        priority: TaskPriority,
        handler: TaskHandler,
    ) -> MeshResult<()> {
        {
            let tasks = self.inner.tasks.lock().await;
            if tasks.contains_key(task_id) {
                return Err(MeshError::AlreadyExists(format!(
                    "task {task_id} already submitted"
                )));
            }
        }

        {
            let queue = self.inner.queue.lock().await;
            if queue.len() >= self.inner.config.queue_size {
                return Err(MeshError::SystemBusy(format!(
                    "task queue full ({} pending)",
                    queue.len()
                )));
            }
        }

        self.inner.tasks.lock().await.insert(
            task_id.to_string(),
            TaskRecord {
                task_id: task_id.to_string(),
                priority,
                status: TaskStatus::Pending,
                attempts: 0,
                created_at: Instant::now(),
                error_message: None,
            },
        );
        self.inner.metrics.record_submitted(priority.as_str());

        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.queue.lock().await.push(QueueItem {
            task_id: task_id.to_string(),
            priority,
            seq,
            attempt: 0,
            handler,
        });
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Submit and block the caller until the task reaches a terminal status.
    pub async fn submit_and_wait(
        &self,
        task_id: &str,
        priority: TaskPriority,
        handler: TaskHandler,
    ) -> MeshResult<TaskStatus> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .waiters
            .lock()
            .await
            .entry(task_id.to_string())
            .or_default()
            .push(tx);
        self.submit(task_id, priority, handler).await?;
        rx.await
            .map_err(|_| MeshError::TaskCanceled(task_id.to_string()))
    }

    pub async fn query(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner.tasks.lock().await.get(task_id).cloned()
    }

    /// Cancel a task that hasn't started running yet. Running tasks finish
    /// naturally; cancellation only prevents a not-yet-started attempt.
    pub async fn cancel(&self, task_id: &str) -> MeshResult<()> {
        let mut tasks = self.inner.tasks.lock().await;
        match tasks.get_mut(task_id) {
            Some(record) if record.status == TaskStatus::Pending => {
                record.status = TaskStatus::Cancelled;
                Ok(())
            }
            Some(_) => Err(MeshError::Generic(format!(
                "task {task_id} is no longer pending"
            ))),
            None => Err(MeshError::NotFound(format!("task {task_id} not found"))),
        }
    }

    /// Stop accepting the possibility of further progress and wait up to
    /// `shutdown_timeout_secs` for in-flight work to drain.
    pub async fn shutdown(&self) -> MeshResult<()> {
        self.inner.shutting_down.store(true, AtomicOrdering::SeqCst);
        self.inner.notify.notify_waiters();

        let deadline = Instant::now() + Duration::from_secs(self.inner.config.shutdown_timeout_secs);
        loop {
            let queue_empty = self.inner.queue.lock().await.is_empty();
            let active = self.inner.active_workers.load(AtomicOrdering::SeqCst);
            if queue_empty && active == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(MeshError::SystemBusy(format!(
                    "{active} task(s) still active at shutdown"
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn metrics_snapshot(&self) -> crate::metrics::MetricsSnapshot {
        let queue_len = self.inner.queue.lock().await.len();
        self.inner.metrics.snapshot(queue_len)
    }
}

async fn worker_loop(worker_id: usize, inner: Arc<Inner>) {
    debug!(worker_id, "task controller worker started");
    loop {
        let item = {
            let mut queue = inner.queue.lock().await;
            queue.pop()
        };

        let item = match item {
            Some(item) => item,
            None => {
                if inner.shutting_down.load(AtomicOrdering::SeqCst) {
                    break;
                }
                inner.notify.notified().await;
                continue;
            }
        };

        {
            let mut tasks = inner.tasks.lock().await;
            match tasks.get(&item.task_id) {
                Some(record) if record.status == TaskStatus::Cancelled => continue,
                None => continue,
                _ => {}
            }
            if let Some(record) = tasks.get_mut(&item.task_id) {
                record.status = TaskStatus::Running;
                record.attempts = item.attempt + 1;
            }
        }

        inner.active_workers.fetch_add(1, AtomicOrdering::SeqCst);
        let timer = inner.metrics.start_operation(item.priority.as_str());
        let timeout = Duration::from_secs(inner.config.task_timeout_secs);
        let result = tokio::time::timeout(timeout, (item.handler)()).await;
        inner.active_workers.fetch_sub(1, AtomicOrdering::SeqCst);

        match result {
            Ok(Ok(())) => {
                timer.success();
                finish(&inner, &item.task_id, TaskStatus::Completed, None).await;
            }
            Ok(Err(e)) => {
                timer.failure(error_kind(&e));
                handle_failure(&inner, item, Some(e)).await;
            }
            Err(_) => {
                timer.failure("timeout");
                let err = MeshError::TaskTimeout(item.task_id.clone());
                handle_failure(&inner, item, Some(err)).await;
            }
        }
    }
    debug!(worker_id, "task controller worker stopped");
}

async fn handle_failure(inner: &Arc<Inner>, item: QueueItem, error: Option<MeshError>) {
    let retryable = error.as_ref().map(|e| e.retryable()).unwrap_or(false);
    let attempt = item.attempt + 1;

    if retryable && attempt < inner.config.retry_times as u32 {
        inner.metrics.record_retry();
        warn!(
            task_id = %item.task_id,
            attempt,
            "task failed, retrying"
        );
        {
            let mut tasks = inner.tasks.lock().await;
            if let Some(record) = tasks.get_mut(&item.task_id) {
                record.status = TaskStatus::Pending;
            }
        }
        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;

        let seq = inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        inner.queue.lock().await.push(QueueItem {
            task_id: item.task_id,
            priority: item.priority,
            seq,
            attempt,
            handler: item.handler,
        });
        inner.notify.notify_one();
        return;
    }

    let message = error.map(|e| e.to_string());
    finish(inner, &item.task_id, TaskStatus::Failed, message).await;
}

async fn finish(
    inner: &Arc<Inner>,
    task_id: &str,
    status: TaskStatus,
    error_message: Option<String>,
) {
    {
        let mut tasks = inner.tasks.lock().await;
        if let Some(record) = tasks.get_mut(task_id) {
            record.status = status;
            record.error_message = error_message;
        }
    }
    if let Some(waiters) = inner.waiters.lock().await.remove(task_id) {
        for tx in waiters {
            let _ = tx.send(status);
        }
    }
}

fn error_kind(error: &MeshError) -> &'static str {
    match error {
        MeshError::Io(_) => "io",
        MeshError::Transport(_) => "transport",
        MeshError::NotFound(_) => "not_found",
        MeshError::AlreadyExists(_) => "already_exists",
        MeshError::Corrupt(_) => "corrupt",
        MeshError::InsufficientShards(_) => "insufficient_shards",
        MeshError::Signature(_) => "signature",
        MeshError::Script(_) => "script",
        MeshError::TaskCanceled(_) => "task_canceled",
        MeshError::TaskTimeout(_) => "task_timeout",
        MeshError::SystemBusy(_) => "system_busy",
        MeshError::Store(_) => "store",
        MeshError::Crypto(_) => "crypto",
        MeshError::Serialization(_) => "serialization",
        MeshError::Config(_) => "config",
        MeshError::Generic(_) => "generic",
    }
}

async fn cleanup_loop(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(Duration::from_secs(
        inner.config.cleanup_interval_secs.max(1),
    ));
    loop {
        interval.tick().await;
        if inner.shutting_down.load(AtomicOrdering::SeqCst) {
            break;
        }
        let retention = Duration::from_secs(inner.config.cleanup_interval_secs.max(1) * 2);
        let mut tasks = inner.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, record| {
            let terminal = matches!(
                record.status,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            );
            !terminal || record.created_at.elapsed() < retention
        });
        let removed = before - tasks.len();
        if removed > 0 {
            info!(removed, "task controller cleaned up stale task records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn test_config() -> TaskControllerConfig {
        TaskControllerConfig {
            max_workers: 2,
            min_workers: 1,
            queue_size: 16,
            retry_times: 2,
            task_timeout_secs: 5,
            shutdown_timeout_secs: 5,
            metrics_interval_secs: 60,
            cleanup_interval_secs: 3600,
            max_concurrent_uploads: 4,
            max_concurrent_downloads: 4,
        }
    }

    #[tokio::test]
    async fn submitted_task_completes() {
        let controller = TaskController::start(test_config(), TaskMetrics::new());
        let status = controller
            .submit_and_wait(
                "t1",
                TaskPriority::Normal,
                Arc::new(|| Box::pin(async { Ok(()) })),
            )
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_task_id_is_rejected() {
        let controller = TaskController::start(test_config(), TaskMetrics::new());
        controller
            .submit(
                "t1",
                TaskPriority::Normal,
                Arc::new(|| Box::pin(async { Ok(()) })),
            )
            .await
            .unwrap();
        let result = controller
            .submit(
                "t1",
                TaskPriority::Normal,
                Arc::new(|| Box::pin(async { Ok(()) })),
            )
            .await;
        assert!(matches!(result, Err(MeshError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn failed_task_retries_then_completes() {
        let controller = TaskController::start(test_config(), TaskMetrics::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let handler: TaskHandler = Arc::new(move || {
            let attempts = attempts_clone.clone();
            Box::pin(async move {
                let n = attempts.fetch_add(1, AtomicOrdering::SeqCst);
                if n < 1 {
                    Err(MeshError::Transport("flaky".to_string()))
                } else {
                    Ok(())
                }
            })
        });
        let status = controller
            .submit_and_wait("t1", TaskPriority::High, handler)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal() {
        let controller = TaskController::start(test_config(), TaskMetrics::new());
        let status = controller
            .submit_and_wait(
                "t1",
                TaskPriority::Normal,
                Arc::new(|| Box::pin(async { Err(MeshError::Corrupt("bad data".to_string())) })),
            )
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn shutdown_drains_cleanly_with_no_pending_work() {
        let controller = TaskController::start(test_config(), TaskMetrics::new());
        controller.shutdown().await.unwrap();
    }
}
