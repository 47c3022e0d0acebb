//! Registering worker pool
//!
//! Workers join at any time through [`WorkerPool::register_worker`]; each
//! gets its own dispatch loop pulling from one shared task queue. Failed
//! attempts are put back on the queue until the retry policy gives up.

use chrono::{DateTime, Utc};
use flotilla_core::{
    AttemptRecord, CloseableQueue, ClosedError, ResultSlot, RunError, TaskSnapshot, TryNext,
};
use flotilla_resilience::{ExitAction, RetryDecision, RetryPolicy, Scope, Scoped};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::output_dir::RUN_SUMMARY_FILE;
use crate::summary::format_jobs_summary;
use crate::task::{TaskInvocation, TaskResult};
use crate::worker::Worker;

const POOL_RESOURCE: &str = "worker pool";

#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    pub retry: RetryPolicy,
    /// Directory receiving `run_summary.txt` after every `map`
    pub output_dir: Option<PathBuf>,
}

impl PoolOptions {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            retry: RetryPolicy::new(max_attempts),
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Default)]
struct EntryState {
    worker_name: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    attempts: Vec<AttemptRecord>,
}

/// One mapped task. Only the dispatch loop currently holding the entry
/// mutates its state.
struct TaskEntry {
    invocation: TaskInvocation,
    description: String,
    state: Mutex<EntryState>,
    slot: ResultSlot<TaskResult>,
}

impl TaskEntry {
    fn new(invocation: TaskInvocation) -> Arc<Self> {
        Arc::new(Self {
            description: invocation.description(),
            invocation,
            state: Mutex::new(EntryState::default()),
            slot: ResultSlot::new(),
        })
    }

    fn claim(&self, worker: &str) {
        let mut state = self.state.lock();
        state.worker_name = Some(worker.to_string());
        state.start_time = Some(Utc::now());
    }

    /// Record a failed attempt and release the entry. Returns the number of
    /// failed attempts so far.
    fn record_failure(&self, error: &RunError) -> usize {
        let mut state = self.state.lock();
        let record = AttemptRecord {
            worker_name: state.worker_name.take().unwrap_or_default(),
            start_time: state.start_time.take(),
            error: error.to_string(),
        };
        state.attempts.push(record);
        state.attempts.len()
    }

    fn resolve(&self, result: TaskResult) {
        if result.is_ok() {
            self.state.lock().end_time = Some(Utc::now());
        }
        if self.slot.set(result).is_err() {
            warn!("Result for task {} was already set", self.description);
        }
    }

    fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock();
        TaskSnapshot {
            description: self.description.clone(),
            worker_name: state.worker_name.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
            attempts: state.attempts.clone(),
            resolved: self.slot.is_set(),
        }
    }
}

struct PoolInner {
    tasks: CloseableQueue<Arc<TaskEntry>>,
    dispatchers: CloseableQueue<JoinHandle<()>>,
    batches: Mutex<Vec<Vec<Arc<TaskEntry>>>>,
    active_workers: AtomicUsize,
    retry: RetryPolicy,
    output_dir: Option<PathBuf>,
}

impl PoolInner {
    fn stop_accepting(&self) {
        self.dispatchers.close();
        self.tasks.close();
    }

    async fn join_dispatchers(&self) -> anyhow::Result<()> {
        let mut failed = 0;
        while let Some(handle) = self.dispatchers.next().await {
            if let Err(e) = handle.await {
                warn!("Dispatch loop ended abnormally: {}", e);
                failed += 1;
            }
        }
        if failed > 0 {
            anyhow::bail!("{} dispatch loops ended abnormally", failed);
        }
        Ok(())
    }

    /// Entries nobody picked up before the pool closed
    fn abandon_queued(&self) {
        let mut abandoned = 0;
        while let TryNext::Item(entry) = self.tasks.try_next() {
            entry.resolve(Err(ClosedError::new(POOL_RESOURCE).into()));
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!("{} tasks were never run before the pool closed", abandoned);
        }
    }
}

async fn dispatch_loop(inner: Arc<PoolInner>, worker: Arc<dyn Worker>) {
    let name = worker.name().to_string();
    inner.active_workers.fetch_add(1, Ordering::SeqCst);
    info!(worker = %name, "Worker joined the pool");

    while let Some(entry) = inner.tasks.next().await {
        entry.claim(&name);
        debug!(worker = %name, "Running task {}", entry.description);

        let error = match worker.run(&entry.invocation).await {
            Ok(value) => {
                entry.resolve(Ok(value));
                continue;
            }
            Err(error) => error,
        };

        let attempts = entry.record_failure(&error);
        match inner.retry.decide(&error, attempts) {
            RetryDecision::Requeue => {
                info!(worker = %name, attempt = attempts, "Task {} failed, requeueing: {}", entry.description, error);
                if let Err(closed) = inner.tasks.put(entry.clone()) {
                    entry.resolve(Err(closed.into()));
                }
            }
            RetryDecision::GiveUp => {
                warn!(worker = %name, attempt = attempts, "Task {} failed: {}", entry.description, error);
                entry.resolve(Err(error.clone()));
            }
        }

        if error.disables_worker() {
            warn!(worker = %name, "Removing worker from the pool: {}", error);
            break;
        }
    }

    if let Err(e) = worker.close().await {
        warn!(worker = %name, "Failed to close worker: {}", e);
    }
    inner.active_workers.fetch_sub(1, Ordering::SeqCst);
    debug!(worker = %name, "Dispatch loop finished");
}

/// Pool of dynamically registered workers sharing one task queue
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    scope: Scope,
}

impl WorkerPool {
    pub fn new(options: PoolOptions) -> Self {
        let inner = Arc::new(PoolInner {
            tasks: CloseableQueue::new("task queue"),
            dispatchers: CloseableQueue::new(POOL_RESOURCE),
            batches: Mutex::new(Vec::new()),
            active_workers: AtomicUsize::new(0),
            retry: options.retry,
            output_dir: options.output_dir,
        });

        let scope = Scope::new(POOL_RESOURCE);
        let (stop, join, abandon) = (inner.clone(), inner.clone(), inner.clone());
        // A fresh scope always accepts exit actions.
        let _ = scope.on_exit_all(vec![
            ExitAction::sync(move || {
                stop.stop_accepting();
                Ok(())
            }),
            ExitAction::new(move || async move { join.join_dispatchers().await }),
            ExitAction::sync(move || {
                abandon.abandon_queued();
                Ok(())
            }),
        ]);

        Self { inner, scope }
    }

    /// Start a dispatch loop for `worker`. The worker is closed when its
    /// loop ends.
    pub fn register_worker(&self, worker: Arc<dyn Worker>) -> Result<(), ClosedError> {
        let (start_tx, start_rx) = oneshot::channel::<()>();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            match start_rx.await {
                Ok(()) => dispatch_loop(inner, worker).await,
                // Refused by a closed pool
                Err(_) => {
                    if let Err(e) = worker.close().await {
                        warn!(worker = %worker.name(), "Failed to close rejected worker: {}", e);
                    }
                }
            }
        });

        if let Err(closed) = self.inner.dispatchers.put(handle) {
            drop(start_tx);
            return Err(closed);
        }
        let _ = start_tx.send(());
        Ok(())
    }

    /// Run `operation` on every item and return the results in input order
    pub async fn map(
        &self,
        operation: &str,
        items: Vec<JsonValue>,
    ) -> Result<Vec<TaskResult>, ClosedError> {
        let tasks = items
            .into_iter()
            .map(|input| TaskInvocation::new(operation, input))
            .collect();
        self.map_invocations(tasks).await
    }

    /// Run every task and return the results in input order. Blocks while
    /// no worker is registered.
    pub async fn map_invocations(
        &self,
        tasks: Vec<TaskInvocation>,
    ) -> Result<Vec<TaskResult>, ClosedError> {
        if self.scope.is_closing() {
            return Err(ClosedError::new(POOL_RESOURCE));
        }

        let entries: Vec<Arc<TaskEntry>> = tasks.into_iter().map(TaskEntry::new).collect();
        self.inner.tasks.put_many(entries.iter().cloned())?;
        self.inner.batches.lock().push(entries.clone());
        info!("Mapped {} tasks onto the pool", entries.len());

        let mut results = Vec::with_capacity(entries.len());
        for entry in &entries {
            results.push(entry.slot.wait().await);
        }

        let failed = results.iter().filter(|r| r.is_err()).count();
        info!("Batch of {} tasks finished ({} failed)", results.len(), failed);

        if let Err(e) = self.write_run_summary() {
            warn!("Failed to write run summary: {}", e);
        }
        Ok(results)
    }

    /// Snapshots of every batch mapped so far, oldest first
    pub fn describe_mapped_jobs(&self) -> Vec<Vec<TaskSnapshot>> {
        self.inner
            .batches
            .lock()
            .iter()
            .map(|batch| batch.iter().map(|entry| entry.snapshot()).collect())
            .collect()
    }

    /// Write `run_summary.txt` into the output directory, if one is set
    pub fn write_run_summary(&self) -> std::io::Result<Option<PathBuf>> {
        let Some(dir) = &self.inner.output_dir else {
            return Ok(None);
        };
        let path = dir.join(RUN_SUMMARY_FILE);
        let text = format_jobs_summary(&self.describe_mapped_jobs(), Utc::now());
        std::fs::write(&path, text)?;
        debug!("Wrote run summary to {}", path.display());
        Ok(Some(path))
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.inner.output_dir.as_deref()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    /// Number of dispatch loops currently running
    pub fn active_workers(&self) -> usize {
        self.inner.active_workers.load(Ordering::SeqCst)
    }

    /// Tasks waiting for a worker
    pub fn queued_tasks(&self) -> usize {
        self.inner.tasks.len()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}

impl Scoped for WorkerPool {
    fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("active_workers", &self.active_workers())
            .field("queued_tasks", &self.queued_tasks())
            .field("retry", &self.inner.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::OperationRegistry;
    use crate::worker::LocalWorker;
    use async_trait::async_trait;
    use flotilla_core::{TaskError, WorkerDisabledError};
    use serde_json::json;
    use std::time::Duration;

    fn local(name: &str, registry: &Arc<OperationRegistry>) -> Arc<dyn Worker> {
        Arc::new(LocalWorker::new(name, registry.clone()))
    }

    /// Loses its connection on every task
    struct DeadWorker {
        scope: Scope,
    }

    impl Scoped for DeadWorker {
        fn scope(&self) -> &Scope {
            &self.scope
        }
    }

    #[async_trait]
    impl Worker for DeadWorker {
        fn name(&self) -> &str {
            "dead"
        }

        async fn run(&self, _task: &TaskInvocation) -> Result<JsonValue, RunError> {
            Err(WorkerDisabledError::new("dead", "connection reset").into())
        }
    }

    #[tokio::test]
    async fn test_map_preserves_input_order() {
        let mut registry = OperationRegistry::new();
        registry.register_async("slow_even", |input: JsonValue| async move {
            let n = input.as_i64().unwrap_or_default();
            if n % 2 == 0 {
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }
            }
            Ok(json!(n * 10))
        });
        let registry = Arc::new(registry);

        let pool = WorkerPool::default();
        for i in 0..3 {
            pool.register_worker(local(&format!("w{}", i), &registry)).unwrap();
        }

        let items: Vec<JsonValue> = (0..20).map(|i| json!(i)).collect();
        let results = pool.map("slow_even", items).await.unwrap();
        let values: Vec<JsonValue> = results.into_iter().map(|r| r.unwrap()).collect();
        let expected: Vec<JsonValue> = (0..20).map(|i| json!(i * 10)).collect();
        assert_eq!(values, expected);

        pool.close().await.unwrap();
        assert_eq!(pool.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = OperationRegistry::new();
        let counter = calls.clone();
        registry.register_fn("flaky", move |input| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TaskError::new("transient failure"))
            } else {
                Ok(input)
            }
        });

        let pool = WorkerPool::default();
        pool.register_worker(local("local", &Arc::new(registry))).unwrap();

        let results = pool.map("flaky", vec![json!("a")]).await.unwrap();
        assert_eq!(results, vec![Ok(json!("a"))]);

        let jobs = pool.describe_mapped_jobs();
        let job = &jobs[0][0];
        assert_eq!(job.attempts.len(), 1);
        assert_eq!(job.attempts[0].error, "transient failure");
        assert_eq!(job.attempts[0].worker_name, "local");
        assert!(job.end_time.is_some());
        assert!(job.resolved);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_last_error() {
        let mut registry = OperationRegistry::new();
        registry.register_fn("broken", |_| Err(TaskError::new("always fails")));
        let registry = Arc::new(registry);

        for max_attempts in [2, 3] {
            let pool = WorkerPool::new(PoolOptions::new(max_attempts));
            pool.register_worker(local("local", &registry)).unwrap();

            let results = pool.map("broken", vec![json!(1), json!(2)]).await.unwrap();
            for result in &results {
                assert_eq!(result, &Err(RunError::Task(TaskError::new("always fails"))));
            }
            for job in &pool.describe_mapped_jobs()[0] {
                assert_eq!(job.attempts.len(), max_attempts as usize);
                assert!(job.end_time.is_none());
            }
            pool.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_map_waits_for_first_worker() {
        let pool = Arc::new(WorkerPool::default());
        let mapping = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.map("echo", vec![json!(1), json!(2)]).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!mapping.is_finished());
        assert_eq!(pool.queued_tasks(), 2);

        let registry = Arc::new(OperationRegistry::with_builtins(None));
        pool.register_worker(local("late", &registry)).unwrap();

        let results = tokio::time::timeout(Duration::from_secs(2), mapping)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(results, vec![Ok(json!(1)), Ok(json!(2))]);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_worker_leaves_and_task_is_requeued() {
        let pool = Arc::new(WorkerPool::default());
        pool.register_worker(Arc::new(DeadWorker {
            scope: Scope::new("dead worker"),
        }))
        .unwrap();

        let mapping = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.map("echo", vec![json!("x")]).await })
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.describe_mapped_jobs().first().map_or(true, |b| b[0].attempts.is_empty())
                || pool.active_workers() > 0
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!mapping.is_finished());

        let registry = Arc::new(OperationRegistry::with_builtins(None));
        pool.register_worker(local("local", &registry)).unwrap();
        let results = tokio::time::timeout(Duration::from_secs(2), mapping)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(results, vec![Ok(json!("x"))]);

        let job = &pool.describe_mapped_jobs()[0][0];
        assert_eq!(job.attempts[0].worker_name, "dead");
        assert_eq!(job.worker_name.as_deref(), Some("local"));
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_work() {
        let pool = WorkerPool::default();
        pool.close().await.unwrap();
        pool.close().await.unwrap();

        let registry = Arc::new(OperationRegistry::with_builtins(None));
        let late = local("late", &registry);
        assert!(pool.register_worker(late.clone()).is_err());
        tokio::time::timeout(Duration::from_secs(1), late.closed().wait())
            .await
            .expect("rejected worker was not closed");
        let err = pool.map("echo", vec![json!(1)]).await.unwrap_err();
        assert_eq!(err.to_string(), "worker pool is closed");
    }

    #[tokio::test]
    async fn test_close_resolves_unclaimed_tasks() {
        let pool = Arc::new(WorkerPool::default());
        let mapping = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.map("echo", vec![json!(1)]).await })
        };
        while pool.queued_tasks() == 0 {
            tokio::task::yield_now().await;
        }

        pool.close().await.unwrap();
        let results = mapping.await.unwrap().unwrap();
        assert!(matches!(results[0], Err(RunError::Closed(_))));
    }

    #[tokio::test]
    async fn test_run_summary_written_after_map() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(PoolOptions::default().with_output_dir(dir.path()));

        // An empty batch still produces a summary
        assert!(pool.map("echo", Vec::new()).await.unwrap().is_empty());
        let summary = std::fs::read_to_string(dir.path().join(RUN_SUMMARY_FILE)).unwrap();
        assert!(summary.contains("Listing 0 jobs"));

        let registry = Arc::new(OperationRegistry::with_builtins(None));
        pool.register_worker(local("local", &registry)).unwrap();
        pool.map("echo", vec![json!({"name": "sample-1"})]).await.unwrap();

        let summary = std::fs::read_to_string(dir.path().join(RUN_SUMMARY_FILE)).unwrap();
        assert!(summary.contains("Listing 1 jobs registered with the server."));
        assert!(summary.contains("Job: sample-1"));
        assert!(summary.contains("  Completed by worker: local."));
        pool.close().await.unwrap();
    }
}
