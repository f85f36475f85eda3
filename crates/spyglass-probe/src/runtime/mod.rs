//! Probe task runtime: task table, concurrency, execution, cancel.
//!
//! The runtime owns the configuration-driven task table and enforces
//! two concurrency tiers: one global semaphore across all task names
//! and one semaphore per name. Execution is cooperative — every task
//! has a cancellation token keyed by `task_id`, installed before the
//! semaphore waits so a cancel can unblock a queued task.

pub mod args;
pub mod executor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spyglass_core::protocol::{Task, TaskOutput, TaskStatus};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ResolvedTask;

/// Runtime errors.
///
/// [`execute`](TaskRuntime::execute) returns an error **only** when no
/// terminal frame was emitted into the sink (the task never started);
/// the caller converts these into a `TaskFailed` envelope. Once output
/// is flowing, all outcomes — success, failure, timeout, cancellation
/// — surface as the single terminal frame instead.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The task name is not in the table (or was empty).
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// The configured executable does not exist.
    #[error("executor unavailable: {0}")]
    ExecutorUnavailable(String),

    /// No running task with this id.
    #[error("task not found: {0}")]
    TaskNotFound(String),
}

/// Configuration-driven task runtime.
pub struct TaskRuntime {
    table: HashMap<String, ResolvedTask>,
    default_timeout: Duration,
    global_sem: Arc<Semaphore>,
    name_sems: HashMap<String, Arc<Semaphore>>,
    running: Mutex<HashMap<String, CancellationToken>>,
    active: AtomicUsize,
}

impl TaskRuntime {
    /// Build the runtime from resolved task entries.
    #[must_use]
    pub fn new(tasks: Vec<ResolvedTask>, global_concurrency: usize, default_timeout: Duration) -> Self {
        let mut table = HashMap::new();
        let mut name_sems = HashMap::new();
        for task in tasks {
            name_sems.insert(task.name.clone(), Arc::new(Semaphore::new(task.concurrency_max)));
            info!(
                task = %task.name,
                max_concurrent = task.concurrency_max,
                "task registered"
            );
            table.insert(task.name.clone(), task);
        }

        Self {
            table,
            default_timeout,
            global_sem: Arc::new(Semaphore::new(global_concurrency)),
            name_sems,
            running: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
        }
    }

    /// Whether a task name is in the table.
    #[must_use]
    pub fn has_task(&self, task_name: &str) -> bool {
        self.table.contains_key(task_name)
    }

    /// Number of tasks currently executing (consulted by the heartbeat
    /// emitter).
    #[must_use]
    pub fn current_task_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Cancel a running task by id. Idempotent — cancelling twice (or
    /// an unknown id) is a no-op that reports `TaskNotFound`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::TaskNotFound`] when no task with this id is
    /// live.
    pub fn cancel(&self, task_id: &str) -> Result<(), RuntimeError> {
        let running = self.running.lock().expect("running lock");
        match running.get(task_id) {
            Some(token) => {
                token.cancel();
                info!(task_id, "task cancelled");
                Ok(())
            }
            None => Err(RuntimeError::TaskNotFound(task_id.to_string())),
        }
    }

    /// Execute a task, streaming output frames into `sink`.
    ///
    /// The contract, in order: validate the name, validate the
    /// executable (both before any semaphore), acquire the global then
    /// the per-name semaphore (a cancel during either wait emits a
    /// `Cancelled` terminal and returns), spawn and stream the
    /// subprocess, emit one terminal frame, release everything.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::UnknownTask`] or
    /// [`RuntimeError::ExecutorUnavailable`]; in both cases nothing was
    /// emitted into `sink`.
    pub async fn execute(
        &self,
        task: Task,
        sink: mpsc::Sender<TaskOutput>,
    ) -> Result<(), RuntimeError> {
        if task.task_name.is_empty() {
            return Err(RuntimeError::UnknownTask("task_name is required".to_string()));
        }
        let spec = self
            .table
            .get(&task.task_name)
            .ok_or_else(|| RuntimeError::UnknownTask(task.task_name.clone()))?;

        let path = args::find_executable(&spec.path)
            .ok_or_else(|| RuntimeError::ExecutorUnavailable(spec.path.clone()))?;

        let task_id = task.task_id.clone();
        let cancel = CancellationToken::new();
        self.running
            .lock()
            .expect("running lock")
            .insert(task_id.clone(), cancel.clone());

        let result = self.execute_guarded(&task, spec, &path, &cancel, &sink).await;

        self.running.lock().expect("running lock").remove(&task_id);
        result
    }

    /// The semaphore-guarded portion; the cancel token is already
    /// installed so cleanup stays in one place in [`execute`].
    async fn execute_guarded(
        &self,
        task: &Task,
        spec: &ResolvedTask,
        path: &std::path::Path,
        cancel: &CancellationToken,
        sink: &mpsc::Sender<TaskOutput>,
    ) -> Result<(), RuntimeError> {
        let _global_permit = tokio::select! {
            permit = self.global_sem.acquire() => permit.expect("semaphore closed"),
            () = cancel.cancelled() => {
                self.emit_cancelled(&task.task_id, sink).await;
                return Ok(());
            }
        };

        let name_sem = self.name_sems.get(&spec.name).expect("per-name semaphore");
        let _name_permit = tokio::select! {
            permit = name_sem.acquire() => permit.expect("semaphore closed"),
            () = cancel.cancelled() => {
                self.emit_cancelled(&task.task_id, sink).await;
                return Ok(());
            }
        };

        let params = task.params.clone().unwrap_or_default();
        let command_args = args::build_args(spec.kind, &spec.default_args, &params);

        let overall_timeout = if task.overall_timeout > 0 {
            Duration::from_secs(u64::from(task.overall_timeout))
        } else {
            self.default_timeout
        };

        debug!(task_id = %task.task_id, task_name = %spec.name, "executing task");

        self.active.fetch_add(1, Ordering::SeqCst);
        let _status = executor::run_command(
            task,
            path,
            command_args,
            spec.line_formatter,
            overall_timeout,
            cancel,
            sink,
        )
        .await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        Ok(())
    }

    async fn emit_cancelled(&self, task_id: &str, sink: &mpsc::Sender<TaskOutput>) {
        let _ = sink
            .send(TaskOutput {
                task_id: task_id.to_string(),
                error_message: "Task cancelled".to_string(),
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                status: TaskStatus::Cancelled as i32,
                ..Default::default()
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ExecutorKind, LineFormatter};

    use super::*;

    fn shell_task(name: &str, script: &str, concurrency_max: usize) -> ResolvedTask {
        ResolvedTask {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            requires_target: false,
            kind: ExecutorKind::Command,
            path: "/bin/sh".to_string(),
            default_args: vec!["-c".to_string(), script.to_string()],
            line_formatter: LineFormatter::None,
            concurrency_max,
        }
    }

    fn runtime_with(tasks: Vec<ResolvedTask>, global: usize) -> Arc<TaskRuntime> {
        Arc::new(TaskRuntime::new(tasks, global, Duration::from_secs(30)))
    }

    fn task(id: &str, name: &str) -> Task {
        Task {
            task_id: id.to_string(),
            task_name: name.to_string(),
            ..Default::default()
        }
    }

    async fn drain(mut rx: mpsc::Receiver<TaskOutput>) -> Vec<TaskOutput> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn unknown_task_rejected_before_any_output() {
        let runtime = runtime_with(vec![shell_task("echo", "echo hi", 1)], 4);
        let (tx, rx) = mpsc::channel(16);

        let err = runtime.execute(task("T1", "no_such_tool"), tx).await.unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownTask(name) if name == "no_such_tool"));
        assert!(drain(rx).await.is_empty());
    }

    #[tokio::test]
    async fn missing_executable_rejected_before_semaphores() {
        let mut missing = shell_task("ghost", "true", 1);
        missing.path = "/no/such/binary".to_string();
        let runtime = runtime_with(vec![missing], 4);
        let (tx, rx) = mpsc::channel(16);

        let err = runtime.execute(task("T1", "ghost"), tx).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ExecutorUnavailable(_)));
        assert!(drain(rx).await.is_empty());
        assert_eq!(runtime.current_task_count(), 0);
    }

    #[tokio::test]
    async fn executes_and_counts_active_tasks() {
        let runtime = runtime_with(vec![shell_task("echo", "echo done", 2)], 4);
        let (tx, rx) = mpsc::channel(16);

        runtime.execute(task("T1", "echo"), tx).await.unwrap();
        let frames = drain(rx).await;
        assert_eq!(frames.last().unwrap().task_status(), TaskStatus::Completed);
        assert_eq!(runtime.current_task_count(), 0);
    }

    #[tokio::test]
    async fn per_name_semaphore_serializes() {
        // One slot for the name; two tasks must run strictly in turn.
        let runtime = runtime_with(vec![shell_task("slow", "sleep 0.2; echo ran", 1)], 8);

        let (tx1, rx1) = mpsc::channel(16);
        let (tx2, rx2) = mpsc::channel(16);

        let r1 = Arc::clone(&runtime);
        let first = tokio::spawn(async move { r1.execute(task("T1", "slow"), tx1).await });
        let r2 = Arc::clone(&runtime);
        let second = tokio::spawn(async move { r2.execute(task("T2", "slow"), tx2).await });

        let started = std::time::Instant::now();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        // Two 200ms sleeps through a single slot cannot finish in 200ms.
        assert!(started.elapsed() >= Duration::from_millis(400));

        assert_eq!(drain(rx1).await.last().unwrap().task_status(), TaskStatus::Completed);
        assert_eq!(drain(rx2).await.last().unwrap().task_status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_while_queued_emits_cancelled_terminal() {
        let runtime = runtime_with(vec![shell_task("slow", "sleep 5", 1)], 8);

        // Occupy the single slot.
        let (tx1, _rx1) = mpsc::channel(16);
        let r1 = Arc::clone(&runtime);
        let blocker = tokio::spawn(async move { r1.execute(task("T1", "slow"), tx1).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Queue a second task, then cancel it while it waits.
        let (tx2, rx2) = mpsc::channel(16);
        let r2 = Arc::clone(&runtime);
        let queued = tokio::spawn(async move { r2.execute(task("T2", "slow"), tx2).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        runtime.cancel("T2").unwrap();
        queued.await.unwrap().unwrap();

        let frames = drain(rx2).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].task_status(), TaskStatus::Cancelled);

        runtime.cancel("T1").unwrap();
        blocker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let runtime = runtime_with(vec![shell_task("slow", "sleep 5", 1)], 8);
        let (tx, rx) = mpsc::channel(16);

        let r = Arc::clone(&runtime);
        let handle = tokio::spawn(async move { r.execute(task("T1", "slow"), tx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        runtime.cancel("T1").unwrap();
        handle.await.unwrap().unwrap();

        // The task is gone; a second cancel is a NotFound no-op.
        let err = runtime.cancel("T1").unwrap_err();
        assert!(matches!(err, RuntimeError::TaskNotFound(_)));

        assert_eq!(drain(rx).await.last().unwrap().task_status(), TaskStatus::Cancelled);
    }
}
