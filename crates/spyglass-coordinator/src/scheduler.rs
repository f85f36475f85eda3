//! Task scheduler: admission, correlation, output routing, lifecycle.
//!
//! Two-tier admission (global ceiling, then the probe's advertised
//! ceiling), per-task bookkeeping, forwarding of probe output to the
//! owning client session, and the cancel path.
//!
//! A task record moves `Pending → Running → {Completed | Failed |
//! Cancelled}`. Terminal states are absorbing: the record is removed,
//! counters decrement exactly once, and the output handler receives
//! exactly one terminal frame — the first terminal observation wins,
//! whether it came from the probe, a local cancel, or a probe
//! disconnect. Output handlers live in a lock separate from the task
//! records so output delivery can run concurrently with a terminal
//! commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use spyglass_core::protocol::{Task, TaskOutput, TaskStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::ProbeRegistry;
use crate::streams::{StreamError, TaskDispatcher};

/// Per-task output callback, owned by the client session that submitted
/// the task. Must be cheap (a bounded-queue push).
pub type OutputHandler = Arc<dyn Fn(&TaskOutput) + Send + Sync>;

/// Scheduler errors, surfaced to the client unchanged.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The global in-flight ceiling is reached.
    #[error("system busy: global task limit reached ({current}/{max})")]
    SystemBusy {
        /// Tasks currently in flight.
        current: usize,
        /// Global ceiling.
        max: usize,
    },

    /// No probe with the requested id.
    #[error("probe not found: {0}")]
    ProbeUnknown(String),

    /// The probe exists but is offline.
    #[error("probe is offline: {0}")]
    ProbeOffline(String),

    /// The probe's per-probe ceiling is reached.
    #[error("probe busy: task limit reached ({current}/{max})")]
    ProbeBusy {
        /// Tasks in flight on the probe.
        current: u32,
        /// Probe ceiling.
        max: u32,
    },

    /// Sending the dispatch to the probe failed; counters were unwound.
    #[error("dispatch failed: {0}")]
    DispatchFailed(#[from] StreamError),

    /// No record for the task id (already terminal or never admitted).
    #[error("task not found: {0}")]
    TaskNotFound(String),
}

struct TaskRecord {
    probe_id: String,
    client_id: String,
    status: TaskStatus,
    cancel: CancellationToken,
}

struct SchedulerState {
    in_flight: usize,
    tasks: HashMap<String, TaskRecord>,
}

/// Coordinator-side task scheduler.
pub struct Scheduler {
    registry: Arc<ProbeRegistry>,
    dispatcher: Arc<dyn TaskDispatcher>,
    global_max: usize,
    output_filter: Vec<String>,
    state: Mutex<SchedulerState>,
    handlers: RwLock<HashMap<String, OutputHandler>>,
}

impl Scheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(
        registry: Arc<ProbeRegistry>,
        dispatcher: Arc<dyn TaskDispatcher>,
        global_max: usize,
        output_filter: Vec<String>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            global_max,
            output_filter,
            state: Mutex::new(SchedulerState {
                in_flight: 0,
                tasks: HashMap::new(),
            }),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Submit a task for execution on its target probe.
    ///
    /// Admission checks run and both counters increment under the
    /// scheduler lock; the dispatch send happens after release. On send
    /// failure everything is unwound and no record is retained.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::SystemBusy`], [`SchedulerError::ProbeUnknown`],
    /// [`SchedulerError::ProbeOffline`], [`SchedulerError::ProbeBusy`]
    /// or [`SchedulerError::DispatchFailed`].
    pub async fn submit(
        &self,
        task: Task,
        client_id: &str,
        handler: OutputHandler,
    ) -> Result<(), SchedulerError> {
        let task_id = task.task_id.clone();
        let probe_id = task.probe_id.clone();

        {
            let mut state = self.state.lock().expect("scheduler lock");

            if state.in_flight >= self.global_max {
                return Err(SchedulerError::SystemBusy {
                    current: state.in_flight,
                    max: self.global_max,
                });
            }

            let probe = self
                .registry
                .get(&probe_id)
                .ok_or_else(|| SchedulerError::ProbeUnknown(probe_id.clone()))?;

            if probe.status != spyglass_core::protocol::ProbeStatus::Online {
                return Err(SchedulerError::ProbeOffline(probe_id.clone()));
            }

            if probe.current_tasks >= probe.info.max_concurrent {
                return Err(SchedulerError::ProbeBusy {
                    current: probe.current_tasks,
                    max: probe.info.max_concurrent,
                });
            }

            self.registry
                .increment_task_count(&probe_id)
                .map_err(|_| SchedulerError::ProbeUnknown(probe_id.clone()))?;
            state.in_flight += 1;

            state.tasks.insert(
                task_id.clone(),
                TaskRecord {
                    probe_id: probe_id.clone(),
                    client_id: client_id.to_string(),
                    status: TaskStatus::Pending,
                    cancel: CancellationToken::new(),
                },
            );
        }

        self.handlers
            .write()
            .expect("handlers lock")
            .insert(task_id.clone(), handler);

        info!(task_id = %task_id, probe_id = %probe_id, task_name = %task.task_name, "task submitted");

        if let Err(err) = self.dispatcher.send_task(&probe_id, task).await {
            warn!(task_id = %task_id, error = %err, "dispatch send failed, unwinding");
            self.handlers.write().expect("handlers lock").remove(&task_id);
            {
                let mut state = self.state.lock().expect("scheduler lock");
                if state.tasks.remove(&task_id).is_some() {
                    state.in_flight = state.in_flight.saturating_sub(1);
                }
            }
            let _ = self.registry.decrement_task_count(&probe_id);
            return Err(SchedulerError::DispatchFailed(err));
        }

        if let Some(record) = self
            .state
            .lock()
            .expect("scheduler lock")
            .tasks
            .get_mut(&task_id)
        {
            record.status = TaskStatus::Running;
        }

        Ok(())
    }

    /// Cancel a task: fire the local cancel handle, tell the probe
    /// best-effort, and complete locally with a synthetic `Cancelled`
    /// terminal frame.
    ///
    /// Idempotent from the caller's view: a second call finds no record
    /// and returns [`SchedulerError::TaskNotFound`] with no effect.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::TaskNotFound`] if the task id has no live
    /// record.
    pub async fn cancel(&self, task_id: &str) -> Result<(), SchedulerError> {
        let probe_id = {
            let state = self.state.lock().expect("scheduler lock");
            let record = state
                .tasks
                .get(task_id)
                .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
            record.cancel.cancel();
            record.probe_id.clone()
        };

        // Failure to reach the probe does not fail the cancel; local
        // cleanup proceeds regardless.
        if let Err(err) = self.dispatcher.cancel_task(&probe_id, task_id).await {
            warn!(task_id, probe_id = %probe_id, error = %err, "cancel send failed");
        }

        self.complete_task(task_id, TaskStatus::Cancelled, None);
        info!(task_id, "task cancelled");
        Ok(())
    }

    /// Route one output frame from the probe stream.
    ///
    /// Non-terminal frames are forwarded to the task's handler unless
    /// the suppression list matches. Terminal frames drive the terminal
    /// path: exactly one terminal frame reaches the handler, after
    /// which record, counters, and handler are gone.
    pub fn deliver_output(&self, output: TaskOutput) {
        let status = output.task_status();

        if status.is_terminal() {
            let task_id = output.task_id.clone();
            self.complete_task(&task_id, status, Some(output));
            return;
        }

        if self.is_filtered(&output.line) {
            debug!(task_id = %output.task_id, "output line suppressed");
            return;
        }
        self.forward(&output);
    }

    /// Fail every in-flight task dispatched to a disconnected probe.
    /// No rescheduling is attempted.
    pub fn handle_probe_disconnect(&self, probe_id: &str) {
        let task_ids: Vec<String> = {
            let state = self.state.lock().expect("scheduler lock");
            state
                .tasks
                .iter()
                .filter(|(_, record)| record.probe_id == probe_id)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for task_id in task_ids {
            warn!(task_id = %task_id, probe_id, "failing task: probe disconnected");
            let frame = TaskOutput {
                task_id: task_id.clone(),
                status: TaskStatus::Failed as i32,
                error_message: "probe disconnected".to_string(),
                timestamp_ms: Utc::now().timestamp_millis(),
                ..Default::default()
            };
            self.complete_task(&task_id, TaskStatus::Failed, Some(frame));
        }
    }

    /// Ids of all live tasks owned by a client session.
    #[must_use]
    pub fn tasks_for_client(&self, client_id: &str) -> Vec<String> {
        let state = self.state.lock().expect("scheduler lock");
        state
            .tasks
            .iter()
            .filter(|(_, record)| record.client_id == client_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Detach a task's output handler without touching its record.
    /// Used by a disconnecting session before it issues cancels, so
    /// terminal frames cannot race into a dead queue.
    pub fn remove_handler(&self, task_id: &str) {
        self.handlers.write().expect("handlers lock").remove(task_id);
    }

    /// Tasks currently in flight (admission counter).
    #[must_use]
    pub fn current_task_count(&self) -> usize {
        self.state.lock().expect("scheduler lock").in_flight
    }

    /// Lifecycle status of a task, while its record is live. Terminal
    /// tasks have no record and report `None`.
    #[must_use]
    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.state
            .lock()
            .expect("scheduler lock")
            .tasks
            .get(task_id)
            .map(|record| record.status)
    }

    fn is_filtered(&self, line: &str) -> bool {
        !line.is_empty() && self.output_filter.iter().any(|needle| line.contains(needle))
    }

    fn forward(&self, output: &TaskOutput) {
        let handler = {
            let handlers = self.handlers.read().expect("handlers lock");
            handlers.get(&output.task_id).map(Arc::clone)
        };
        // The handler may already be gone if the task terminated.
        if let Some(handler) = handler {
            handler(output);
        }
    }

    /// Terminal path. The record gates everything: if it is already
    /// gone this is a duplicate terminal and a complete no-op, so the
    /// counter decrement is idempotent and the handler sees one
    /// terminal frame. The handler is removed atomically with the
    /// emission.
    fn complete_task(&self, task_id: &str, status: TaskStatus, frame: Option<TaskOutput>) {
        let probe_id = {
            let mut state = self.state.lock().expect("scheduler lock");
            let Some(mut record) = state.tasks.remove(task_id) else {
                return;
            };
            record.status = status;
            record.cancel.cancel();
            state.in_flight = state.in_flight.saturating_sub(1);
            record.probe_id
        };

        let _ = self.registry.decrement_task_count(&probe_id);

        let mut final_frame = frame.unwrap_or_else(|| TaskOutput {
            task_id: task_id.to_string(),
            status: status as i32,
            timestamp_ms: Utc::now().timestamp_millis(),
            ..Default::default()
        });
        // A terminal frame always reaches the client; only its line is
        // subject to the suppression list.
        if self.is_filtered(&final_frame.line) {
            final_frame.line.clear();
        }

        {
            let mut handlers = self.handlers.write().expect("handlers lock");
            if let Some(handler) = handlers.remove(task_id) {
                handler(&final_frame);
            }
        }

        info!(task_id, status = ?status, "task completed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use spyglass_core::protocol::ProbeInfo;

    use super::*;

    #[derive(Default)]
    struct MockDispatcher {
        fail_sends: AtomicBool,
        sent: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskDispatcher for MockDispatcher {
        async fn send_task(&self, _probe_id: &str, task: Task) -> Result<(), StreamError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(StreamError::NotConnected("P1".to_string()));
            }
            self.sent.lock().unwrap().push(task.task_id);
            Ok(())
        }

        async fn cancel_task(&self, _probe_id: &str, task_id: &str) -> Result<(), StreamError> {
            self.cancelled.lock().unwrap().push(task_id.to_string());
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<ProbeRegistry>,
        dispatcher: Arc<MockDispatcher>,
        scheduler: Scheduler,
    }

    fn fixture(global_max: usize) -> Fixture {
        let registry = Arc::new(ProbeRegistry::new(Duration::from_secs(60), 5));
        registry.register_or_update(ProbeInfo {
            id: "P1".to_string(),
            max_concurrent: 2,
            ..Default::default()
        });
        let dispatcher = Arc::new(MockDispatcher::default());
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            Arc::clone(&dispatcher) as Arc<dyn TaskDispatcher>,
            global_max,
            vec!["NextTrace".to_string()],
        );
        Fixture {
            registry,
            dispatcher,
            scheduler,
        }
    }

    fn task(id: &str) -> Task {
        Task {
            task_id: id.to_string(),
            probe_id: "P1".to_string(),
            task_name: "ping".to_string(),
            ..Default::default()
        }
    }

    fn collecting_handler() -> (OutputHandler, Arc<Mutex<Vec<TaskOutput>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: OutputHandler = Arc::new(move |output: &TaskOutput| {
            sink.lock().unwrap().push(output.clone());
        });
        (handler, seen)
    }

    fn running_frame(task_id: &str, line: &str) -> TaskOutput {
        TaskOutput {
            task_id: task_id.to_string(),
            line: line.to_string(),
            status: TaskStatus::Running as i32,
            ..Default::default()
        }
    }

    fn terminal_frame(task_id: &str, status: TaskStatus) -> TaskOutput {
        TaskOutput {
            task_id: task_id.to_string(),
            status: status as i32,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_then_complete_delivers_one_terminal() {
        let fx = fixture(10);
        let (handler, seen) = collecting_handler();

        fx.scheduler.submit(task("T1"), "C1", handler).await.unwrap();
        assert_eq!(fx.scheduler.current_task_count(), 1);
        assert_eq!(fx.scheduler.task_status("T1"), Some(TaskStatus::Running));
        assert_eq!(fx.registry.get("P1").unwrap().current_tasks, 1);
        assert_eq!(fx.dispatcher.sent.lock().unwrap().as_slice(), ["T1"]);

        fx.scheduler.deliver_output(running_frame("T1", "64 bytes from 8.8.8.8"));
        fx.scheduler.deliver_output(terminal_frame("T1", TaskStatus::Completed));
        // Duplicate terminal is absorbed.
        fx.scheduler.deliver_output(terminal_frame("T1", TaskStatus::Completed));

        let frames = seen.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].task_status(), TaskStatus::Running);
        assert_eq!(frames[1].task_status(), TaskStatus::Completed);
        drop(frames);

        assert_eq!(fx.scheduler.task_status("T1"), None);
        assert_eq!(fx.scheduler.current_task_count(), 0);
        assert_eq!(fx.registry.get("P1").unwrap().current_tasks, 0);
    }

    #[tokio::test]
    async fn global_cap_zero_rejects_everything() {
        let fx = fixture(0);
        let (handler, _) = collecting_handler();

        let err = fx.scheduler.submit(task("T1"), "C1", handler).await.unwrap_err();
        assert!(matches!(err, SchedulerError::SystemBusy { current: 0, max: 0 }));
        assert_eq!(fx.scheduler.current_task_count(), 0);
    }

    #[tokio::test]
    async fn global_cap_one_serializes() {
        let fx = fixture(1);
        let (handler, _) = collecting_handler();
        fx.scheduler.submit(task("T1"), "C1", Arc::clone(&handler)).await.unwrap();

        let err = fx.scheduler.submit(task("T2"), "C1", Arc::clone(&handler)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::SystemBusy { .. }));

        fx.scheduler.deliver_output(terminal_frame("T1", TaskStatus::Completed));
        fx.scheduler.submit(task("T3"), "C1", handler).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_and_offline_probes_rejected() {
        let fx = fixture(10);
        let (handler, _) = collecting_handler();

        let mut to_nowhere = task("T1");
        to_nowhere.probe_id = "P9".to_string();
        let err = fx
            .scheduler
            .submit(to_nowhere, "C1", Arc::clone(&handler))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ProbeUnknown(_)));

        fx.registry.mark_offline("P1");
        let err = fx.scheduler.submit(task("T2"), "C1", handler).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ProbeOffline(_)));
    }

    #[tokio::test]
    async fn probe_ceiling_enforced() {
        let fx = fixture(10);
        let (handler, _) = collecting_handler();

        // max_concurrent = 2 on P1.
        fx.scheduler.submit(task("T1"), "C1", Arc::clone(&handler)).await.unwrap();
        fx.scheduler.submit(task("T2"), "C1", Arc::clone(&handler)).await.unwrap();

        let err = fx.scheduler.submit(task("T3"), "C1", handler).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ProbeBusy { current: 2, max: 2 }));
    }

    #[tokio::test]
    async fn dispatch_failure_unwinds_counters() {
        let fx = fixture(10);
        fx.dispatcher.fail_sends.store(true, Ordering::SeqCst);
        let (handler, seen) = collecting_handler();

        let err = fx.scheduler.submit(task("T1"), "C1", handler).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DispatchFailed(_)));
        assert_eq!(fx.scheduler.current_task_count(), 0);
        assert_eq!(fx.registry.get("P1").unwrap().current_tasks, 0);
        assert!(seen.lock().unwrap().is_empty());
        // No record was retained.
        assert!(fx.scheduler.tasks_for_client("C1").is_empty());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_synthesizes_terminal() {
        let fx = fixture(10);
        let (handler, seen) = collecting_handler();
        fx.scheduler.submit(task("T1"), "C1", handler).await.unwrap();

        fx.scheduler.cancel("T1").await.unwrap();
        assert_eq!(fx.dispatcher.cancelled.lock().unwrap().as_slice(), ["T1"]);

        let frames = seen.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].task_status(), TaskStatus::Cancelled);
        drop(frames);

        let err = fx.scheduler.cancel("T1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::TaskNotFound(_)));
        assert_eq!(fx.scheduler.current_task_count(), 0);
    }

    #[tokio::test]
    async fn late_probe_terminal_after_cancel_is_dropped() {
        let fx = fixture(10);
        let (handler, seen) = collecting_handler();
        fx.scheduler.submit(task("T1"), "C1", handler).await.unwrap();
        fx.scheduler.cancel("T1").await.unwrap();

        // Probe raced us and sent its own terminal; first one won.
        fx.scheduler.deliver_output(terminal_frame("T1", TaskStatus::Cancelled));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn banner_lines_suppressed() {
        let fx = fixture(10);
        let (handler, seen) = collecting_handler();
        fx.scheduler.submit(task("T1"), "C1", handler).await.unwrap();

        fx.scheduler.deliver_output(running_frame("T1", "NextTrace v1.3.7"));
        fx.scheduler.deliver_output(running_frame("T1", "1  192.0.2.1  1.2ms"));

        let frames = seen.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].line, "1  192.0.2.1  1.2ms");
    }

    #[tokio::test]
    async fn probe_disconnect_fails_in_flight_tasks() {
        let fx = fixture(10);
        let (handler, seen) = collecting_handler();
        fx.scheduler.submit(task("T1"), "C1", Arc::clone(&handler)).await.unwrap();
        fx.scheduler.submit(task("T2"), "C1", handler).await.unwrap();

        fx.scheduler.handle_probe_disconnect("P1");

        let frames = seen.lock().unwrap();
        assert_eq!(frames.len(), 2);
        for frame in frames.iter() {
            assert_eq!(frame.task_status(), TaskStatus::Failed);
            assert_eq!(frame.error_message, "probe disconnected");
        }
        drop(frames);
        assert_eq!(fx.scheduler.current_task_count(), 0);
    }

    #[tokio::test]
    async fn disconnecting_client_detaches_handler_before_cancel() {
        let fx = fixture(10);
        let (handler, seen) = collecting_handler();
        fx.scheduler.submit(task("T1"), "C1", handler).await.unwrap();

        let owned = fx.scheduler.tasks_for_client("C1");
        assert_eq!(owned, vec!["T1".to_string()]);

        fx.scheduler.remove_handler("T1");
        fx.scheduler.cancel("T1").await.unwrap();

        // No frame reached the dead session's queue.
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(fx.scheduler.current_task_count(), 0);
    }
}
