//! Stream client: the probe's persistent connection to the coordinator.
//!
//! State machine: `Disconnected → Connecting → Registering → Online`,
//! back to `Disconnected` on any I/O failure, with exponential backoff
//! between attempts (reset once registration succeeds).
//!
//! While Online, three cooperating tasks share the stream: the
//! heartbeat emitter, the receive/dispatch loop, and a single writer
//! task that serializes every outbound envelope. Task output produced
//! while the stream is down is dropped — the coordinator observes the
//! disconnect and terminates those tasks on its side.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use spyglass_core::backoff::ReconnectBackoff;
use spyglass_core::protocol::{
    coord_message, decode_coord_message, encode_probe_message, handshake, probe_message,
    FrameCodec, Heartbeat, ProbeInfo, ProbeMessage, ProtocolError, Register, Task, TaskOutput,
    TaskStatus,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorLink;
use crate::runtime::TaskRuntime;

/// Outbound queue depth between producers and the stream writer.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Deadline for the coordinator's registration ack.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-task output channel depth.
const TASK_OUTPUT_DEPTH: usize = 100;

/// Stream client errors (per connection attempt).
#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("timed out waiting for registration ack")]
    RegistrationTimeout,
}

/// The probe's persistent stream client.
pub struct StreamClient {
    link: CoordinatorLink,
    info: ProbeInfo,
    runtime: Arc<TaskRuntime>,
}

impl StreamClient {
    /// Create a client that will advertise `info` at registration.
    #[must_use]
    pub fn new(link: CoordinatorLink, info: ProbeInfo, runtime: Arc<TaskRuntime>) -> Self {
        Self {
            link,
            info,
            runtime,
        }
    }

    /// Run the connect/serve/backoff loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut backoff = ReconnectBackoff::new(self.link.backoff.clone());
        let mut heartbeat_interval = self.link.heartbeat_interval;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self
                .connect_and_serve(&mut heartbeat_interval, &mut backoff, &shutdown)
                .await
            {
                Ok(()) => {
                    // Stream ended after a successful session (EOF or
                    // shutdown); reconnect promptly unless stopping.
                    if shutdown.is_cancelled() {
                        break;
                    }
                    info!("stream closed by coordinator");
                }
                Err(err) => {
                    warn!(error = %err, "stream session failed");
                }
            }

            let delay = backoff.next_delay();
            debug!(?delay, "reconnecting after backoff");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.cancelled() => break,
            }
        }

        info!("stream client stopped");
    }

    /// One connection attempt: dial, handshake, register, then serve
    /// until the stream dies.
    async fn connect_and_serve(
        &self,
        heartbeat_interval: &mut Duration,
        backoff: &mut ReconnectBackoff,
        shutdown: &CancellationToken,
    ) -> Result<(), SessionError> {
        info!(host = %self.link.host, "connecting to coordinator");
        let stream = TcpStream::connect(&self.link.host).await?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        let mut writer = FramedWrite::new(write_half, FrameCodec::new());

        handshake::connect(&mut reader, &mut writer, &self.link.api_key).await?;

        // Registration: advertise identity and the full task
        // descriptor list, then wait for the ack.
        let register = ProbeMessage {
            request_id: Uuid::new_v4().to_string(),
            payload: Some(probe_message::Payload::Register(Register {
                info: Some(self.info.clone()),
            })),
        };
        writer.send(encode_probe_message(&register)).await?;

        let ack = tokio::time::timeout(REGISTER_TIMEOUT, reader.next())
            .await
            .map_err(|_| SessionError::RegistrationTimeout)?
            .ok_or(ProtocolError::ConnectionClosed("registration"))??;
        let ack = decode_coord_message(&ack)?;
        let Some(coord_message::Payload::RegisterAck(ack)) = ack.payload else {
            return Err(ProtocolError::UnexpectedMessage("expected RegisterAck").into());
        };
        if !ack.success {
            return Err(SessionError::RegistrationRejected(ack.message));
        }
        if ack.heartbeat_interval_secs > 0 {
            *heartbeat_interval = Duration::from_secs(u64::from(ack.heartbeat_interval_secs));
        }
        info!(
            heartbeat_interval_secs = ack.heartbeat_interval_secs,
            "registered with coordinator"
        );
        backoff.reset();

        // Online: single writer task plus heartbeat emitter, both torn
        // down when the session token fires.
        let session = shutdown.child_token();
        let (outbound, mut outbound_rx) = mpsc::channel::<ProbeMessage>(OUTBOUND_QUEUE_DEPTH);

        let writer_session = session.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(err) = writer.send(encode_probe_message(&msg)).await {
                            debug!(error = %err, "stream write failed");
                            break;
                        }
                    }
                    () = writer_session.cancelled() => break,
                }
            }
        });

        let heartbeat_outbound = outbound.clone();
        let heartbeat_session = session.clone();
        let heartbeat_probe_id = self.info.id.clone();
        let heartbeat_runtime = Arc::clone(&self.runtime);
        let heartbeat_every = *heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Consume the interval's immediate tick: the first
            // heartbeat goes out one full interval after registration.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        #[allow(clippy::cast_possible_truncation)]
                        let heartbeat = ProbeMessage {
                            request_id: Uuid::new_v4().to_string(),
                            payload: Some(probe_message::Payload::Heartbeat(Heartbeat {
                                probe_id: heartbeat_probe_id.clone(),
                                current_tasks: heartbeat_runtime.current_task_count() as u32,
                            })),
                        };
                        if heartbeat_outbound.send(heartbeat).await.is_err() {
                            break;
                        }
                    }
                    () = heartbeat_session.cancelled() => break,
                }
            }
        });

        // Receive loop: dispatch coordinator messages in arrival order.
        let result = loop {
            let frame = tokio::select! {
                frame = reader.next() => frame,
                () = shutdown.cancelled() => break Ok(()),
            };

            let Some(frame) = frame else {
                break Ok(()); // EOF
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => break Err(SessionError::Protocol(err)),
            };
            let msg = match decode_coord_message(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    error!(error = %err, "malformed coordinator message, closing stream");
                    break Err(SessionError::Protocol(err));
                }
            };

            match msg.payload {
                Some(coord_message::Payload::HeartbeatAck(_)) => {
                    debug!("heartbeat acknowledged");
                }
                Some(coord_message::Payload::ExecuteTask(execute)) => {
                    if let Some(task) = execute.task {
                        self.spawn_task(task, outbound.clone());
                    } else {
                        warn!("execute request without task payload");
                    }
                }
                Some(coord_message::Payload::CancelTask(cancel)) => {
                    match self.runtime.cancel(&cancel.task_id) {
                        Ok(()) => {}
                        Err(err) => debug!(task_id = %cancel.task_id, error = %err, "cancel miss"),
                    }
                }
                Some(coord_message::Payload::RegisterAck(_)) => {
                    debug!("duplicate registration ack ignored");
                }
                None => warn!(request_id = %msg.request_id, "coordinator message without payload"),
            }
        };

        session.cancel();
        drop(outbound);
        let _ = heartbeat_task.await;
        let _ = writer_task.await;
        result
    }

    /// Launch one task: execute it on the runtime and pump its output
    /// frames onto the wire with the right envelope kinds.
    fn spawn_task(&self, task: Task, outbound: mpsc::Sender<ProbeMessage>) {
        let task_id = task.task_id.clone();
        info!(task_id = %task_id, task_name = %task.task_name, "task execution requested");

        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            let (sink, mut output_rx) = mpsc::channel::<TaskOutput>(TASK_OUTPUT_DEPTH);

            let exec_task_id = task_id.clone();
            let executor = tokio::spawn(async move { runtime.execute(task, sink).await });

            while let Some(output) = output_rx.recv().await {
                if outbound.send(wrap_output(output)).await.is_err() {
                    // Stream gone; output on a dead stream is dropped.
                    debug!(task_id = %exec_task_id, "dropping output, stream disconnected");
                    break;
                }
            }

            // Admission-stage failures produced no frames; report them
            // as a failed terminal so the coordinator can settle.
            match executor.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(task_id = %exec_task_id, error = %err, "task failed before start");
                    let frame = TaskOutput {
                        task_id: exec_task_id.clone(),
                        error_message: err.to_string(),
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                        status: TaskStatus::Failed as i32,
                        ..Default::default()
                    };
                    let _ = outbound.send(wrap_output(frame)).await;
                }
                Err(join_err) => {
                    error!(task_id = %exec_task_id, error = %join_err, "task panicked");
                    let frame = TaskOutput {
                        task_id: exec_task_id.clone(),
                        error_message: "internal task failure".to_string(),
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                        status: TaskStatus::Failed as i32,
                        ..Default::default()
                    };
                    let _ = outbound.send(wrap_output(frame)).await;
                }
            }
        });
    }
}

/// Choose the envelope kind for an output frame: terminal success and
/// failure get their dedicated kinds, everything else (including the
/// cancelled terminal) rides the plain output kind.
fn wrap_output(output: TaskOutput) -> ProbeMessage {
    let payload = match output.task_status() {
        TaskStatus::Completed => probe_message::Payload::TaskComplete(output),
        TaskStatus::Failed => probe_message::Payload::TaskFailed(output),
        _ => probe_message::Payload::TaskOutput(output),
    };
    ProbeMessage {
        request_id: Uuid::new_v4().to_string(),
        payload: Some(payload),
    }
}
