//! Stream registry: active probe streams and request correlation.
//!
//! Maps `probe_id` to the write half of its stream and `request_id` to
//! waiters for coordinator-initiated round-trips. One stream per probe
//! identity: a second registration for the same id replaces the first
//! (reconnect handling) — the evicted stream's owner task notices its
//! own I/O failure and cleans up independently.
//!
//! Send discipline: the underlying write half is not safe for
//! concurrent writers, so each entry owns an inner async mutex around
//! its framed sink. The scheduler's dispatch path and the receive
//! loop's ack path serialize there, never on the registry-wide lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use spyglass_core::protocol::{
    coord_message, encode_coord_message, CancelTask, CoordMessage, ExecuteTask, FrameCodec,
    ProbeMessage, ProtocolError, Task,
};
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Boxed write half of a probe stream.
pub type ProbeSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, FrameCodec>;

/// Default deadline for [`StreamRegistry::request_response`]; callers
/// may pass their own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from stream registry operations.
///
/// None of these tear the stream down by themselves; the stream-owning
/// task reacts to the underlying I/O failure.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// No registered stream for the probe.
    #[error("probe {0} not connected")]
    NotConnected(String),

    /// Writing the frame failed.
    #[error("send to probe failed: {0}")]
    SendFailed(#[from] ProtocolError),

    /// The probe did not reply within the deadline.
    #[error("timeout waiting for response from probe {probe_id}")]
    Timeout {
        /// Probe that failed to reply.
        probe_id: String,
    },

    /// The waiter disappeared before the reply arrived.
    #[error("reply channel lost")]
    ReplyLost,
}

/// Identity of one registered stream, handed back by
/// [`StreamRegistry::register`]. Cleanup is guarded by it: the owner of
/// an evicted stream cannot tear down its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId(Uuid);

struct StreamEntry {
    id: StreamId,
    writer: Arc<tokio::sync::Mutex<ProbeSink>>,
}

/// Registry of live probe streams.
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, StreamEntry>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ProbeMessage>>>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register the write half of a probe stream.
    ///
    /// An existing entry for the same id is replaced; the later stream
    /// wins (racing double-registration is allowed). No lock is held
    /// while the prior owner finds out — it observes its own stream
    /// failing and cleans up with its now-stale [`StreamId`].
    pub fn register(
        &self,
        probe_id: &str,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> StreamId {
        let sink = FramedWrite::new(
            Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>,
            FrameCodec::new(),
        );
        let id = StreamId(Uuid::new_v4());
        let entry = StreamEntry {
            id,
            writer: Arc::new(tokio::sync::Mutex::new(sink)),
        };

        let replaced = self
            .streams
            .write()
            .expect("streams lock")
            .insert(probe_id.to_string(), entry)
            .is_some();

        if replaced {
            warn!(probe_id, "replacing existing probe stream (reconnect)");
        } else {
            info!(probe_id, "probe stream registered");
        }
        id
    }

    /// Remove a probe's stream entry if it is still the one identified
    /// by `id`. Returns whether an entry was removed; `false` means the
    /// stream was already replaced by a reconnect and the caller must
    /// not treat the probe as disconnected.
    pub fn unregister(&self, probe_id: &str, id: StreamId) -> bool {
        let mut streams = self.streams.write().expect("streams lock");
        if streams.get(probe_id).is_some_and(|entry| entry.id == id) {
            streams.remove(probe_id);
            info!(probe_id, "probe stream unregistered");
            true
        } else {
            false
        }
    }

    /// Whether a stream is registered for the probe.
    #[must_use]
    pub fn is_connected(&self, probe_id: &str) -> bool {
        self.streams
            .read()
            .expect("streams lock")
            .contains_key(probe_id)
    }

    /// Number of registered streams.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.streams.read().expect("streams lock").len()
    }

    /// Send one message to a probe, serialized on the entry's inner
    /// mutex.
    ///
    /// # Errors
    ///
    /// [`StreamError::NotConnected`] if no stream is registered,
    /// [`StreamError::SendFailed`] if the write fails.
    pub async fn send_to(&self, probe_id: &str, msg: &CoordMessage) -> Result<(), StreamError> {
        let writer = {
            let streams = self.streams.read().expect("streams lock");
            let entry = streams
                .get(probe_id)
                .ok_or_else(|| StreamError::NotConnected(probe_id.to_string()))?;
            Arc::clone(&entry.writer)
        };

        let bytes = encode_coord_message(msg);
        let mut writer = writer.lock().await;
        writer.send(bytes).await.map_err(StreamError::SendFailed)
    }

    /// Send a message and await the probe's reply to the same
    /// `request_id`.
    ///
    /// The waiter slot is removed on timeout; a reply arriving after
    /// that is dropped silently by [`deliver_reply`](Self::deliver_reply).
    ///
    /// # Errors
    ///
    /// Send errors propagate; [`StreamError::Timeout`] after the
    /// deadline; [`StreamError::ReplyLost`] if the waiter channel is
    /// torn down without a reply.
    pub async fn request_response(
        &self,
        probe_id: &str,
        msg: &CoordMessage,
        timeout: Duration,
    ) -> Result<ProbeMessage, StreamError> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(msg.request_id.clone(), tx);

        if let Err(err) = self.send_to(probe_id, msg).await {
            self.pending
                .lock()
                .expect("pending lock")
                .remove(&msg.request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(StreamError::ReplyLost),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending lock")
                    .remove(&msg.request_id);
                Err(StreamError::Timeout {
                    probe_id: probe_id.to_string(),
                })
            }
        }
    }

    /// Route an incoming probe message to a pending waiter.
    ///
    /// Returns `true` if the message was consumed as a reply; `false`
    /// means no waiter exists and the caller should dispatch it
    /// normally. A reply whose waiter has already given up (timeout) is
    /// logged and discarded.
    pub fn deliver_reply(&self, msg: ProbeMessage) -> bool {
        let waiter = self
            .pending
            .lock()
            .expect("pending lock")
            .remove(&msg.request_id);

        match waiter {
            Some(tx) => {
                let request_id = msg.request_id.clone();
                if tx.send(msg).is_err() {
                    debug!(request_id = %request_id, "dropping reply for abandoned request");
                }
                true
            }
            None => false,
        }
    }
}

/// Seam between the scheduler and the probe streams.
///
/// Dispatch is fire-and-forget: outputs come back asynchronously,
/// routed by `task_id`, never through the request/response table.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Send an `ExecuteTask` to the probe.
    async fn send_task(&self, probe_id: &str, task: Task) -> Result<(), StreamError>;

    /// Send a `CancelTask` to the probe.
    async fn cancel_task(&self, probe_id: &str, task_id: &str) -> Result<(), StreamError>;
}

#[async_trait]
impl TaskDispatcher for StreamRegistry {
    async fn send_task(&self, probe_id: &str, task: Task) -> Result<(), StreamError> {
        let msg = CoordMessage {
            request_id: Uuid::new_v4().to_string(),
            payload: Some(coord_message::Payload::ExecuteTask(ExecuteTask {
                task: Some(task),
            })),
        };
        self.send_to(probe_id, &msg).await
    }

    async fn cancel_task(&self, probe_id: &str, task_id: &str) -> Result<(), StreamError> {
        let msg = CoordMessage {
            request_id: Uuid::new_v4().to_string(),
            payload: Some(coord_message::Payload::CancelTask(CancelTask {
                task_id: task_id.to_string(),
            })),
        };
        self.send_to(probe_id, &msg).await
    }
}
