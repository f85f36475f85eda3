//! Client sessions over WebSocket.
//!
//! Each connected client gets an isolated session: an inbound decode
//! loop for framed [`ClientRequest`]s, a bounded outbound queue
//! serializing writes from all producers (scheduler output handlers,
//! fleet-state pushes), and a transport-level ping/pong deadline to
//! detect dead clients.
//!
//! Overflow policy for the outbound queue: the session is closed (and
//! the drop logged) rather than silently losing frames — a client that
//! cannot keep up with streaming output is not a client we can make
//! guarantees to.
//!
//! On disconnect the session unregisters its tasks' output handlers
//! first, then cancels each task, so no terminal frame races into a
//! dead queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use serde::Serialize;
use spyglass_core::netutil::mask_ip;
use spyglass_core::protocol::{
    ClientAction, ClientRequest, ProbeStatus, ResponseType, ServerResponse, TaskOutput, TaskStatus,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{ProbeRegistry, ProbeSnapshot};
use crate::scheduler::{OutputHandler, Scheduler};

/// Depth of each client's outbound queue.
const SEND_QUEUE_DEPTH: usize = 256;

/// Server ping cadence.
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Deadline for some sign of life (pong or any inbound message).
const PONG_WAIT: Duration = Duration::from_secs(60);

/// Maximum inbound WebSocket message size.
const MAX_MESSAGE_SIZE: usize = 512 * 1024;

struct ClientHandle {
    tx: mpsc::Sender<ServerResponse>,
    shutdown: CancellationToken,
}

/// Shared state for all client sessions.
pub struct ClientHub {
    registry: Arc<ProbeRegistry>,
    scheduler: Arc<Scheduler>,
    clients: RwLock<HashMap<String, ClientHandle>>,
}

impl ClientHub {
    /// Create the hub.
    #[must_use]
    pub fn new(registry: Arc<ProbeRegistry>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            registry,
            scheduler,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Build the HTTP router: WebSocket upgrade plus the JSON listing.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/probes", get(api_probes_handler))
            .with_state(Arc::clone(self))
    }

    /// Push a fleet-state update to every connected client. Wired as a
    /// probe-registry status-change subscriber.
    pub fn broadcast_status_update(&self, snapshots: &[ProbeSnapshot]) {
        let response = ServerResponse {
            r#type: ResponseType::AgentStatusUpdate as i32,
            probes: masked_probe_list(snapshots),
            ..Default::default()
        };

        let clients = self.clients.read().expect("clients lock");
        for (client_id, handle) in clients.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = handle.tx.try_send(response.clone()) {
                warn!(client_id = %client_id, "send queue full, closing client session");
                handle.shutdown.cancel();
            }
        }
        debug!(client_count = clients.len(), "broadcast fleet-state update");
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let client_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::channel::<ServerResponse>(SEND_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();

        self.clients.write().expect("clients lock").insert(
            client_id.clone(),
            ClientHandle {
                tx: tx.clone(),
                shutdown: shutdown.clone(),
            },
        );
        info!(client_id = %client_id, "client connected");

        let (mut ws_tx, mut ws_rx) = socket.split();
        let last_seen = Arc::new(Mutex::new(Instant::now()));

        // Writer: drains the queue, pings on a timer, enforces the
        // liveness deadline, exits on session shutdown.
        let writer_last_seen = Arc::clone(&last_seen);
        let writer_shutdown = shutdown.clone();
        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_PERIOD);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    response = rx.recv() => {
                        let Some(response) = response else { break };
                        let bytes = response.encode_to_vec();
                        if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        let stale = writer_last_seen.lock().expect("last_seen lock").elapsed();
                        if stale > PONG_WAIT {
                            debug!("client missed liveness deadline");
                            break;
                        }
                        if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                    () = writer_shutdown.cancelled() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader: decode loop. Any inbound traffic counts as liveness.
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(err) => {
                    debug!(client_id = %client_id, error = %err, "client read error");
                    break;
                }
            };
            *last_seen.lock().expect("last_seen lock") = Instant::now();

            match msg {
                Message::Binary(data) => {
                    self.handle_request(&client_id, &tx, &shutdown, &data).await;
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Text(_) => {
                    send_error(&tx, "", "binary frames required");
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
        }

        // Disconnect: detach handlers before cancelling so terminal
        // frames cannot race into the dead queue.
        self.clients.write().expect("clients lock").remove(&client_id);
        shutdown.cancel();
        let owned = self.scheduler.tasks_for_client(&client_id);
        for task_id in &owned {
            self.scheduler.remove_handler(task_id);
        }
        for task_id in &owned {
            if let Err(err) = self.scheduler.cancel(task_id).await {
                debug!(task_id = %task_id, error = %err, "cleanup cancel failed");
            }
        }
        writer.abort();
        info!(client_id = %client_id, cancelled_tasks = owned.len(), "client disconnected");
    }

    async fn handle_request(
        &self,
        client_id: &str,
        tx: &mpsc::Sender<ServerResponse>,
        shutdown: &CancellationToken,
        data: &[u8],
    ) {
        let Ok(request) = ClientRequest::decode(data) else {
            send_error(tx, "", "invalid message format");
            return;
        };

        debug!(client_id = %client_id, action = ?request.client_action(), "client request");

        match request.client_action() {
            ClientAction::Execute => self.handle_execute(client_id, tx, shutdown, request).await,
            ClientAction::Cancel => self.handle_cancel(tx, &request.task_id).await,
            ClientAction::ListProbes => {
                let response = ServerResponse {
                    r#type: ResponseType::AgentList as i32,
                    probes: masked_probe_list(&self.registry.get_all()),
                    ..Default::default()
                };
                try_deliver(tx, shutdown, response);
            }
            ClientAction::Unspecified => send_error(tx, "", "unknown action"),
        }
    }

    async fn handle_execute(
        &self,
        client_id: &str,
        tx: &mpsc::Sender<ServerResponse>,
        shutdown: &CancellationToken,
        request: ClientRequest,
    ) {
        let Some(task) = request.task else {
            send_error(tx, "", "task is required");
            return;
        };
        // Request-shape validation only: the probe is authoritative for
        // whether it supports the name.
        if task.task_name.is_empty() {
            send_error(tx, &task.task_id, "task_name is required");
            return;
        }

        let task_id = task.task_id.clone();
        let handler = output_handler(tx.clone(), shutdown.clone());

        match self.scheduler.submit(task, client_id, handler).await {
            Ok(()) => {
                try_deliver(
                    tx,
                    shutdown,
                    ServerResponse {
                        r#type: ResponseType::TaskStarted as i32,
                        task_id,
                        ..Default::default()
                    },
                );
            }
            Err(err) => {
                warn!(client_id = %client_id, task_id = %task_id, error = %err, "submit failed");
                send_error(tx, &task_id, &format!("submit task failed: {err}"));
            }
        }
    }

    async fn handle_cancel(&self, tx: &mpsc::Sender<ServerResponse>, task_id: &str) {
        if task_id.is_empty() {
            send_error(tx, "", "task_id is required");
            return;
        }

        // On success the synthetic Cancelled terminal frame emitted
        // through the task's output handler is the client's Complete;
        // a second ack here would break the one-terminal-frame rule.
        if let Err(err) = self.scheduler.cancel(task_id).await {
            send_error(tx, task_id, &err.to_string());
        }
    }
}

/// Build the per-task output handler for a session: map wire frames to
/// response frames and push them into the bounded queue.
fn output_handler(tx: mpsc::Sender<ServerResponse>, shutdown: CancellationToken) -> OutputHandler {
    Arc::new(move |output: &TaskOutput| {
        let response_type = match output.task_status() {
            TaskStatus::Completed | TaskStatus::Cancelled => ResponseType::Complete,
            TaskStatus::Failed => ResponseType::Error,
            _ => ResponseType::Output,
        };
        let response = ServerResponse {
            r#type: response_type as i32,
            task_id: output.task_id.clone(),
            output: output.line.clone(),
            message: output.error_message.clone(),
            ..Default::default()
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(response) {
            warn!(task_id = %output.task_id, "send queue full, closing client session");
            shutdown.cancel();
        }
    })
}

fn try_deliver(
    tx: &mpsc::Sender<ServerResponse>,
    shutdown: &CancellationToken,
    response: ServerResponse,
) {
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(response) {
        warn!("send queue full, closing client session");
        shutdown.cancel();
    }
}

fn send_error(tx: &mpsc::Sender<ServerResponse>, task_id: &str, message: &str) {
    let _ = tx.try_send(ServerResponse {
        r#type: ResponseType::Error as i32,
        task_id: task_id.to_string(),
        message: message.to_string(),
        ..Default::default()
    });
}

/// Convert registry snapshots to the client-facing listing, applying
/// each probe's IP masking preference.
#[must_use]
pub fn masked_probe_list(snapshots: &[ProbeSnapshot]) -> Vec<spyglass_core::protocol::ProbeStatusInfo> {
    snapshots
        .iter()
        .map(|snap| spyglass_core::protocol::ProbeStatusInfo {
            id: snap.info.id.clone(),
            display_name: snap.info.display_name.clone(),
            location: snap.info.location.clone(),
            ipv4: mask_ip(&snap.info.ipv4, snap.info.hide_ip),
            ipv6: mask_ip(&snap.info.ipv6, snap.info.hide_ip),
            status: snap.status as i32,
            tasks: snap.info.tasks.clone(),
            current_tasks: snap.current_tasks,
            max_concurrent: snap.info.max_concurrent,
            provider: snap.info.provider.clone(),
            idc: snap.info.idc.clone(),
            description: snap.info.description.clone(),
        })
        .collect()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<ClientHub>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| hub.handle_socket(socket))
}

#[derive(Serialize)]
struct ApiProbe {
    id: String,
    name: String,
    location: String,
    ipv4: String,
    ipv6: String,
    status: &'static str,
    current_tasks: u32,
    max_concurrent: u32,
}

async fn api_probes_handler(State(hub): State<Arc<ClientHub>>) -> impl IntoResponse {
    let probes: Vec<ApiProbe> = hub
        .registry
        .get_all()
        .into_iter()
        .map(|snap| ApiProbe {
            id: snap.info.id.clone(),
            name: snap.info.display_name.clone(),
            location: snap.info.location.clone(),
            ipv4: mask_ip(&snap.info.ipv4, snap.info.hide_ip),
            ipv6: mask_ip(&snap.info.ipv6, snap.info.hide_ip),
            status: if snap.status == ProbeStatus::Online {
                "online"
            } else {
                "offline"
            },
            current_tasks: snap.current_tasks,
            max_concurrent: snap.info.max_concurrent,
        })
        .collect();

    Json(serde_json::json!({ "probes": probes }))
}

#[cfg(test)]
mod tests {
    use spyglass_core::protocol::{ProbeInfo, TaskDescriptor};

    use super::*;

    fn snapshot(hide_ip: bool) -> ProbeSnapshot {
        ProbeSnapshot {
            info: ProbeInfo {
                id: "P1".to_string(),
                display_name: "probe one".to_string(),
                location: "LAX".to_string(),
                ipv4: "203.0.113.45".to_string(),
                ipv6: "2001:db8::1".to_string(),
                hide_ip,
                max_concurrent: 5,
                tasks: vec![TaskDescriptor {
                    task_name: "ping".to_string(),
                    display_name: "Ping".to_string(),
                    description: String::new(),
                    requires_target: true,
                }],
                ..Default::default()
            },
            status: ProbeStatus::Online,
            current_tasks: 1,
        }
    }

    #[test]
    fn listing_masks_addresses_when_hidden() {
        let list = masked_probe_list(&[snapshot(true)]);
        assert_eq!(list[0].ipv4, "203.0.*.*");
        assert_eq!(list[0].ipv6, "2001:****:****:****:****:****:****:1");
        assert_eq!(list[0].tasks[0].task_name, "ping");
    }

    #[test]
    fn listing_keeps_addresses_when_not_hidden() {
        let list = masked_probe_list(&[snapshot(false)]);
        assert_eq!(list[0].ipv4, "203.0.113.45");
        assert_eq!(list[0].ipv6, "2001:db8::1");
    }

    #[tokio::test]
    async fn output_handler_maps_statuses() {
        let (tx, mut rx) = mpsc::channel(8);
        let handler = output_handler(tx, CancellationToken::new());

        for (status, expected) in [
            (TaskStatus::Running, ResponseType::Output),
            (TaskStatus::Completed, ResponseType::Complete),
            (TaskStatus::Cancelled, ResponseType::Complete),
            (TaskStatus::Failed, ResponseType::Error),
        ] {
            handler(&TaskOutput {
                task_id: "T1".to_string(),
                line: "line".to_string(),
                status: status as i32,
                ..Default::default()
            });
            let response = rx.recv().await.unwrap();
            assert_eq!(response.response_type(), expected);
            assert_eq!(response.task_id, "T1");
        }
    }

    #[tokio::test]
    async fn overflow_closes_the_session() {
        let (tx, _rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let handler = output_handler(tx, shutdown.clone());

        let frame = TaskOutput {
            task_id: "T1".to_string(),
            status: TaskStatus::Running as i32,
            ..Default::default()
        };
        handler(&frame); // fills the queue
        assert!(!shutdown.is_cancelled());
        handler(&frame); // overflow
        assert!(shutdown.is_cancelled());
    }
}
