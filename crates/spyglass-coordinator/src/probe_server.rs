//! Probe stream server.
//!
//! Accepts TCP connections from probes, runs the handshake (auth
//! happens here — an unauthenticated peer never reaches the message
//! loop), then owns the per-connection receive loop: registration,
//! heartbeats, and task output dispatch.
//!
//! The connection task is the single owner of stream teardown: when the
//! receive loop ends for any reason after registration, it unregisters
//! the stream (guarded by its [`StreamId`], so a reconnect that already
//! replaced the stream is left alone), marks the probe offline, and
//! fails the probe's in-flight tasks — exactly once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use spyglass_core::protocol::{
    coord_message, decode_probe_message, handshake, probe_message, CoordMessage, FrameCodec,
    HeartbeatAck, RegisterAck,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::registry::ProbeRegistry;
use crate::scheduler::Scheduler;
use crate::streams::{StreamId, StreamRegistry};

/// Probe stream server state shared across connection tasks.
pub struct ProbeServer {
    registry: Arc<ProbeRegistry>,
    streams: Arc<StreamRegistry>,
    scheduler: Arc<Scheduler>,
    authenticator: Arc<Authenticator>,
    heartbeat_interval: Duration,
}

impl ProbeServer {
    /// Create the server.
    #[must_use]
    pub fn new(
        registry: Arc<ProbeRegistry>,
        streams: Arc<StreamRegistry>,
        scheduler: Arc<Scheduler>,
        authenticator: Arc<Authenticator>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            registry,
            streams,
            scheduler,
            authenticator,
            heartbeat_interval,
        }
    }

    /// Accept probe connections until `shutdown` fires.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), "probe stream server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(err) => {
                            error!(error = %err, "failed to accept probe connection");
                        }
                    }
                }
                () = shutdown.cancelled() => {
                    info!("probe stream server shutting down");
                    break;
                }
            }
        }
    }

    /// Drive one probe connection from handshake to teardown.
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "probe connection accepted");
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        let mut writer = FramedWrite::new(write_half, FrameCodec::new());

        let hello = match handshake::accept(&mut reader, &mut writer).await {
            Ok(hello) => hello,
            Err(err) => {
                warn!(%peer, error = %err, "probe handshake failed");
                return;
            }
        };

        if let Err(err) = self.authenticator.authenticate(&hello.api_key, peer.ip()) {
            let _ = handshake::respond(&mut writer, false, &err.to_string()).await;
            return;
        }
        if let Err(err) = handshake::respond(&mut writer, true, "authenticated").await {
            warn!(%peer, error = %err, "failed to ack probe handshake");
            return;
        }

        // The first envelope must be a registration; the write half
        // moves into the stream registry so acks and dispatches share
        // the per-stream send mutex.
        let mut registered: Option<(String, StreamId)> = None;
        let mut writer = Some(writer);

        while let Some(frame) = reader.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%peer, error = %err, "probe stream receive error");
                    break;
                }
            };

            let msg = match decode_probe_message(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    // Malformed payload: the stream is unrecoverable.
                    error!(%peer, error = %err, "malformed probe message, closing stream");
                    break;
                }
            };

            // Replies to coordinator-initiated round-trips are consumed
            // by their waiters and never reach normal dispatch.
            if registered.is_some() && self.streams.deliver_reply(msg.clone()) {
                continue;
            }

            match msg.payload {
                Some(probe_message::Payload::Register(register)) => {
                    match self
                        .handle_register(&msg.request_id, register, &mut writer, &mut registered)
                        .await
                    {
                        Ok(()) => {}
                        Err(()) => break,
                    }
                }
                Some(probe_message::Payload::Heartbeat(heartbeat)) => {
                    self.handle_heartbeat(&msg.request_id, &heartbeat.probe_id, heartbeat.current_tasks)
                        .await;
                }
                Some(probe_message::Payload::TaskOutput(output))
                | Some(probe_message::Payload::TaskComplete(output))
                | Some(probe_message::Payload::TaskFailed(output)) => {
                    self.scheduler.deliver_output(output);
                }
                None => {
                    warn!(%peer, request_id = %msg.request_id, "probe message without payload");
                }
            }
        }

        // Exactly-once teardown for this connection. A stale StreamId
        // (stream already replaced by a reconnect) skips the offline
        // transition entirely.
        if let Some((probe_id, stream_id)) = registered {
            if self.streams.unregister(&probe_id, stream_id) {
                info!(probe_id = %probe_id, %peer, "probe stream closed");
                self.registry.mark_offline(&probe_id);
                self.scheduler.handle_probe_disconnect(&probe_id);
            } else {
                debug!(probe_id = %probe_id, "stream already replaced, skipping teardown");
            }
        }
    }

    async fn handle_register(
        &self,
        request_id: &str,
        register: spyglass_core::protocol::Register,
        writer: &mut Option<FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec>>,
        registered: &mut Option<(String, StreamId)>,
    ) -> Result<(), ()> {
        let Some(info) = register.info else {
            warn!("registration without probe info");
            return Err(());
        };
        if info.id.is_empty() {
            warn!("registration with empty probe id");
            return Err(());
        }
        let probe_id = info.id.clone();

        // First registration on this connection moves the writer into
        // the registry; later ones just refresh the probe info.
        if registered.is_none() {
            let Some(writer) = writer.take() else {
                return Err(());
            };
            let stream_id = self.streams.register(&probe_id, writer.into_inner());
            *registered = Some((probe_id.clone(), stream_id));
        }

        let was_offline = self.registry.register_or_update(info);
        debug!(probe_id = %probe_id, was_offline, "probe registration processed");

        #[allow(clippy::cast_possible_truncation)]
        let heartbeat_interval_secs = self.heartbeat_interval.as_secs() as u32;
        let ack = CoordMessage {
            request_id: request_id.to_string(),
            payload: Some(coord_message::Payload::RegisterAck(RegisterAck {
                success: true,
                message: "registration successful".to_string(),
                heartbeat_interval_secs,
            })),
        };
        if let Err(err) = self.streams.send_to(&probe_id, &ack).await {
            error!(probe_id = %probe_id, error = %err, "failed to send registration ack");
            return Err(());
        }
        Ok(())
    }

    async fn handle_heartbeat(&self, request_id: &str, probe_id: &str, current_tasks: u32) {
        let result = self.registry.update_heartbeat(probe_id, current_tasks);

        let ack = CoordMessage {
            request_id: request_id.to_string(),
            payload: Some(coord_message::Payload::HeartbeatAck(HeartbeatAck {
                success: result.is_ok(),
                message: match &result {
                    Ok(()) => "heartbeat received".to_string(),
                    Err(err) => err.to_string(),
                },
            })),
        };

        if let Err(err) = self.streams.send_to(probe_id, &ack).await {
            warn!(probe_id, error = %err, "failed to send heartbeat ack");
        }
    }
}
