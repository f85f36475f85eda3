//! Protocol buffer message types for the probe and client streams.
//!
//! Messages are hand-written prost structs rather than generated code;
//! the field numbers below are the wire contract and must never be
//! reused or renumbered.
//!
//! Two envelopes multiplex the probe stream ([`ProbeMessage`],
//! [`CoordMessage`]); each carries a `request_id` used solely for
//! request/response correlation. The discriminated payload (`oneof`) is
//! the message kind. Task dispatch and task output are *not* correlated
//! through `request_id` — they are routed by `task_id`.

use std::collections::HashMap;

use prost::{Enumeration, Message, Oneof};

/// Lifecycle status of a task, carried on every [`TaskOutput`] frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum TaskStatus {
    /// Unknown status (never sent by well-behaved peers).
    Unspecified = 0,
    /// Admitted but not yet dispatched.
    Pending = 1,
    /// Dispatched; output frames are flowing.
    Running = 2,
    /// Terminal: the subprocess exited with code 0.
    Completed = 3,
    /// Terminal: the subprocess failed or could not be started.
    Failed = 4,
    /// Terminal: the task was cancelled.
    Cancelled = 5,
}

impl TaskStatus {
    /// Whether this status is absorbing (no further frames may follow).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Liveness status of a probe as tracked by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum ProbeStatus {
    /// Unknown status.
    Unspecified = 0,
    /// Heartbeating within the timeout with a registered stream.
    Online = 1,
    /// Stream lost or heartbeat timed out.
    Offline = 2,
}

/// Metadata describing one task a probe can run, advertised at
/// registration and surfaced to clients in probe listings.
#[derive(Clone, PartialEq, Message)]
pub struct TaskDescriptor {
    /// Task name — the key into the probe's task table.
    #[prost(string, tag = "1")]
    pub task_name: String,
    /// Human-readable name for frontends.
    #[prost(string, tag = "2")]
    pub display_name: String,
    /// Free-form description.
    #[prost(string, tag = "3")]
    pub description: String,
    /// Whether submissions must carry a target parameter.
    #[prost(bool, tag = "4")]
    pub requires_target: bool,
}

/// Probe identity and capabilities, immutable per registration.
#[derive(Clone, PartialEq, Message)]
pub struct ProbeInfo {
    /// Opaque non-empty id, globally unique; chosen by the operator.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Display name.
    #[prost(string, tag = "2")]
    pub display_name: String,
    /// Geographic location.
    #[prost(string, tag = "3")]
    pub location: String,
    /// Hosting provider.
    #[prost(string, tag = "4")]
    pub provider: String,
    /// Data-center identifier.
    #[prost(string, tag = "5")]
    pub idc: String,
    /// Free-form description.
    #[prost(string, tag = "6")]
    pub description: String,
    /// Self-reported public IPv4 address; may be empty.
    #[prost(string, tag = "7")]
    pub ipv4: String,
    /// Self-reported public IPv6 address; may be empty.
    #[prost(string, tag = "8")]
    pub ipv6: String,
    /// Mask addresses before disclosure to clients.
    #[prost(bool, tag = "9")]
    pub hide_ip: bool,
    /// Probe-declared per-probe admission ceiling.
    #[prost(uint32, tag = "10")]
    pub max_concurrent: u32,
    /// Ordered task descriptor list.
    #[prost(message, repeated, tag = "11")]
    pub tasks: Vec<TaskDescriptor>,
}

/// Parameters of one diagnostic dispatch.
#[derive(Clone, PartialEq, Message)]
pub struct TaskParams {
    /// Target host or address. Absence is legal iff the named task
    /// declares `requires_target = false`.
    #[prost(string, tag = "1")]
    pub target: String,
    /// Probe/packet count, tool-specific.
    #[prost(uint32, tag = "2")]
    pub count: u32,
    /// Per-step timeout in seconds, tool-specific.
    #[prost(uint32, tag = "3")]
    pub timeout: u32,
    /// Prefer IPv6 resolution.
    #[prost(bool, tag = "4")]
    pub ipv6: bool,
    /// Extra tool options (flag → value; empty value means bare flag).
    #[prost(map = "string, string", tag = "5")]
    pub extra: HashMap<String, String>,
}

/// One dispatch of one named diagnostic operation.
#[derive(Clone, PartialEq, Message)]
pub struct Task {
    /// Opaque unique id, issued by the client.
    #[prost(string, tag = "1")]
    pub task_id: String,
    /// Target probe id.
    #[prost(string, tag = "2")]
    pub probe_id: String,
    /// Key into the probe's task table. Task identity is this string
    /// only; the coordinator never validates it.
    #[prost(string, tag = "3")]
    pub task_name: String,
    /// Dispatch parameters.
    #[prost(message, optional, tag = "4")]
    pub params: Option<TaskParams>,
    /// Overall timeout in seconds, enforced by the probe.
    #[prost(uint32, tag = "5")]
    pub overall_timeout: u32,
}

/// Wire-level streaming unit for task output; carries its own terminal
/// status.
#[derive(Clone, PartialEq, Message)]
pub struct TaskOutput {
    /// Task this frame belongs to.
    #[prost(string, tag = "1")]
    pub task_id: String,
    /// One logical output line.
    #[prost(string, tag = "2")]
    pub line: String,
    /// Populated on stderr lines and on non-Running terminal status.
    #[prost(string, tag = "3")]
    pub error_message: String,
    /// Emission time, unix milliseconds.
    #[prost(int64, tag = "4")]
    pub timestamp_ms: i64,
    /// Frame status; see [`TaskStatus`].
    #[prost(enumeration = "TaskStatus", tag = "5")]
    pub status: i32,
}

impl TaskOutput {
    /// Decoded [`TaskStatus`] of this frame.
    #[must_use]
    pub fn task_status(&self) -> TaskStatus {
        TaskStatus::try_from(self.status).unwrap_or(TaskStatus::Unspecified)
    }
}

/// Registration payload: the probe's full identity.
#[derive(Clone, PartialEq, Message)]
pub struct Register {
    /// Probe identity and capabilities.
    #[prost(message, optional, tag = "1")]
    pub info: Option<ProbeInfo>,
}

/// Periodic liveness report.
#[derive(Clone, PartialEq, Message)]
pub struct Heartbeat {
    /// Reporting probe.
    #[prost(string, tag = "1")]
    pub probe_id: String,
    /// Tasks currently in flight on the probe.
    #[prost(uint32, tag = "2")]
    pub current_tasks: u32,
}

/// Coordinator's reply to a [`Register`].
#[derive(Clone, PartialEq, Message)]
pub struct RegisterAck {
    /// Whether registration was accepted.
    #[prost(bool, tag = "1")]
    pub success: bool,
    /// Human-readable detail.
    #[prost(string, tag = "2")]
    pub message: String,
    /// Heartbeat interval the probe should adopt, in seconds.
    #[prost(uint32, tag = "3")]
    pub heartbeat_interval_secs: u32,
}

/// Coordinator's reply to a [`Heartbeat`].
#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatAck {
    /// Whether the heartbeat was recorded.
    #[prost(bool, tag = "1")]
    pub success: bool,
    /// Human-readable detail.
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Task dispatch request.
#[derive(Clone, PartialEq, Message)]
pub struct ExecuteTask {
    /// The task to run.
    #[prost(message, optional, tag = "1")]
    pub task: Option<Task>,
}

/// Task cancellation request.
#[derive(Clone, PartialEq, Message)]
pub struct CancelTask {
    /// Id of the task to cancel.
    #[prost(string, tag = "1")]
    pub task_id: String,
}

/// Probe→coordinator envelope.
#[derive(Clone, PartialEq, Message)]
pub struct ProbeMessage {
    /// Correlation id for request/response pairs.
    #[prost(string, tag = "1")]
    pub request_id: String,
    /// Discriminated payload.
    #[prost(oneof = "probe_message::Payload", tags = "2, 3, 4, 5, 6")]
    pub payload: Option<probe_message::Payload>,
}

/// Payload variants of [`ProbeMessage`].
pub mod probe_message {
    use prost::Oneof;

    /// Discriminated payload of a probe→coordinator envelope.
    #[derive(Clone, PartialEq, Oneof)]
    pub enum Payload {
        /// Registration handshake.
        #[prost(message, tag = "2")]
        Register(super::Register),
        /// Periodic liveness report.
        #[prost(message, tag = "3")]
        Heartbeat(super::Heartbeat),
        /// Streaming output frame (status Running or Cancelled).
        #[prost(message, tag = "4")]
        TaskOutput(super::TaskOutput),
        /// Terminal frame with status Completed.
        #[prost(message, tag = "5")]
        TaskComplete(super::TaskOutput),
        /// Terminal frame with status Failed.
        #[prost(message, tag = "6")]
        TaskFailed(super::TaskOutput),
    }
}

/// Coordinator→probe envelope.
#[derive(Clone, PartialEq, Message)]
pub struct CoordMessage {
    /// Correlation id for request/response pairs.
    #[prost(string, tag = "1")]
    pub request_id: String,
    /// Discriminated payload.
    #[prost(oneof = "coord_message::Payload", tags = "2, 3, 4, 5")]
    pub payload: Option<coord_message::Payload>,
}

/// Payload variants of [`CoordMessage`].
pub mod coord_message {
    use prost::Oneof;

    /// Discriminated payload of a coordinator→probe envelope.
    #[derive(Clone, PartialEq, Oneof)]
    pub enum Payload {
        /// Reply to a registration.
        #[prost(message, tag = "2")]
        RegisterAck(super::RegisterAck),
        /// Reply to a heartbeat.
        #[prost(message, tag = "3")]
        HeartbeatAck(super::HeartbeatAck),
        /// Task dispatch.
        #[prost(message, tag = "4")]
        ExecuteTask(super::ExecuteTask),
        /// Task cancellation.
        #[prost(message, tag = "5")]
        CancelTask(super::CancelTask),
    }
}

/// Action requested by a client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum ClientAction {
    /// Unknown action.
    Unspecified = 0,
    /// Submit a task.
    Execute = 1,
    /// Cancel a task.
    Cancel = 2,
    /// List all known probes.
    ListProbes = 3,
}

/// Kind of a [`ServerResponse`] frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum ResponseType {
    /// Unknown kind.
    Unspecified = 0,
    /// One task output line.
    Output = 1,
    /// An error (admission failure, task failure, bad request).
    Error = 2,
    /// Task reached a successful or cancelled terminal state.
    Complete = 3,
    /// Task was admitted and dispatched.
    TaskStarted = 4,
    /// Reply to `ListProbes`: the full masked probe list.
    AgentList = 5,
    /// Unsolicited fleet-state push on any status transition.
    AgentStatusUpdate = 6,
}

/// Framed request from a client session.
#[derive(Clone, PartialEq, Message)]
pub struct ClientRequest {
    /// Requested action.
    #[prost(enumeration = "ClientAction", tag = "1")]
    pub action: i32,
    /// Task payload, required for `Execute`.
    #[prost(message, optional, tag = "2")]
    pub task: Option<Task>,
    /// Task id, required for `Cancel`.
    #[prost(string, tag = "3")]
    pub task_id: String,
}

impl ClientRequest {
    /// Decoded [`ClientAction`] of this request.
    #[must_use]
    pub fn client_action(&self) -> ClientAction {
        ClientAction::try_from(self.action).unwrap_or(ClientAction::Unspecified)
    }
}

/// One probe entry in a client-facing listing, IP-masked per the probe's
/// `hide_ip` flag.
#[derive(Clone, PartialEq, Message)]
pub struct ProbeStatusInfo {
    /// Probe id.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Display name.
    #[prost(string, tag = "2")]
    pub display_name: String,
    /// Location.
    #[prost(string, tag = "3")]
    pub location: String,
    /// IPv4 address (possibly masked).
    #[prost(string, tag = "4")]
    pub ipv4: String,
    /// IPv6 address (possibly masked).
    #[prost(string, tag = "5")]
    pub ipv6: String,
    /// Liveness status.
    #[prost(enumeration = "ProbeStatus", tag = "6")]
    pub status: i32,
    /// Advertised task descriptors.
    #[prost(message, repeated, tag = "7")]
    pub tasks: Vec<TaskDescriptor>,
    /// Tasks in flight, per the last heartbeat.
    #[prost(uint32, tag = "8")]
    pub current_tasks: u32,
    /// Per-probe admission ceiling.
    #[prost(uint32, tag = "9")]
    pub max_concurrent: u32,
    /// Hosting provider.
    #[prost(string, tag = "10")]
    pub provider: String,
    /// Data-center identifier.
    #[prost(string, tag = "11")]
    pub idc: String,
    /// Description.
    #[prost(string, tag = "12")]
    pub description: String,
}

/// Framed response to a client session.
#[derive(Clone, PartialEq, Message)]
pub struct ServerResponse {
    /// Response kind.
    #[prost(enumeration = "ResponseType", tag = "1")]
    pub r#type: i32,
    /// Task id the frame relates to, when applicable.
    #[prost(string, tag = "2")]
    pub task_id: String,
    /// Output line for `Output` frames.
    #[prost(string, tag = "3")]
    pub output: String,
    /// Human-readable detail (error text, completion note).
    #[prost(string, tag = "4")]
    pub message: String,
    /// Probe list for `AgentList` / `AgentStatusUpdate` frames.
    #[prost(message, repeated, tag = "5")]
    pub probes: Vec<ProbeStatusInfo>,
}

impl ServerResponse {
    /// Decoded [`ResponseType`] of this frame.
    #[must_use]
    pub fn response_type(&self) -> ResponseType {
        ResponseType::try_from(self.r#type).unwrap_or(ResponseType::Unspecified)
    }
}

#[cfg(test)]
mod tests {
    use prost::Message as _;

    use super::*;

    fn sample_task() -> Task {
        Task {
            task_id: "T1".to_string(),
            probe_id: "P1".to_string(),
            task_name: "ping".to_string(),
            params: Some(TaskParams {
                target: "8.8.8.8".to_string(),
                count: 2,
                timeout: 5,
                ipv6: false,
                extra: HashMap::new(),
            }),
            overall_timeout: 300,
        }
    }

    #[test]
    fn probe_envelope_roundtrip() {
        let msg = ProbeMessage {
            request_id: "r-1".to_string(),
            payload: Some(probe_message::Payload::Register(Register {
                info: Some(ProbeInfo {
                    id: "P1".to_string(),
                    display_name: "probe one".to_string(),
                    max_concurrent: 5,
                    tasks: vec![TaskDescriptor {
                        task_name: "ping".to_string(),
                        display_name: "Ping".to_string(),
                        description: String::new(),
                        requires_target: true,
                    }],
                    ..Default::default()
                }),
            })),
        };

        let bytes = msg.encode_to_vec();
        let decoded = ProbeMessage::decode(bytes.as_slice()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn coord_envelope_roundtrip() {
        let msg = CoordMessage {
            request_id: "r-2".to_string(),
            payload: Some(coord_message::Payload::ExecuteTask(ExecuteTask {
                task: Some(sample_task()),
            })),
        };

        let bytes = msg.encode_to_vec();
        let decoded = CoordMessage::decode(bytes.as_slice()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn client_frames_roundtrip() {
        let req = ClientRequest {
            action: ClientAction::Execute as i32,
            task: Some(sample_task()),
            task_id: String::new(),
        };
        let decoded = ClientRequest::decode(req.encode_to_vec().as_slice()).unwrap();
        assert_eq!(req, decoded);
        assert_eq!(decoded.client_action(), ClientAction::Execute);

        let resp = ServerResponse {
            r#type: ResponseType::TaskStarted as i32,
            task_id: "T1".to_string(),
            ..Default::default()
        };
        let decoded = ServerResponse::decode(resp.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.response_type(), ResponseType::TaskStarted);
    }

    #[test]
    fn garbage_fails_to_decode() {
        // A truncated varint header cannot decode as an envelope.
        let garbage: &[u8] = &[0x0a, 0xff];
        assert!(ProbeMessage::decode(garbage).is_err());
    }

    #[test]
    fn terminal_status_classification() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn unknown_enum_values_degrade_to_unspecified() {
        let out = TaskOutput {
            status: 42,
            ..Default::default()
        };
        assert_eq!(out.task_status(), TaskStatus::Unspecified);
    }
}
