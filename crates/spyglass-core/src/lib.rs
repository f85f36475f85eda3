//! # spyglass-core
//!
//! Shared library for spyglass — a distributed network-diagnostics fabric
//! in which a central coordinator dispatches short-lived diagnostic jobs
//! (ping, mtr, traceroute, arbitrary configured commands) to a fleet of
//! remote probes and streams their line-oriented output back to clients.
//!
//! This crate holds everything both sides of the probe stream must agree
//! on:
//!
//! - **Wire protocol**: length-prefixed binary framing, the pre-message
//!   handshake, and the prost message envelopes ([`protocol`]).
//! - **Reconnect policy**: the exponential backoff used by probes when the
//!   coordinator is unreachable ([`backoff`]).
//! - **Address masking**: privacy masking of probe IP addresses before
//!   disclosure to clients ([`netutil`]).
//!
//! ## Example
//!
//! ```rust
//! use spyglass_core::protocol::{CoordMessage, coord_message};
//!
//! let msg = CoordMessage {
//!     request_id: "req-1".to_string(),
//!     payload: Some(coord_message::Payload::CancelTask(
//!         spyglass_core::protocol::CancelTask {
//!             task_id: "T1".to_string(),
//!         },
//!     )),
//! };
//! let bytes = spyglass_core::protocol::encode_coord_message(&msg);
//! let decoded = spyglass_core::protocol::decode_coord_message(&bytes).unwrap();
//! assert_eq!(msg, decoded);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod netutil;
pub mod protocol;

pub use backoff::ReconnectBackoff;
pub use protocol::{FrameCodec, ProtocolError};
