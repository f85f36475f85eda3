//! Wire protocol for the probe and client streams.
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application envelopes           │  prost (messages)
//! ├─────────────────────────────────────────┤
//! │              Handshake                   │  Hello/HelloAck
//! ├─────────────────────────────────────────┤
//! │               Framing                    │  Length-prefixed
//! ├─────────────────────────────────────────┤
//! │              Transport                   │  TCP / WebSocket
//! └─────────────────────────────────────────┘
//! ```
//!
//! The probe↔coordinator stream is raw TCP carrying length-prefixed
//! frames ([`FrameCodec`]); a [`handshake::Hello`] frame carrying the
//! shared secret must be accepted before any envelope flows. The
//! client↔coordinator session rides WebSocket binary messages, which are
//! already framed, so only the prost layer applies there.
//!
//! This module is the only place that knows the wire layout. Every other
//! component consumes the typed structs in [`messages`]. A decode failure
//! surfaces as [`ProtocolError::Malformed`] and the caller is expected to
//! tear the stream down.

pub mod error;
pub mod framing;
pub mod handshake;
pub mod messages;

pub use error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use framing::FrameCodec;
pub use handshake::{Hello, HelloAck};
pub use messages::*;

use prost::Message;

/// Encode a probe→coordinator envelope to its wire bytes.
#[must_use]
pub fn encode_probe_message(msg: &ProbeMessage) -> bytes::Bytes {
    msg.encode_to_vec().into()
}

/// Decode a probe→coordinator envelope from wire bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if the bytes are not a valid
/// `ProbeMessage`.
pub fn decode_probe_message(buf: &[u8]) -> ProtocolResult<ProbeMessage> {
    ProbeMessage::decode(buf).map_err(ProtocolError::Malformed)
}

/// Encode a coordinator→probe envelope to its wire bytes.
#[must_use]
pub fn encode_coord_message(msg: &CoordMessage) -> bytes::Bytes {
    msg.encode_to_vec().into()
}

/// Decode a coordinator→probe envelope from wire bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if the bytes are not a valid
/// `CoordMessage`.
pub fn decode_coord_message(buf: &[u8]) -> ProtocolResult<CoordMessage> {
    CoordMessage::decode(buf).map_err(ProtocolError::Malformed)
}
