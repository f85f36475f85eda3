//! Protocol error types.

/// Current protocol version, negotiated during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size accepted on any spyglass stream (512 KiB).
///
/// Diagnostic output is line-oriented and small; a frame anywhere near
/// this limit indicates a broken or hostile peer. The length prefix is
/// validated against this cap before any allocation happens.
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// Errors produced by the framing and handshake layers.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A frame's length prefix exceeded the maximum allowed size.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Payload bytes did not decode as the expected message type.
    ///
    /// The stream is unrecoverable after this; the owner must tear it
    /// down.
    #[error("malformed message: {0}")]
    Malformed(#[from] prost::DecodeError),

    /// Transport-level I/O failure.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer rejected our handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The peer closed the stream before the exchange completed.
    #[error("connection closed during {0}")]
    ConnectionClosed(&'static str),

    /// The peer sent a message the current protocol phase does not allow.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),
}

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
