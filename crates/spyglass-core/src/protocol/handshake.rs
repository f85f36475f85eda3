//! Stream handshake: version negotiation and credential presentation.
//!
//! The probe opens its stream with a [`Hello`] frame carrying the
//! protocol version and the shared secret; the coordinator answers with
//! a [`HelloAck`]. No application envelope may flow before the ack is
//! accepted. A rejected handshake terminates the connection — there is
//! no retry at this layer (the probe's reconnect loop handles that).
//!
//! The handshake frames ride the same length-prefixed framing as the
//! envelopes but are a distinct message pair, so a peer speaking the
//! wrong protocol fails fast at setup instead of mid-stream.
//!
//! The helpers are generic over a frame [`Stream`]/[`Sink`] pair, so
//! they work both with a whole [`Framed`](tokio_util::codec::Framed)
//! transport and with split `FramedRead`/`FramedWrite` halves.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use prost::Message;

use super::error::{ProtocolError, ProtocolResult, PROTOCOL_VERSION};

/// Opening frame sent by the connecting side.
#[derive(Clone, PartialEq, Message)]
pub struct Hello {
    /// Protocol version the peer speaks.
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    /// Shared secret presented for authentication.
    #[prost(string, tag = "2")]
    pub api_key: String,
}

/// Accepting side's reply to a [`Hello`].
#[derive(Clone, PartialEq, Message)]
pub struct HelloAck {
    /// Whether the connection is accepted.
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    /// Human-readable detail on rejection.
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Run the connecting side of the handshake.
///
/// Sends a [`Hello`] with the current protocol version and awaits the
/// [`HelloAck`].
///
/// # Errors
///
/// Returns [`ProtocolError::HandshakeRejected`] if the peer declines,
/// [`ProtocolError::ConnectionClosed`] if the stream ends early, or a
/// framing/decode error.
pub async fn connect<R, W>(reader: &mut R, writer: &mut W, api_key: &str) -> ProtocolResult<()>
where
    R: Stream<Item = ProtocolResult<Bytes>> + Unpin,
    W: Sink<Bytes, Error = ProtocolError> + Unpin,
{
    let hello = Hello {
        protocol_version: PROTOCOL_VERSION,
        api_key: api_key.to_string(),
    };
    writer.send(hello.encode_to_vec().into()).await?;

    let frame = reader
        .next()
        .await
        .ok_or(ProtocolError::ConnectionClosed("handshake"))??;
    let ack = HelloAck::decode(frame.as_ref())?;

    if ack.accepted {
        Ok(())
    } else {
        Err(ProtocolError::HandshakeRejected(ack.message))
    }
}

/// Read the opening [`Hello`] on the accepting side.
///
/// A protocol-version mismatch is refused here; otherwise the caller
/// validates the credential and peer address, then answers with
/// [`respond`].
///
/// # Errors
///
/// Returns [`ProtocolError::ConnectionClosed`] if the stream ends
/// before a frame arrives, or a framing/decode error.
pub async fn accept<R, W>(reader: &mut R, writer: &mut W) -> ProtocolResult<Hello>
where
    R: Stream<Item = ProtocolResult<Bytes>> + Unpin,
    W: Sink<Bytes, Error = ProtocolError> + Unpin,
{
    let frame = reader
        .next()
        .await
        .ok_or(ProtocolError::ConnectionClosed("handshake"))??;
    let hello = Hello::decode(frame.as_ref())?;

    if hello.protocol_version != PROTOCOL_VERSION {
        respond(writer, false, "unsupported protocol version").await?;
        return Err(ProtocolError::UnexpectedMessage("protocol version mismatch"));
    }

    Ok(hello)
}

/// Send the [`HelloAck`] verdict on the accepting side.
///
/// # Errors
///
/// Returns a framing error if the ack cannot be written.
pub async fn respond<W>(writer: &mut W, accepted: bool, message: &str) -> ProtocolResult<()>
where
    W: Sink<Bytes, Error = ProtocolError> + Unpin,
{
    let ack = HelloAck {
        accepted,
        message: message.to_string(),
    };
    writer.send(ack.encode_to_vec().into()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio_util::codec::Framed;

    use super::super::framing::FrameCodec;
    use super::*;

    #[tokio::test]
    async fn accepted_handshake_completes_both_sides() {
        let (client, server) = tokio::io::duplex(4096);
        let client = Framed::new(client, FrameCodec::new());
        let server = Framed::new(server, FrameCodec::new());

        let client_side = tokio::spawn(async move {
            let (mut writer, mut reader) = client.split();
            connect(&mut reader, &mut writer, "secret").await.unwrap();
        });

        let (mut writer, mut reader) = server.split();
        let hello = accept(&mut reader, &mut writer).await.unwrap();
        assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
        assert_eq!(hello.api_key, "secret");
        respond(&mut writer, true, "welcome").await.unwrap();

        client_side.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_handshake_surfaces_reason() {
        let (client, server) = tokio::io::duplex(4096);
        let client = Framed::new(client, FrameCodec::new());
        let server = Framed::new(server, FrameCodec::new());

        let server_side = tokio::spawn(async move {
            let (mut writer, mut reader) = server.split();
            let _hello = accept(&mut reader, &mut writer).await.unwrap();
            respond(&mut writer, false, "invalid API key").await.unwrap();
        });

        let (mut writer, mut reader) = client.split();
        let err = connect(&mut reader, &mut writer, "wrong").await.unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeRejected(msg) if msg == "invalid API key"));
        server_side.await.unwrap();
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = Framed::new(client, FrameCodec::new());
        let server = Framed::new(server, FrameCodec::new());

        let client_side = tokio::spawn(async move {
            let hello = Hello {
                protocol_version: PROTOCOL_VERSION + 1,
                api_key: "secret".to_string(),
            };
            futures::SinkExt::send(&mut client, hello.encode_to_vec().into())
                .await
                .unwrap();
            let frame = client.next().await.unwrap().unwrap();
            let ack = HelloAck::decode(frame.as_ref()).unwrap();
            assert!(!ack.accepted);
        });

        let (mut writer, mut reader) = server.split();
        let err = accept(&mut reader, &mut writer).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage(_)));
        client_side.await.unwrap();
    }
}
