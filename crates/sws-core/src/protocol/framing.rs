//! Byte-level framing for the SWS wire format.
//!
//! Inbound (client to server) WebSocket messages carry the MessagePack
//! encoding of a [`Packet`] as hex ASCII. Outbound (server to client)
//! messages are the raw MessagePack bytes. The asymmetry is part of the
//! deployed wire format and is preserved bit-exact.
//!
//! The decoder enforces three things before a packet reaches dispatch:
//!
//! - the raw message is within the read limit, checked before any
//!   allocation or decoding
//! - the hex layer and the MessagePack body are both well formed
//! - no trailing bytes follow a complete payload

use std::io::Cursor;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Packet;
use super::error::FrameError;

/// Decode one inbound WebSocket message into a [`Packet`].
///
/// `limit` is the maximum accepted size of the raw message, validated
/// first so oversized frames are rejected without decoding work.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] for oversized messages, and the
/// matching variant for hex, MessagePack, or trailing-byte failures.
pub fn decode_frame(raw: &[u8], limit: usize) -> Result<Packet, FrameError> {
    if raw.len() > limit {
        return Err(FrameError::TooLarge {
            size: raw.len(),
            max: limit,
        });
    }

    let bytes = hex::decode(raw)?;
    decode_payload(&bytes)
}

/// Encode a [`Packet`] into one outbound WebSocket message.
///
/// Outbound frames are raw MessagePack, with no hex layer.
///
/// # Errors
///
/// Returns [`FrameError::Encode`] if serialization fails.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, FrameError> {
    encode_payload(packet)
}

/// Encode a [`Packet`] the way a client would put it on the wire.
///
/// This is the hex ASCII form of the MessagePack encoding. The server
/// never sends this form; it exists for client implementations and for
/// the test suite.
///
/// # Errors
///
/// Returns [`FrameError::Encode`] if serialization fails.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameError> {
    Ok(hex::encode(encode_payload(packet)?).into_bytes())
}

/// Encode a payload value as a map-keyed MessagePack document.
///
/// # Errors
///
/// Returns [`FrameError::Encode`] if serialization fails.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    rmp_serde::to_vec_named(value).map_err(|err| FrameError::Encode(err.to_string()))
}

/// Decode a MessagePack payload, rejecting trailing bytes.
///
/// # Errors
///
/// Returns [`FrameError::Decode`] on a malformed body and
/// [`FrameError::TrailingBytes`] when the document ends before the
/// input does.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    let mut cursor = Cursor::new(bytes);
    let value: T =
        rmp_serde::from_read(&mut cursor).map_err(|err| FrameError::Decode(err.to_string()))?;

    let consumed = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
    if consumed != bytes.len() {
        return Err(FrameError::TrailingBytes {
            remaining: bytes.len() - consumed,
        });
    }

    Ok(value)
}
