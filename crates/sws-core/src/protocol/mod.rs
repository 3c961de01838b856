//! Packet layer of the SWS tunnel.
//!
//! A packet on the wire is `Packet { Id, Msg }` encoded as a MessagePack
//! map. Client-to-server frames additionally wrap the MessagePack bytes
//! in hex ASCII; server-to-client frames are raw binary. Both quirks are
//! preserved from the original wire format and must not be "fixed".
//!
//! Payload types carry only primitive fields, fixed byte arrays, and
//! homogeneous sequences. Field names serialize in PascalCase to match
//! the deployed clients.

mod error;
mod framing;
mod payload;

pub use error::FrameError;
pub use framing::{decode_frame, decode_payload, encode_frame, encode_packet, encode_payload};
pub use payload::{
    AnalyticsInfo, BootRequest, BootResponse, DropPacket, FingerprintInfo, FreezePacket,
    HandshakeRequest, HandshakeResponse, IdentifyRequest, IdentifyResponse, JoinInfo, KeyInfo,
    KeyUpdatePacket, LoadRequest, LoadResponse, SessionInfo, SubInfo, VersionInfo,
};

use serde::{Deserialize, Serialize};

/// Packet identifiers of the SWS protocol.
///
/// `Bootstrap` through `Load` are request/response pairs that advance the
/// subscription through its stages. `Dropping` and `KeyUpdate` are pushed
/// by the server only. `Freeze` is a client notification that is accepted
/// at any point after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Key lookup and gating; first packet of every subscription.
    Bootstrap = 0,
    /// X25519 exchange installing the crypto envelope.
    Handshake = 1,
    /// Identity report, policy evaluation, and record materialization.
    Identify = 2,
    /// Script selection for the current game.
    Load = 3,
    /// Server-to-client close notification with a reason.
    Dropping = 4,
    /// Server-to-client role change push.
    KeyUpdate = 5,
    /// Client-to-server freeze report, logging only.
    Freeze = 6,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, u8> {
        match id {
            0 => Ok(Self::Bootstrap),
            1 => Ok(Self::Handshake),
            2 => Ok(Self::Identify),
            3 => Ok(Self::Load),
            4 => Ok(Self::Dropping),
            5 => Ok(Self::KeyUpdate),
            6 => Ok(Self::Freeze),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Bootstrap => "Bootstrap",
            Self::Handshake => "Handshake",
            Self::Identify => "Identify",
            Self::Load => "Load",
            Self::Dropping => "Dropping",
            Self::KeyUpdate => "KeyUpdate",
            Self::Freeze => "Freeze",
        };
        f.write_str(name)
    }
}

/// The outer message format exchanged over the WebSocket.
///
/// `msg` holds the MessagePack-encoded payload for `id`; after the
/// handshake it is the sealed envelope frame instead of plaintext
/// MessagePack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Packet {
    /// Packet identifier, see [`Opcode`].
    pub id: u8,
    /// Payload bytes.
    #[serde(with = "serde_bytes")]
    pub msg: Vec<u8>,
}
