//! Framing errors.

use thiserror::Error;

/// Errors raised while encoding or decoding wire frames and payloads.
///
/// Every decode failure maps to the client-visible "malformed frame"
/// drop; the variants exist so logs can tell the failure modes apart.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The raw WebSocket message exceeds the configured read limit.
    ///
    /// The size is validated before any decoding work happens.
    #[error("frame too large: {size} bytes exceeds limit of {max}")]
    TooLarge {
        /// Observed message size in bytes.
        size: usize,
        /// Configured limit in bytes.
        max: usize,
    },

    /// The hex ASCII layer of an inbound frame did not decode.
    #[error("invalid hex framing: {0}")]
    Hex(#[from] hex::FromHexError),

    /// The MessagePack body did not decode into the expected shape.
    #[error("invalid messagepack: {0}")]
    Decode(String),

    /// Bytes were left over after a complete payload was decoded.
    #[error("trailing bytes after payload: {remaining} left")]
    TrailingBytes {
        /// Number of undecoded bytes.
        remaining: usize,
    },

    /// A payload failed to serialize. Indicates a server-side bug rather
    /// than bad peer input.
    #[error("failed to encode payload: {0}")]
    Encode(String),
}
