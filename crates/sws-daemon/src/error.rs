//! Session error taxonomy.

use thiserror::Error;

use sws_core::envelope::EnvelopeError;
use sws_core::protocol::FrameError;
use sws_core::record::StoreError;

/// Everything that can terminate packet handling for a subscription.
///
/// The variants map onto the client-visible drop reasons; details that
/// must not leak (crypto specifics, store internals) are collapsed by
/// [`SessionError::close_reason`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// Bad hex, bad MessagePack, or an oversized frame.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// MAC verification or decryption failure.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// A packet arrived for the wrong stage, or with an id the current
    /// handler does not own.
    #[error("handler is not in the correct state")]
    OutOfStage {
        /// Stage the subscription was in.
        stage: &'static str,
        /// Offending packet id.
        packet_id: u8,
    },

    /// A policy gate closed the connection without blacklisting.
    #[error("{0}")]
    Policy(String),

    /// The key was blacklisted while handling this packet.
    #[error("you have been blacklisted")]
    Blacklisted,

    /// Record store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The outbound queue was full.
    #[error("cannot keep up with packets")]
    QueueFull,

    /// Invariant violation inside the server.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Policy close with an owned reason.
    pub fn policy(reason: impl Into<String>) -> Self {
        Self::Policy(reason.into())
    }

    /// The reason string put into the `Dropping` packet.
    ///
    /// Crypto and backend failures collapse to fixed strings so nothing
    /// internal leaks to the peer.
    #[must_use]
    pub fn close_reason(&self) -> String {
        match self {
            Self::Frame(_) => "malformed frame".to_owned(),
            Self::Envelope(_) => "mac signature verification failed".to_owned(),
            Self::OutOfStage { .. } => "handler is not in the correct state".to_owned(),
            Self::Policy(reason) => reason.clone(),
            Self::Blacklisted => "you have been blacklisted".to_owned(),
            Self::Store(_) | Self::Internal(_) => "internal error".to_owned(),
            Self::QueueFull => "cannot keep up with packets".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_do_not_leak_internals() {
        let err = SessionError::Store(StoreError::NotFound {
            collection: "keys".to_owned(),
            id: "secret-key-id".to_owned(),
        });
        assert_eq!(err.close_reason(), "internal error");

        let err = SessionError::Envelope(EnvelopeError::DegenerateSharedSecret);
        assert_eq!(err.close_reason(), "mac signature verification failed");
    }

    #[test]
    fn policy_reasons_pass_through() {
        let err = SessionError::policy("key expired");
        assert_eq!(err.close_reason(), "key expired");
    }
}
