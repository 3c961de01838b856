//! Handshake stage: X25519 exchange and envelope installation.

use std::sync::Arc;

use sws_core::envelope::Envelope;
use sws_core::protocol::{
    HandshakeRequest, HandshakeResponse, Opcode, Packet, decode_payload,
};

use crate::error::SessionError;
use crate::server::Server;
use crate::stages::Stage;
use crate::subscription::{Subscription, state};

/// Handle the client public key.
///
/// Derives the envelope from the project material and the client point,
/// installs it, and replies with the server public point. The reply is
/// the last unauthenticated message of the connection. Any crypto
/// failure closes the subscription without advancing state.
pub(super) fn handle(
    _server: &Arc<Server>,
    sub: &Arc<Subscription>,
    packet: &Packet,
) -> Result<Stage, SessionError> {
    let request: HandshakeRequest = decode_payload(&packet.msg)?;

    let boot = sub
        .boot()
        .ok_or_else(|| SessionError::Internal("handshake before bootstrap".to_owned()))?;

    let (envelope, server_public) = Envelope::derive(
        &request.client_public_key,
        &boot.project.point,
        &boot.project.salt,
    )?;

    sub.install_envelope(envelope);
    sub.add_state(state::HANDSHAKED);

    sub.send_message(
        Opcode::Handshake,
        &HandshakeResponse {
            server_public_key: server_public,
        },
    )?;

    Ok(Stage::Identify)
}
