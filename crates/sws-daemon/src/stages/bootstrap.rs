//! Bootstrap stage: key lookup and gating.

use std::sync::Arc;

use tracing::info;

use sws_core::model::Key;
use sws_core::protocol::{BootRequest, BootResponse, Opcode, Packet, decode_payload};
use sws_core::record::StoreError;

use crate::error::SessionError;
use crate::server::Server;
use crate::stages::Stage;
use crate::subscription::{BootContext, ProjectSnapshot, Subscription, state};

/// Handle the boot request.
///
/// Gate order: key exists, discord binding present, project resolvable,
/// not expired, not blacklisted. Every gate closes the connection
/// without touching the key record. On success the boot context is
/// pinned, the state advances, and the connection context goes back to
/// the client.
pub(super) fn handle(
    server: &Arc<Server>,
    sub: &Arc<Subscription>,
    packet: &Packet,
) -> Result<Stage, SessionError> {
    let request: BootRequest = decode_payload(&packet.msg)?;

    let key = match Key::find(server.store.as_ref(), &request.key_id) {
        Ok(key) => key,
        Err(StoreError::NotFound { .. }) => {
            return Err(SessionError::policy("key not found"));
        }
        Err(err) => return Err(err.into()),
    };

    let discord_id = key
        .discord_id()
        .map_err(|err| SessionError::policy(err.to_string()))?
        .to_owned();

    let project = key
        .project(server.store.as_ref())
        .map_err(|err| SessionError::policy(err.to_string()))?;
    let snapshot = ProjectSnapshot {
        id: project.id().to_owned(),
        point: project
            .point()
            .map_err(|err| SessionError::Internal(err.to_string()))?,
        salt: project
            .salt()
            .map_err(|err| SessionError::Internal(err.to_string()))?,
        alert_webhook: project.alert_webhook().to_owned(),
    };

    if key.expired(sub.base_timestamp) {
        return Err(SessionError::policy("key expired"));
    }

    if key.blacklist().is_some() {
        return Err(SessionError::policy("key blacklisted"));
    }

    info!(
        key_id = %key.id(),
        discord_id = %discord_id,
        exploit_name = %request.exploit_name,
        "booting subscription"
    );

    sub.install_boot(BootContext {
        key_id: key.id().to_owned(),
        discord_id,
        project: snapshot,
        exploit_name: request.exploit_name,
    });
    sub.add_state(state::BOOTSTRAPPED);

    sub.send_message(
        Opcode::Bootstrap,
        &BootResponse {
            base_timestamp: sub.base_timestamp,
            sub_id: *sub.sub_id.as_bytes(),
        },
    )?;

    Ok(Stage::Handshake)
}
