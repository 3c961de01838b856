//! Load stage: script selection.

use std::sync::Arc;

use tracing::info;

use sws_core::model::Key;
use sws_core::protocol::{LoadRequest, LoadResponse, Opcode, Packet};
use sws_core::record::Params;

use crate::error::SessionError;
use crate::server::Server;
use crate::stages::Stage;
use crate::subscription::{Subscription, state};

/// Handle the sealed load request.
///
/// Looks up the script bound to (project, game), applies the pentester
/// restriction, and hands back the script id. The script bytes
/// themselves are fetched from the store by id out of band; the hot
/// path never touches the blob.
pub(super) fn handle(
    server: &Arc<Server>,
    sub: &Arc<Subscription>,
    packet: &Packet,
) -> Result<Stage, SessionError> {
    let request: LoadRequest = sub.open_sealed(&packet.msg)?;

    let boot = sub
        .boot()
        .ok_or_else(|| SessionError::Internal("load before bootstrap".to_owned()))?;

    let script = server
        .store
        .find_first_record_by_filter(
            "scripts",
            "project = {:projectId} && game = {:gameId}",
            &Params::new()
                .set("projectId", boot.project.id.as_str())
                .set("gameId", request.game_id),
        )?
        .ok_or_else(|| SessionError::policy("no script for your current game"))?;

    let key = Key::find(server.store.as_ref(), &boot.key_id)?;
    if key.role() == "pentest" && request.game_id != server.config.baseplate_game_id {
        return Err(SessionError::policy(
            "pentester roles can only load in a baseplate game",
        ));
    }

    sub.add_state(state::LOADED);
    info!(game_id = request.game_id, script_id = %script.id, "script loaded");

    sub.send_sealed(
        Opcode::Load,
        &LoadResponse {
            script_id: script.id,
        },
    )?;

    Ok(Stage::Steady)
}
