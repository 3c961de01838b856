//! Identify stage: record materialization and policy evaluation.

use std::sync::Arc;

use tracing::{info, warn};

use sws_core::alert::{AlertIdentity, AlertKind};
use sws_core::model::Key;
use sws_core::policy;
use sws_core::protocol::{IdentifyRequest, IdentifyResponse, Opcode, Packet};
use sws_core::record::{FieldMap, Record, Value, expect_keyed_record};

use crate::error::SessionError;
use crate::server::Server;
use crate::stages::{Stage, blacklist};
use crate::subscription::{BootContext, Subscription, state};

/// Handle the sealed identity report.
///
/// In order: materialize the per-connection records, gate on the lua
/// environment, check blacklist links, check identity mismatches, log
/// association hits, and evaluate the BOLO probes. Only then does the
/// stage advance and the role go back to the client.
pub(super) async fn handle(
    server: &Arc<Server>,
    sub: &Arc<Subscription>,
    packet: &Packet,
) -> Result<Stage, SessionError> {
    let request: IdentifyRequest = sub.open_sealed(&packet.msg)?;

    let boot = sub
        .boot()
        .ok_or_else(|| SessionError::Internal("identify before bootstrap".to_owned()))?
        .clone();

    // Refetch so the role and blacklist enforcement see current data.
    let key = Key::find(server.store.as_ref(), &boot.key_id)?;

    let (_, fingerprint_row, analytics_row) = materialize(server, sub, &boot, &request)?;

    let version = &request.sub_info.version_info;
    if version.lua_version != "Luau" {
        warn!(lua_version = %version.lua_version, "bad environment");
        return Err(blacklist(server, sub, "invalid lua version").await);
    }

    let fingerprint = &request.key_info.fingerprint_info;
    let analytics = &request.key_info.analytics_info;
    let session = &request.sub_info.session_info;
    let join = &request.sub_info.join_info;

    if let Some(outcome) =
        policy::check_blacklist(server.store.as_ref(), &sub.ip, fingerprint, session)?
    {
        let reason = format!("linked key with blacklist ({})", outcome.code());
        return Err(blacklist(server, sub, &reason).await);
    }

    if let Some(outcome) = policy::check_mismatch(
        fingerprint,
        &fingerprint_row,
        &analytics_row,
        analytics,
        &boot.exploit_name,
    ) {
        return Err(SessionError::policy(format!(
            "reset your HWID on the panel ({})",
            outcome.code()
        )));
    }

    let association_hits = policy::check_association(join);
    if !association_hits.is_empty() {
        warn!(?association_hits, "key is associated to marked users");
    }

    let mask = policy::bolo_mask(
        server.store.as_ref(),
        &sub.ip,
        session,
        join,
        sub.base_timestamp,
        server.config.cpu_start_mode,
    )?;
    if !mask.is_empty() {
        info!(bits = mask.bits(), "BOLO probes matched");
        server
            .alerts
            .dispatch(
                &boot.project.alert_webhook,
                AlertKind::Bolo,
                &AlertIdentity {
                    sub_id: sub.sub_id.to_string(),
                    key_id: boot.key_id.clone(),
                    discord_id: boot.discord_id.clone(),
                },
            )
            .await;
    }

    sub.add_state(state::IDENTIFIED);

    sub.send_sealed(
        Opcode::Identify,
        &IdentifyResponse {
            current_role: key.role().to_owned(),
        },
    )?;

    Ok(Stage::Load)
}

/// Create the per-connection rows and get-or-create the per-key rows.
///
/// The subscriptions, sessions, and joins rows are new for every
/// connection; analytics and fingerprints are pinned on first identify
/// and only read afterwards.
fn materialize(
    server: &Arc<Server>,
    sub: &Arc<Subscription>,
    boot: &BootContext,
    request: &IdentifyRequest,
) -> Result<(Record, Record, Record), SessionError> {
    let store = server.store.as_ref();
    let analytics = &request.key_info.analytics_info;
    let fingerprint = &request.key_info.fingerprint_info;
    let session = &request.sub_info.session_info;
    let join = &request.sub_info.join_info;

    let subscription_row = store.create(
        "subscriptions",
        FieldMap::from([
            ("key".to_owned(), Value::from(boot.key_id.as_str())),
            ("sid".to_owned(), Value::from(sub.sub_id.to_string())),
        ]),
    )?;

    let analytics_row = expect_keyed_record(
        store,
        "analytics",
        &boot.key_id,
        FieldMap::from([
            ("dst".to_owned(), Value::from(analytics.daylight_savings_time)),
            ("region".to_owned(), Value::from(analytics.region.as_str())),
            (
                "locale".to_owned(),
                Value::from(analytics.system_locale_id.as_str()),
            ),
            ("key".to_owned(), Value::from(boot.key_id.as_str())),
        ]),
    )?;

    let fingerprint_row = expect_keyed_record(
        store,
        "fingerprints",
        &boot.key_id,
        FieldMap::from([
            ("deviceType".to_owned(), Value::from(fingerprint.device_type)),
            (
                "exploitHwid".to_owned(),
                Value::from(fingerprint.exploit_hwid.as_str()),
            ),
            (
                "exploitName".to_owned(),
                Value::from(boot.exploit_name.as_str()),
            ),
            ("ipAddress".to_owned(), Value::from(sub.ip.as_str())),
            ("key".to_owned(), Value::from(boot.key_id.as_str())),
        ]),
    )?;

    let cpu_start = policy::cpu_start(
        server.config.cpu_start_mode,
        sub.base_timestamp,
        session.os_clock,
    );
    store.create(
        "sessions",
        FieldMap::from([
            ("cpuStart".to_owned(), Value::from(cpu_start)),
            (
                "playSessionId".to_owned(),
                Value::from(session.play_session_id.as_str()),
            ),
            (
                "robloxSessionId".to_owned(),
                Value::from(session.roblox_session_id.as_str()),
            ),
            (
                "robloxClientId".to_owned(),
                Value::from(session.roblox_client_id.as_str()),
            ),
            (
                "workspaceScan".to_owned(),
                Value::from(session.workspace_scan.clone()),
            ),
            (
                "logHistory".to_owned(),
                Value::from(session.log_history.clone()),
            ),
            (
                "subscription".to_owned(),
                Value::from(subscription_row.id.as_str()),
            ),
        ]),
    )?;

    store.create(
        "joins",
        FieldMap::from([
            ("userId".to_owned(), Value::from(join.user_id)),
            ("userName".to_owned(), Value::from(join.user_name.as_str())),
            ("accountAge".to_owned(), Value::from(join.account_age)),
            ("placeId".to_owned(), Value::from(join.place_id)),
            (
                "subscription".to_owned(),
                Value::from(subscription_row.id.as_str()),
            ),
        ]),
    )?;

    Ok((subscription_row, fingerprint_row, analytics_row))
}
