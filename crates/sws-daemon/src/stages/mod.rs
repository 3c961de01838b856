//! The protocol state machine and its stage handlers.
//!
//! A subscription is always in exactly one [`Stage`]. Each stage owns
//! one expected opcode and a guard over the state bitmask; a packet
//! that fails either check drops the subscription with a protocol
//! error. Handlers are transitions: given the packet and the
//! subscription they mutate state bits, enqueue replies, and return the
//! next stage.
//!
//! Progression is strictly forward:
//!
//! ```text
//! Bootstrap -> Handshake -> Identify -> Load -> Steady
//! ```
//!
//! `Freeze` packets break the pattern: once the envelope exists they
//! are accepted regardless of the current stage, logged, and discarded.
//! In the steady state no other client packet is valid; traffic from
//! the server (`KeyUpdate`, `Dropping`) flows only outward.

mod bootstrap;
mod handshake;
mod identify;
mod load;

use std::sync::Arc;

use tracing::warn;

use sws_core::alert::{AlertIdentity, AlertKind};
use sws_core::protocol::{FreezePacket, Opcode, Packet};

use crate::error::SessionError;
use crate::server::Server;
use crate::subscription::{Subscription, state};

/// Position of a subscription in the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the boot request.
    Bootstrap,
    /// Waiting for the client public key.
    Handshake,
    /// Waiting for the sealed identity report.
    Identify,
    /// Waiting for the sealed load request.
    Load,
    /// Loaded; no further client packets are expected.
    Steady,
}

impl Stage {
    /// The packet id this stage accepts, if any.
    #[must_use]
    pub fn expected_opcode(self) -> Option<Opcode> {
        match self {
            Self::Bootstrap => Some(Opcode::Bootstrap),
            Self::Handshake => Some(Opcode::Handshake),
            Self::Identify => Some(Opcode::Identify),
            Self::Load => Some(Opcode::Load),
            Self::Steady => None,
        }
    }

    /// Whether the state bitmask permits this stage to run.
    ///
    /// Each stage requires every earlier bit and rejects its own, which
    /// is what makes the machine monotonic.
    #[must_use]
    pub fn guard(self, bits: u32) -> bool {
        let has = |flag| bits & flag == flag;
        let lacks = |flag| bits & flag == 0;
        match self {
            Self::Bootstrap => lacks(state::BOOTSTRAPPED),
            Self::Handshake => has(state::BOOTSTRAPPED) && lacks(state::HANDSHAKED),
            Self::Identify => has(state::HANDSHAKED) && lacks(state::IDENTIFIED),
            Self::Load => has(state::IDENTIFIED) && lacks(state::LOADED),
            Self::Steady => has(state::LOADED),
        }
    }

    /// Stage name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Handshake => "handshake",
            Self::Identify => "identify",
            Self::Load => "load",
            Self::Steady => "steady",
        }
    }
}

/// Dispatch one decoded packet and map failures onto the single
/// subscription close.
///
/// This is the entry point both the reader task and the integration
/// tests use. The returned error signals the reader to stop; the close
/// itself has already happened by then.
///
/// # Errors
///
/// Any dispatch or handler failure, after the subscription has been
/// closed with the matching reason.
pub async fn handle_packet(
    server: &Arc<Server>,
    sub: &Arc<Subscription>,
    stage: &mut Stage,
    packet: Packet,
) -> Result<(), SessionError> {
    match dispatch(server, sub, stage, packet).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if !sub.is_closing() {
                sub.close(&err.close_reason());
            }
            Err(err)
        }
    }
}

/// Route a packet to its stage handler, enforcing opcode and guard.
async fn dispatch(
    server: &Arc<Server>,
    sub: &Arc<Subscription>,
    stage: &mut Stage,
    packet: Packet,
) -> Result<(), SessionError> {
    // Freeze reports bypass the stage pointer once the envelope exists.
    if packet.id == Opcode::Freeze as u8 && sub.has_state(state::HANDSHAKED) {
        return handle_freeze(sub, &packet);
    }

    let expected = stage.expected_opcode().map(|op| op as u8);
    if expected != Some(packet.id) || !stage.guard(sub.state()) {
        return Err(SessionError::OutOfStage {
            stage: stage.name(),
            packet_id: packet.id,
        });
    }

    let next = match stage {
        Stage::Bootstrap => bootstrap::handle(server, sub, &packet)?,
        Stage::Handshake => handshake::handle(server, sub, &packet)?,
        Stage::Identify => identify::handle(server, sub, &packet).await?,
        Stage::Load => load::handle(server, sub, &packet)?,
        // Steady has no expected opcode, so the check above already
        // rejected the packet.
        Stage::Steady => unreachable!("steady stage accepts no packets"),
    };

    *stage = next;
    Ok(())
}

/// Log a freeze report. The packet is sealed like all post-handshake
/// traffic but carries no state transition.
fn handle_freeze(sub: &Subscription, packet: &Packet) -> Result<(), SessionError> {
    let report: FreezePacket = sub.open_sealed(&packet.msg)?;
    warn!(seconds = report.seconds, "client reported a freeze");
    Ok(())
}

/// Blacklist the subscription's key and terminate the connection.
///
/// The close is claimed first so the client-visible drop carries the
/// enforcement reason; the record write that follows fires the key
/// bridge, which skips subscriptions that are already closing. The
/// write itself is a plain field set and is idempotent across retries.
/// In testing mode the write is logged and skipped.
///
/// Always returns the error the handler should bubble.
pub(crate) async fn blacklist(
    server: &Arc<Server>,
    sub: &Arc<Subscription>,
    reason: &str,
) -> SessionError {
    sub.close("you have been blacklisted");

    let Some(boot) = sub.boot() else {
        return SessionError::Internal("blacklist before bootstrap".to_owned());
    };

    warn!(key_id = %boot.key_id, reason, "blacklisting key");

    if server.config.testing_mode {
        warn!(key_id = %boot.key_id, reason, "testing mode: blacklist not persisted");
    } else {
        match server.store.find_record_by_id("keys", &boot.key_id) {
            Ok(mut record) => {
                record.set("blacklist", reason);
                if let Err(err) = server.store.save(&record) {
                    warn!(error = %err, "failed to persist blacklist");
                }
            }
            Err(err) => warn!(error = %err, "failed to load key for blacklist"),
        }
    }

    server
        .alerts
        .dispatch(
            &boot.project.alert_webhook,
            AlertKind::Blacklist,
            &AlertIdentity {
                sub_id: sub.sub_id.to_string(),
                key_id: boot.key_id.clone(),
                discord_id: boot.discord_id.clone(),
            },
        )
        .await;

    SessionError::Blacklisted
}
