//! Per-connection state and the three cooperating tasks.
//!
//! Every accepted WebSocket becomes one [`Subscription`] shared between
//! a reader task, a writer task, and a watchdog. The reader is the only
//! task that dispatches packets, so handlers never race each other; the
//! writer owns the socket's send half and drains a bounded queue; the
//! watchdog drops subscriptions that dawdle before Load.
//!
//! Cancellation is cooperative: the first task to fail (or an external
//! close) cancels the shared token, and every loop observes it within
//! one iteration because all blocking points carry deadlines.
//!
//! # Invariants
//!
//! - state bits are set in stage order and never cleared
//! - the boot context and the envelope are installed at most once
//! - `close` runs at most once; later callers are no-ops
//! - outbound enqueue never blocks; a full queue drops the subscription

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use sws_core::envelope::{Envelope, EnvelopeContext};
use sws_core::protocol::{
    DropPacket, Opcode, Packet, decode_frame, encode_packet, encode_payload,
};

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::server::Server;
use crate::stages::{self, Stage};

/// Subscription state bits. Set in order, never cleared.
pub mod state {
    /// Bootstrap completed.
    pub const BOOTSTRAPPED: u32 = 1 << 0;
    /// Handshake completed, envelope installed.
    pub const HANDSHAKED: u32 = 1 << 1;
    /// Identify completed.
    pub const IDENTIFIED: u32 = 1 << 2;
    /// Load completed.
    pub const LOADED: u32 = 1 << 3;
}

/// Immutable project snapshot taken at bootstrap.
#[derive(Debug, Clone)]
pub struct ProjectSnapshot {
    /// Project record id.
    pub id: String,
    /// Decoded X25519 base point.
    pub point: [u8; 32],
    /// Decoded HKDF salt.
    pub salt: Vec<u8>,
    /// Alert webhook URL.
    pub alert_webhook: String,
}

/// Context pinned to the subscription by a successful bootstrap.
#[derive(Debug, Clone)]
pub struct BootContext {
    /// Key record id the connection is bound to.
    pub key_id: String,
    /// Discord id bound to the key.
    pub discord_id: String,
    /// Owning project.
    pub project: ProjectSnapshot,
    /// Exploit name reported in the boot request.
    pub exploit_name: String,
}

/// One live client connection.
pub struct Subscription {
    /// Subscription UUID, generated at accept.
    pub sub_id: Uuid,
    /// Unix seconds at accept, fixed for the connection lifetime.
    pub base_timestamp: u64,
    /// Resolved remote IP.
    pub ip: String,

    state: AtomicU32,
    boot: OnceLock<BootContext>,
    envelope: OnceLock<Envelope>,
    outbound: mpsc::Sender<Packet>,
    closed: OnceLock<String>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Create a subscription and the receiving end of its outbound
    /// queue.
    #[must_use]
    pub fn new(config: &ServerConfig, ip: String) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(config.packet_queue_limit);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());

        let sub = Arc::new(Self {
            sub_id: Uuid::new_v4(),
            base_timestamp: now,
            ip,
            state: AtomicU32::new(0),
            boot: OnceLock::new(),
            envelope: OnceLock::new(),
            outbound: tx,
            closed: OnceLock::new(),
            cancel: CancellationToken::new(),
        });
        (sub, rx)
    }

    /// Current state bits.
    #[must_use]
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }

    /// Whether all bits of `flag` are set.
    #[must_use]
    pub fn has_state(&self, flag: u32) -> bool {
        self.state() & flag == flag
    }

    /// Set state bits. Bits are never cleared.
    pub fn add_state(&self, flag: u32) {
        self.state.fetch_or(flag, Ordering::SeqCst);
    }

    /// Pin the bootstrap context. Later calls are ignored.
    pub fn install_boot(&self, context: BootContext) {
        let _ = self.boot.set(context);
    }

    /// Bootstrap context, once installed.
    #[must_use]
    pub fn boot(&self) -> Option<&BootContext> {
        self.boot.get()
    }

    /// Install the crypto envelope. Later calls are ignored.
    pub fn install_envelope(&self, envelope: Envelope) {
        let _ = self.envelope.set(envelope);
    }

    /// The crypto envelope, once installed.
    #[must_use]
    pub fn envelope(&self) -> Option<&Envelope> {
        self.envelope.get()
    }

    /// The context every sealed frame of this subscription binds to.
    #[must_use]
    pub fn envelope_ctx(&self) -> EnvelopeContext {
        EnvelopeContext {
            sub_id: *self.sub_id.as_bytes(),
            base_timestamp: self.base_timestamp,
        }
    }

    /// Non-blocking enqueue of an outbound packet.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::QueueFull`] when the client is not
    /// keeping up; the caller is expected to drop the subscription.
    pub fn send_packet(&self, packet: Packet) -> Result<(), SessionError> {
        self.outbound
            .try_send(packet)
            .map_err(|_| SessionError::QueueFull)
    }

    /// Encode and enqueue a plaintext message.
    ///
    /// # Errors
    ///
    /// Propagates encoding failures and a full queue.
    pub fn send_message<T: Serialize>(&self, op: Opcode, payload: &T) -> Result<(), SessionError> {
        let msg = encode_payload(payload)?;
        self.send_packet(Packet { id: op as u8, msg })
    }

    /// Encode, seal, and enqueue a message through the envelope.
    ///
    /// # Errors
    ///
    /// Fails when no envelope is installed yet, on encoding failure, or
    /// on a full queue.
    pub fn send_sealed<T: Serialize>(&self, op: Opcode, payload: &T) -> Result<(), SessionError> {
        let envelope = self
            .envelope()
            .ok_or_else(|| SessionError::Internal("no envelope installed".to_owned()))?;
        let msg = envelope.seal(&encode_payload(payload)?, &self.envelope_ctx());
        self.send_packet(Packet { id: op as u8, msg })
    }

    /// Verify, decrypt, and decode a sealed inbound payload.
    ///
    /// # Errors
    ///
    /// Fails when no envelope is installed, on MAC mismatch, or on a
    /// malformed plaintext.
    pub fn open_sealed<T: DeserializeOwned>(&self, msg: &[u8]) -> Result<T, SessionError> {
        let envelope = self
            .envelope()
            .ok_or_else(|| SessionError::Internal("no envelope installed".to_owned()))?;
        let plaintext = envelope.open(msg, &self.envelope_ctx())?;
        Ok(sws_core::protocol::decode_payload(&plaintext)?)
    }

    /// Close the subscription at most once.
    ///
    /// Best-effort enqueues a `Dropping` packet with the reason, then
    /// cancels the shared token. The writer drains the queue before the
    /// socket goes away, so the client usually sees the reason.
    pub fn close(&self, reason: &str) {
        if self.closed.set(reason.to_owned()).is_err() {
            return;
        }

        warn!(reason, "closing subscription");

        if let Ok(msg) = encode_payload(&DropPacket {
            reason: reason.to_owned(),
        }) {
            let _ = self.outbound.try_send(Packet {
                id: Opcode::Dropping as u8,
                msg,
            });
        }

        self.cancel.cancel();
    }

    /// Whether `close` has run.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closed.get().is_some()
    }

    /// The first close reason, once closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<&str> {
        self.closed.get().map(String::as_str)
    }

    /// The cancellation token shared by the subscription's tasks.
    #[must_use]
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Drive one accepted WebSocket to completion.
///
/// Spawns the writer and watchdog, runs the reader inline, and tears
/// everything down when the first of them finishes. The subscription is
/// registered for the duration so the event bridge can reach it.
pub async fn run(server: Arc<Server>, socket: WebSocket, ip: String) {
    let (sub, outbound_rx) = Subscription::new(&server.config, ip);
    let span = tracing::info_span!("subscription", sub_id = %sub.sub_id, ip = %sub.ip);

    async {
        info!(base_timestamp = sub.base_timestamp, "subscription accepted");

        server.registry.add(sub.clone());

        let (ws_tx, ws_rx) = socket.split();

        let writer = tokio::spawn(
            write_loop(sub.clone(), server.config.clone(), ws_tx, outbound_rx)
                .in_current_span(),
        );
        let watchdog = tokio::spawn(
            watchdog_loop(sub.clone(), server.config.clone()).in_current_span(),
        );

        read_loop(&server, &sub, ws_rx).await;

        // The reader is done; make sure the peers wind down too.
        sub.cancel.cancel();
        let _ = writer.await;
        let _ = watchdog.await;

        server.registry.remove(&sub);
        info!("subscription finished");
    }
    .instrument(span)
    .await;
}

/// Read, decode, and dispatch inbound packets until the subscription
/// ends.
async fn read_loop(server: &Arc<Server>, sub: &Arc<Subscription>, mut ws_rx: SplitStream<WebSocket>) {
    let cancel = sub.cancelled();
    let mut stage = Stage::Bootstrap;

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return,
            next = timeout(server.config.read_timeout, ws_rx.next()) => next,
        };

        let message = match next {
            // Transport problems terminate silently.
            Err(_elapsed) => {
                debug!("read timeout, terminating");
                return;
            }
            Ok(None) => {
                debug!("peer closed");
                return;
            }
            Ok(Some(Err(err))) => {
                debug!(error = %err, "transport error");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        let raw = match message {
            Message::Binary(bytes) => bytes.to_vec(),
            Message::Text(text) => text.as_str().as_bytes().to_vec(),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return,
        };

        let packet = match decode_frame(&raw, server.config.read_limit_bytes) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(error = %err, "frame decode failed");
                sub.close("malformed frame");
                return;
            }
        };

        if stages::handle_packet(server, sub, &mut stage, packet).await.is_err() {
            return;
        }
    }
}

/// Deliver queued packets to the socket in enqueue order.
///
/// On cancellation the queue is drained first so a final `Dropping`
/// packet still reaches the wire, then a close frame is sent.
async fn write_loop(
    sub: Arc<Subscription>,
    config: ServerConfig,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Packet>,
) {
    let cancel = sub.cancelled();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                while let Ok(packet) = outbound_rx.try_recv() {
                    if write_packet(&mut ws_tx, &config, &packet).await.is_err() {
                        break;
                    }
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }
            maybe = outbound_rx.recv() => {
                let Some(packet) = maybe else { return };
                if write_packet(&mut ws_tx, &config, &packet).await.is_err() {
                    sub.cancel.cancel();
                    return;
                }
            }
        }
    }
}

async fn write_packet(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    config: &ServerConfig,
    packet: &Packet,
) -> Result<(), ()> {
    debug!(id = packet.id, "writing packet");

    let encoded = match encode_packet(packet) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(error = %err, "failed to encode outbound packet");
            return Err(());
        }
    };

    match timeout(config.write_timeout, ws_tx.send(Message::Binary(encoded.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!(error = %err, "write failed");
            Err(())
        }
        Err(_elapsed) => {
            debug!("write timeout");
            Err(())
        }
    }
}

/// Drop subscriptions that have not reached Load in time.
async fn watchdog_loop(sub: Arc<Subscription>, config: ServerConfig) {
    let cancel = sub.cancelled();

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(config.watchdog_timeout) => {
                if !sub.has_state(state::LOADED) {
                    sub.close("dropped due to inactivity before loading");
                    return;
                }
            }
        }
    }
}
