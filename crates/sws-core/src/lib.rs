//! # sws-core
//!
//! Core library for the SWS tunnel, the bidirectional WebSocket protocol
//! that authenticates, bootstraps, and hands a signed payload to loader
//! clients.
//!
//! This crate holds everything that is independent of the connection
//! runtime:
//!
//! - **Wire codec**: MessagePack payload types and the hex/binary packet
//!   framing ([`protocol`])
//! - **Crypto envelope**: X25519 key agreement, HKDF key derivation, and
//!   the authenticated RC4 + HMAC frame format ([`envelope`])
//! - **Record store surface**: the abstract document store the server
//!   queries, with its boolean filter DSL and an in-memory
//!   implementation ([`record`])
//! - **Typed models**: strict field schemas over loosely-typed rows
//!   ([`model`])
//! - **Policy engine**: blacklist, mismatch, association, and BOLO
//!   decisions ([`policy`])
//! - **Alert sink**: the outbound webhook channel with its rate limiter
//!   ([`alert`])
//!
//! The daemon crate (`sws-daemon`) owns the subscription lifecycle and
//! the stage handlers that drive these pieces.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alert;
pub mod envelope;
pub mod model;
pub mod policy;
pub mod protocol;
pub mod record;

pub use envelope::{Envelope, EnvelopeContext, EnvelopeError};
pub use protocol::{Opcode, Packet};
pub use record::{Record, RecordStore, StoreError, Value};
