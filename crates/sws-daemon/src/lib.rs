//! SWS tunnel server daemon.
//!
//! One WebSocket endpoint (`GET /subscribe`) accepts loader clients and
//! drives each connection through the Bootstrap, Handshake, Identify,
//! and Load stages. The library half of the crate exists so the
//! integration tests can exercise the dispatch layer without a socket;
//! the binary in `main.rs` wires it to axum and the CLI.

#![warn(clippy::all)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod stages;
pub mod subscription;

pub use config::ServerConfig;
pub use error::SessionError;
pub use server::Server;
pub use subscription::Subscription;
