//! The server aggregate and the WebSocket endpoint.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::info;

use sws_core::alert::{AlertDispatcher, AlertSink};
use sws_core::record::RecordStore;

use crate::bridge::{self, ScriptProtector};
use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::subscription;

/// Everything the stage handlers and the runtime need, created once at
/// startup and shared by reference. There are no hidden singletons.
pub struct Server {
    /// Runtime tunables.
    pub config: ServerConfig,
    /// The record store.
    pub store: Arc<dyn RecordStore>,
    /// Live subscriptions.
    pub registry: Arc<Registry>,
    /// Rate-limited alert channel.
    pub alerts: AlertDispatcher,
}

impl Server {
    /// Assemble a server.
    #[must_use]
    pub fn new(config: ServerConfig, store: Arc<dyn RecordStore>, sink: Arc<dyn AlertSink>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            registry: Arc::new(Registry::new()),
            alerts: AlertDispatcher::new(sink),
        })
    }

    /// Register the record event bridges on the store.
    pub fn install_bridges(self: &Arc<Self>, protector: Arc<dyn ScriptProtector>) {
        bridge::register_key_bridge(&self.store, self.registry.clone());
        bridge::register_script_bridge(&self.store, protector);
    }
}

/// `GET /subscribe`: upgrade to a WebSocket and run the subscription
/// lifecycle.
pub async fn subscribe(
    State(server): State<Arc<Server>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = client_ip(&headers, peer);
    info!(%ip, "subscribe upgrade");

    let limit = server.config.read_limit_bytes;
    ws.max_message_size(limit)
        .on_upgrade(move |socket| subscription::run(server, socket, ip))
}

/// Resolve the client IP: rightmost non-private `X-Forwarded-For` hop,
/// falling back to the peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        for hop in forwarded.split(',').rev() {
            if let Ok(ip) = hop.trim().parse::<IpAddr>() {
                if !is_private(&ip) {
                    return ip.to_string();
                }
            }
        }
    }

    peer.ip().to_string()
}

/// Addresses that never count as a client: loopback, RFC 1918 ranges,
/// link-local, and unique-local v6.
fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
