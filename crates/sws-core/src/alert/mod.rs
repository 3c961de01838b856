//! Outbound alert channel.
//!
//! Policy verdicts that need human eyes (BOLO hits, automated
//! blacklists) are posted to the owning project's chat webhook as a
//! single embed. The channel is strictly best-effort: posts are rate
//! limited globally, failures are logged and swallowed, and nothing in
//! the session path ever waits on a retry.

mod rate_limit;
mod sink;

pub use rate_limit::RateLimiter;
pub use sink::{AlertError, AlertSink, HttpSink, MemorySink};

use std::sync::Arc;

use serde_json::json;

/// The two alert kinds the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Soft "be on the lookout" signal; the connection stays up.
    Bolo,
    /// A key was just blacklisted.
    Blacklist,
}

impl AlertKind {
    fn title(self) -> &'static str {
        match self {
            Self::Bolo => "Automated 'Be On The Lookout' Alert",
            Self::Blacklist => "Automated 'Blacklist Key' Alert",
        }
    }

    fn color(self) -> u32 {
        match self {
            Self::Bolo => 0x00FF_0000,
            Self::Blacklist => 0x00FA_FF00,
        }
    }
}

/// Identity attached to an alert.
#[derive(Debug, Clone)]
pub struct AlertIdentity {
    /// Subscription UUID string.
    pub sub_id: String,
    /// Key record id.
    pub key_id: String,
    /// Discord id bound to the key.
    pub discord_id: String,
}

/// Build the webhook body for an alert.
///
/// The shape is fixed by the receiving chat service: a content line, a
/// bot username, and exactly one embed.
#[must_use]
pub fn build_body(kind: AlertKind, identity: &AlertIdentity) -> serde_json::Value {
    json!({
        "content": "@everyone",
        "username": "ArmorShield",
        "embeds": [{
            "title": kind.title(),
            "description": "Check the log dashboard for more information.",
            "color": kind.color(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "footer": {
                "text": format!("Subscription ID: '{}'", identity.sub_id),
            },
            "author": {
                "name": format!(
                    "PB Key ID & Discord ID ({}) ({})",
                    identity.key_id, identity.discord_id
                ),
            },
        }],
    })
}

/// Rate-limited front door to the alert sink.
///
/// One dispatcher exists per server process; every subscription posts
/// through it so the global limit actually holds.
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    limiter: RateLimiter,
}

impl AlertDispatcher {
    /// Alert posts allowed per second across the whole process.
    pub const POSTS_PER_SECOND: f64 = 10.0;
    /// Burst capacity of the limiter.
    pub const BURST: f64 = 8.0;

    /// Build a dispatcher over a sink with the default limits.
    #[must_use]
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self {
            sink,
            limiter: RateLimiter::new(Self::POSTS_PER_SECOND, Self::BURST),
        }
    }

    /// Post an alert to a project webhook.
    ///
    /// Never fails: rate-limited, rejected, and failed posts are logged
    /// and dropped.
    pub async fn dispatch(&self, webhook_url: &str, kind: AlertKind, identity: &AlertIdentity) {
        if webhook_url.is_empty() {
            tracing::warn!(?kind, "no alert webhook configured for project");
            return;
        }

        if !self.limiter.try_acquire() {
            tracing::warn!(?kind, sub_id = %identity.sub_id, "alert rate limit hit, dropping alert");
            return;
        }

        let body = build_body(kind, identity);
        if let Err(err) = self.sink.post(webhook_url, &body).await {
            tracing::warn!(?kind, sub_id = %identity.sub_id, error = %err, "alert post failed");
        }
    }
}
