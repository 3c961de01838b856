//! Typed payloads for every packet in the opcode table.
//!
//! Field names and nesting mirror the deployed clients field for field;
//! the server records many of these values without interpreting them.

use serde::{Deserialize, Serialize};

/// First packet of a subscription: which key is connecting and through
/// which exploit. Sent before any envelope exists, so it carries no
/// secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BootRequest {
    /// Record id of the key the client claims.
    pub key_id: String,
    /// Self-reported exploit name; pinned into the fingerprint row.
    pub exploit_name: String,
}

/// Reply to [`BootRequest`]; fixes the connection context the MAC will
/// later bind to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BootResponse {
    /// Unix seconds at accept, constant for the subscription lifetime.
    pub base_timestamp: u64,
    /// The subscription UUID.
    #[serde(with = "serde_bytes")]
    pub sub_id: [u8; 16],
}

/// Client half of the X25519 exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeRequest {
    /// Client public point, generated against the project base point.
    #[serde(with = "serde_bytes")]
    pub client_public_key: [u8; 32],
}

/// Server half of the X25519 exchange. The only unauthenticated reply
/// sent after the handshake handler runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeResponse {
    /// Server public point derived from the project base point.
    #[serde(with = "serde_bytes")]
    pub server_public_key: [u8; 32],
}

/// Broad environment identifiers. Saved once per key and then used to
/// detect environment changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnalyticsInfo {
    /// Windows locale identifier string.
    pub system_locale_id: String,
    /// Names of audio output devices.
    pub output_devices: Vec<String>,
    /// Names of audio input devices.
    pub input_devices: Vec<String>,
    /// Whether the Hyperion protection layer was observed.
    pub has_hyperion: bool,
    /// Touchscreen present.
    pub has_touchscreen: bool,
    /// Gyroscope present.
    pub has_gyroscope: bool,
    /// Reported GPU memory in bytes.
    pub gpu_memory: i64,
    /// IANA timezone name.
    pub timezone: String,
    /// Reported region code.
    pub region: String,
    /// Whether daylight savings time is active.
    pub daylight_savings_time: bool,
}

/// Small set of reliable identifiers used for the hard blacklist and
/// hardware-change checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FingerprintInfo {
    /// Coarse device class.
    pub device_type: u8,
    /// Hardware id as reported by the exploit.
    pub exploit_hwid: String,
}

/// Per-session identifiers useful for linking past sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionInfo {
    /// Monotonic clock of the client process, seconds.
    pub os_clock: f64,
    /// Play session identifier.
    pub play_session_id: String,
    /// Client session identifier.
    pub roblox_session_id: String,
    /// Client installation identifier.
    pub roblox_client_id: String,
    /// File and folder names found in the client workspace directory.
    pub workspace_scan: Vec<String>,
    /// Recent log output lines.
    pub log_history: Vec<String>,
}

/// Account and place context for the join, used for association checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinInfo {
    /// Account display name.
    pub user_name: String,
    /// Numeric account id.
    pub user_id: i64,
    /// Account age in days.
    pub account_age: i64,
    /// Place the client is joining.
    pub place_id: i64,
    /// Group ids the account belongs to.
    pub user_groups: Vec<u64>,
    /// Account ids the user follows.
    pub user_following: Vec<u64>,
    /// Account ids on the friend list.
    pub user_friends: Vec<u64>,
}

/// Client build identifiers; primarily a simulated-client tell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionInfo {
    /// Release channel.
    pub roblox_client_channel: String,
    /// Build git hash.
    pub roblox_client_git_hash: String,
    /// Client version string.
    pub roblox_version: String,
    /// Core script version.
    pub core_script_version: String,
    /// Must be "Luau" on a genuine client.
    pub lua_version: String,
}

/// Connection-scoped identity. Never linked to a key record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubInfo {
    /// Join context.
    pub join_info: JoinInfo,
    /// Session context.
    pub session_info: SessionInfo,
    /// Version context.
    pub version_info: VersionInfo,
}

/// Key-scoped identity, linked and saved to the key record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyInfo {
    /// Environment identifiers.
    pub analytics_info: AnalyticsInfo,
    /// Hardware identifiers.
    pub fingerprint_info: FingerprintInfo,
}

/// Full identity report, sent sealed after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdentifyRequest {
    /// Key-scoped identity.
    pub key_info: KeyInfo,
    /// Connection-scoped identity.
    pub sub_info: SubInfo,
}

/// Reply to [`IdentifyRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdentifyResponse {
    /// Role stored on the key record.
    pub current_role: String,
}

/// Script selection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoadRequest {
    /// Game the client is currently in.
    pub game_id: u64,
}

/// Reply to [`LoadRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoadResponse {
    /// Record id of the protected script for the game.
    pub script_id: String,
}

/// Server-to-client close notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DropPacket {
    /// Human-readable close reason.
    pub reason: String,
}

/// Server-to-client role change push for loaded subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyUpdatePacket {
    /// New role stored on the key record.
    pub role: String,
}

/// Client-to-server freeze report. Logged and otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FreezePacket {
    /// How long the client process was frozen.
    pub seconds: f64,
}
