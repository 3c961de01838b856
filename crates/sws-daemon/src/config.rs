//! Runtime tunables.

use std::time::Duration;

use sws_core::policy::CpuStartMode;

/// Game id pentester keys are restricted to.
pub const BASEPLATE_GAME_ID: u64 = 1_430_993_116;

/// Per-process server configuration.
///
/// The defaults are the reference values the protocol was tuned with.
/// None of them are protocol-level contracts; clients must tolerate
/// different deployments.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Outbound packets queued per subscription before it is dropped as
    /// a slow consumer.
    pub packet_queue_limit: usize,

    /// Maximum inbound WebSocket message size in bytes.
    pub read_limit_bytes: usize,

    /// A subscription is terminated when no packet arrives within this
    /// window.
    pub read_timeout: Duration,

    /// One outbound write must complete within this window.
    pub write_timeout: Duration,

    /// A subscription that has not reached Load within this window is
    /// dropped.
    pub watchdog_timeout: Duration,

    /// When set, blacklist record writes are logged but not persisted.
    pub testing_mode: bool,

    /// How the BOLO session probe derives its time value.
    pub cpu_start_mode: CpuStartMode,

    /// Game id pentester keys may load in.
    pub baseplate_game_id: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            packet_queue_limit: 8,
            read_limit_bytes: 32 * 1024,
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(30),
            watchdog_timeout: Duration::from_secs(60),
            testing_mode: false,
            cpu_start_mode: CpuStartMode::default(),
            baseplate_game_id: BASEPLATE_GAME_ID,
        }
    }
}
