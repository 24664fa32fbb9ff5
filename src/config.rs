//! Centralized runtime configuration for the bridge.
//!
//! CLI arguments select the transport roles; everything tunable about
//! relay behavior lives here and can be overridden via environment
//! variables.

use std::time::Duration;

/// Runtime configuration shared by both bridge modes.
///
/// All parameters can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound for connection establishment plus the initialize
    /// exchange. Requests arriving inside this window are held; if the
    /// window expires they are answered with a service-unavailable error.
    pub init_timeout: Duration,

    /// Optional per-call timeout for relayed requests. `None` means a
    /// pending call waits until the session closes, matching callers that
    /// manage their own deadlines.
    pub call_timeout: Option<Duration>,

    /// Capacity of each bounded transport channel. Filling a channel
    /// stalls the producing side rather than growing a queue.
    pub channel_capacity: usize,

    /// Maximum accepted HTTP body for posted messages. Larger payloads
    /// receive 413 Payload Too Large.
    pub max_body_bytes: usize,

    /// Interval for SSE keep-alive comments on idle streams.
    pub sse_keep_alive: Duration,

    /// How long teardown waits for in-flight dispatch tasks to finish
    /// writing their responses.
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            call_timeout: None,
            channel_capacity: 32,
            max_body_bytes: 1024 * 1024, // 1 MiB
            sse_keep_alive: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Environment Variables
    ///
    /// - `CROSSWIRE_INIT_TIMEOUT_SECS` (default: 10)
    /// - `CROSSWIRE_CALL_TIMEOUT_SECS` (default: unset; 0 also disables)
    /// - `CROSSWIRE_CHANNEL_CAPACITY` (default: 32)
    /// - `CROSSWIRE_MAX_BODY_BYTES` (default: 1048576 = 1 MiB)
    /// - `CROSSWIRE_SSE_KEEP_ALIVE_SECS` (default: 15)
    /// - `CROSSWIRE_SHUTDOWN_GRACE_SECS` (default: 5)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            init_timeout: std::env::var("CROSSWIRE_INIT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.init_timeout),

            // No unwrap_or here: unset and "0" both mean disabled
            call_timeout: std::env::var("CROSSWIRE_CALL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),

            channel_capacity: std::env::var("CROSSWIRE_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|cap| *cap > 0)
                .unwrap_or(default.channel_capacity),

            max_body_bytes: std::env::var("CROSSWIRE_MAX_BODY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_body_bytes),

            sse_keep_alive: std::env::var("CROSSWIRE_SSE_KEEP_ALIVE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.sse_keep_alive),

            shutdown_grace: std::env::var("CROSSWIRE_SHUTDOWN_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.shutdown_grace),
        }
    }
}
