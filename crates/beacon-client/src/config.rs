//! Runtime configuration.

use beacon_core::ConnectionConfig;

/// Endpoint used when none is configured.
pub const DEFAULT_BASE_URL: &str = "ws://localhost:3000/realtime";

/// Configuration for a [`crate::Realtime`] handle.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Server endpoint every transport opens against.
    pub base_url: String,
    /// State machine tuning: timeouts, backoff, room protocol.
    pub connection: ConnectionConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self { base_url: DEFAULT_BASE_URL.to_string(), connection: ConnectionConfig::default() }
    }
}

impl RealtimeConfig {
    /// Default tuning against `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), ..Self::default() }
    }
}
