use camtrap_core::config::{ReconnectSettings, TransportConfig};
use std::time::Duration;

use crate::framing::MAX_FRAME_SIZE;

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Enable auto-reconnect
    pub enabled: bool,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier (for exponential backoff)
    pub backoff_multiplier: f64,
    /// Consecutive failed attempts before giving up (None = infinite)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            enabled: settings.enabled,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            backoff_multiplier: settings.backoff_multiplier,
            max_attempts: settings.max_attempts,
        }
    }
}

/// Configuration for one bus socket
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bus hub address, `host:port`
    pub bus_addr: String,
    /// Timeout for TCP connect and for the handshake ack
    pub connect_timeout: Duration,
    /// Timeout for writing one frame
    pub write_timeout: Duration,
    /// Frames buffered between the reader task and `receive`
    pub recv_queue_capacity: usize,
    /// Frames buffered between `publish` and the writer task
    pub send_queue_capacity: usize,
    pub max_frame_size: usize,
    pub keepalive: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_transport(String::new(), &TransportConfig::default())
    }
}

impl ClientConfig {
    pub fn new(bus_addr: impl Into<String>) -> Self {
        Self {
            bus_addr: bus_addr.into(),
            ..Self::default()
        }
    }

    pub fn from_transport(bus_addr: impl Into<String>, transport: &TransportConfig) -> Self {
        Self {
            bus_addr: bus_addr.into(),
            connect_timeout: transport.connect_timeout(),
            write_timeout: transport.write_timeout(),
            recv_queue_capacity: transport.recv_queue_capacity,
            send_queue_capacity: transport.send_queue_capacity,
            max_frame_size: MAX_FRAME_SIZE,
            keepalive: true,
            reconnect: ReconnectConfig::from(&transport.reconnect),
        }
    }
}

/// Helper function to calculate exponential backoff duration
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let backoff_secs =
        config.initial_backoff.as_secs_f64() * config.backoff_multiplier.powi(attempt as i32);
    let capped_secs = backoff_secs.min(config.max_backoff.as_secs_f64());
    Duration::from_secs_f64(capped_secs)
}
