//! Device and transport tuning. Every field has a default; hosts deserialize overrides from TOML.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Pre-shared code a discovery ack must carry (default "1234").
    #[serde(default = "default_pairing_code")]
    pub pairing_code: String,
    /// Discovery UDP port; heartbeats go to and are received on it (default 5000).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_task_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_task_interval_ms")]
    pub pair_listen_interval_ms: u64,
    #[serde(default = "default_task_interval_ms")]
    pub repair_interval_ms: u64,
    #[serde(default = "default_task_interval_ms")]
    pub command_listen_interval_ms: u64,
    #[serde(default)]
    pub transport: TransportConfig,
}

fn default_pairing_code() -> String {
    "1234".to_string()
}
fn default_discovery_port() -> u16 {
    5000
}
fn default_task_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pairing_code: default_pairing_code(),
            discovery_port: default_discovery_port(),
            heartbeat_interval_ms: default_task_interval_ms(),
            pair_listen_interval_ms: default_task_interval_ms(),
            repair_interval_ms: default_task_interval_ms(),
            command_listen_interval_ms: default_task_interval_ms(),
            transport: TransportConfig::default(),
        }
    }
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pair_listen_interval(&self) -> Duration {
        Duration::from_millis(self.pair_listen_interval_ms)
    }

    pub fn repair_interval(&self) -> Duration {
        Duration::from_millis(self.repair_interval_ms)
    }

    pub fn command_listen_interval(&self) -> Duration {
        Duration::from_millis(self.command_listen_interval_ms)
    }
}

/// Socket retry contract. The bounded empty-poll count is the only read timeout.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Consecutive empty polls before a read gives up (default 100).
    #[serde(default = "default_max_empty_polls")]
    pub max_empty_polls: u32,
    /// Sleep after each empty poll (default 10 ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Largest accepted length header (default 16 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Receive buffer for one discovery datagram (default 1500).
    #[serde(default = "default_datagram_buffer")]
    pub datagram_buffer: usize,
    /// Stream connect timeout (default 3000 ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_max_empty_polls() -> u32 {
    100
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_max_frame_len() -> usize {
    16 * 1024 * 1024
}
fn default_datagram_buffer() -> usize {
    1500
}
fn default_connect_timeout_ms() -> u64 {
    3000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_empty_polls: default_max_empty_polls(),
            poll_interval_ms: default_poll_interval_ms(),
            max_frame_len: default_max_frame_len(),
            datagram_buffer: default_datagram_buffer(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let c = Config::default();
        assert_eq!(c.pairing_code, "1234");
        assert_eq!(c.discovery_port, 5000);
        assert_eq!(c.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(c.transport.max_empty_polls, 100);
        assert_eq!(c.transport.poll_interval(), Duration::from_millis(10));
    }
}
