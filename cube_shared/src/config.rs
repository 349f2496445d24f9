//! Configuration system.
//!
//! Loads client/server configuration from JSON strings or files.
//! Every field has a default so partial files are accepted.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server IP literal, e.g. `127.0.0.1`.
    #[serde(default = "default_server_ip")]
    pub server_ip: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Visual asset used for the local player. Only the renderer reads it.
    #[serde(default = "default_player_prefab")]
    pub player_prefab: String,
    /// Delay between the Connect event and the first state report.
    #[serde(default = "default_report_delay_secs")]
    pub report_delay_secs: f32,
    /// Interval between state reports.
    #[serde(default = "default_report_period_secs")]
    pub report_period_secs: f32,
    /// Frame rate of the driver loop in the client binary.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
}

fn default_server_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    40000
}

fn default_player_prefab() -> String {
    "Cube".to_string()
}

fn default_report_delay_secs() -> f32 {
    0.1
}

fn default_report_period_secs() -> f32 {
    0.0166
}

fn default_tick_hz() -> u32 {
    60
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_ip: default_server_ip(),
            server_port: default_server_port(),
            player_prefab: default_player_prefab(),
            report_delay_secs: default_report_delay_secs(),
            report_period_secs: default_report_period_secs(),
            tick_hz: default_tick_hz(),
        }
    }
}

impl ClientConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn report_delay(&self) -> Duration {
        Duration::try_from_secs_f32(self.report_delay_secs).unwrap_or(Duration::ZERO)
    }

    pub fn report_period(&self) -> Duration {
        Duration::try_from_secs_f32(self.report_period_secs).unwrap_or(Duration::ZERO)
    }
}

/// Reference server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// ServerUpdate broadcast rate.
    #[serde(default = "default_update_hz")]
    pub update_hz: u32,
    /// A client that takes longer than this to accept one frame is dropped.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_update_hz() -> u32 {
    30
}

fn default_send_timeout_ms() -> u64 {
    250
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            update_hz: default_update_hz(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_client_config_takes_defaults() {
        let cfg = ClientConfig::from_json_str(r#"{"server_port": 7777}"#).unwrap();
        assert_eq!(cfg.server_port, 7777);
        assert_eq!(cfg.server_ip, "127.0.0.1");
        assert_eq!(cfg.player_prefab, "Cube");
        assert_eq!(cfg.report_delay(), Duration::from_secs_f32(0.1));
    }

    #[test]
    fn invalid_periods_fall_back_to_zero() {
        let cfg = ClientConfig {
            report_period_secs: -1.0,
            ..ClientConfig::default()
        };
        assert_eq!(cfg.report_period(), Duration::ZERO);
    }

    #[test]
    fn server_config_defaults() {
        let cfg = ServerConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:40000");
        assert_eq!(cfg.update_hz, 30);
        assert_eq!(cfg.send_timeout(), Duration::from_millis(250));
    }
}
