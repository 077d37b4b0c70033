//! Node configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub rtc: RtcConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the store file.
    pub data_dir: PathBuf,

    /// Local database name; also names the store file.
    #[serde(default = "default_db_name")]
    pub db_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay endpoint, e.g. `ws://localhost:8081`.
    #[serde(default)]
    pub url: Option<String>,

    /// Room token; the only credential.
    #[serde(default)]
    pub token: Option<String>,

    /// First reconnect delay in milliseconds; doubles per attempt.
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,

    /// Ceiling for the reconnect delay.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Attempts before giving up entirely.
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfig {
    /// STUN/TURN server URLs handed to the peer connection.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period before the debounced snapshot fires.
    #[serde(default = "default_snapshot_debounce")]
    pub snapshot_debounce_ms: u64,
}

fn default_db_name() -> String {
    "battery".to_owned()
}
fn default_reconnect_base() -> u64 {
    1000
}
fn default_reconnect_max() -> u64 {
    30_000
}
fn default_reconnect_attempts() -> u32 {
    10
}
fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_owned()]
}
fn default_snapshot_debounce() -> u64 {
    1000
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_debounce_ms: default_snapshot_debounce(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            reconnect_base_ms: default_reconnect_base(),
            reconnect_max_ms: default_reconnect_max(),
            max_reconnect_attempts: default_reconnect_attempts(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                data_dir: PathBuf::from("./data"),
                db_name: default_db_name(),
            },
            signaling: SignalingConfig::default(),
            rtc: RtcConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [node]
            data_dir = "/tmp/battery"
            "#,
        )
        .unwrap();
        assert_eq!(config.node.db_name, "battery");
        assert_eq!(config.signaling.reconnect_base_ms, 1000);
        assert_eq!(config.signaling.max_reconnect_attempts, 10);
        assert_eq!(config.sync.snapshot_debounce_ms, 1000);
    }
}
