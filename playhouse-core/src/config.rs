//! Runtime configuration (§6). Loaded from a JSON file with
//! `reload`-style hot reload support, mirroring the pattern the relay
//! config file used for its per-game settings.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use protocol::msgids::{
    DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_REQUEST_TIMEOUT_MS, MAX_MSG_ID_LEN, MAX_PACKET_BYTES,
};
use protocol::pool::PoolConfig as BufferPoolConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolBucketOverride {
    pub bucket_size: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolConfig {
    #[serde(default)]
    pub warm_up_counts: Vec<PoolBucketOverride>,
    #[serde(default)]
    pub max_counts: Vec<PoolBucketOverride>,
}

impl PoolConfig {
    pub fn into_buffer_pool_config(self) -> BufferPoolConfig {
        BufferPoolConfig {
            warm_up_counts: self
                .warm_up_counts
                .into_iter()
                .map(|o| (o.bucket_size, o.count))
                .collect(),
            max_counts: self
                .max_counts
                .into_iter()
                .map(|o| (o.bucket_size, o.count))
                .collect(),
            idle_window: BufferPoolConfig::idle_window_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameLoopConfig {
    pub fixed_timestep_ms: u64,
    /// Defaults to `5 * fixed_timestep_ms` when absent, clamped up to at
    /// least `fixed_timestep_ms` (§4.9: "clamped to fixedTimestep, no
    /// silent no-op").
    pub max_accumulator_cap_ms: u64,
}

impl GameLoopConfig {
    pub fn new(fixed_timestep_ms: u64, max_accumulator_cap_ms: u64) -> Self {
        GameLoopConfig {
            fixed_timestep_ms,
            max_accumulator_cap_ms: max_accumulator_cap_ms.max(fixed_timestep_ms),
        }
    }

    pub fn fixed_timestep(&self) -> Duration {
        Duration::from_millis(self.fixed_timestep_ms)
    }

    pub fn effective_cap(&self) -> Duration {
        Duration::from_millis(self.max_accumulator_cap_ms.max(self.fixed_timestep_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub pkcs12_path: String,
    pub pkcs12_password: String,
    #[serde(default)]
    pub require_client_auth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    pub path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerRole {
    Play,
    Api,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayHouseConfig {
    pub server_id: String,
    pub role: ServerRole,
    pub service_id: u16,
    pub tcp_port: u16,
    pub bind_endpoint: String,
    #[serde(default)]
    pub peer_endpoints: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    pub authenticate_message_id: String,
    pub default_stage_type: String,
    #[serde(default)]
    pub pool: PoolConfig,
    pub game_loop: GameLoopConfig,
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    #[serde(default = "default_max_packet_bytes")]
    pub max_packet_bytes: usize,
    #[serde(default = "default_max_msg_id_len")]
    pub max_msg_id_len: usize,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_discovery_refresh_ms")]
    pub discovery_refresh_ms: u64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub websocket: Option<WsConfig>,
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_compression_threshold() -> usize {
    DEFAULT_COMPRESSION_THRESHOLD
}

fn default_max_packet_bytes() -> usize {
    MAX_PACKET_BYTES
}

fn default_max_msg_id_len() -> usize {
    MAX_MSG_ID_LEN
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_discovery_refresh_ms() -> u64 {
    10_000
}

impl PlayHouseConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("failed to read config: {e}"))?;
        serde_json::from_str(&text).map_err(|e| format!("failed to parse config: {e}"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn discovery_refresh(&self) -> Duration {
        Duration::from_millis(self.discovery_refresh_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_loop_config_clamps_cap_below_timestep() {
        let cfg = GameLoopConfig::new(50, 10);
        assert_eq!(cfg.max_accumulator_cap_ms, 50);
    }

    #[test]
    fn parses_minimal_config_json() {
        let json = r#"{
            "server_id": "play-1",
            "role": "Play",
            "service_id": 1,
            "tcp_port": 9000,
            "bind_endpoint": "tcp://0.0.0.0:5555",
            "authenticate_message_id": "Auth",
            "default_stage_type": "default",
            "game_loop": { "fixed_timestep_ms": 50, "max_accumulator_cap_ms": 250 }
        }"#;
        let cfg: PlayHouseConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.compression_threshold, DEFAULT_COMPRESSION_THRESHOLD);
        assert_eq!(cfg.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    }
}
