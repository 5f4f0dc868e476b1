//! Typed engine configuration with the enumerated options from the protocol
//! surface. Loaded from environment variables by the daemon; tests build it
//! directly.

use std::path::PathBuf;

use rfmp_shared::constants::{DEFAULT_BLOOM_K, DEFAULT_BLOOM_M_LOG2, DEFAULT_MTU};
use rfmp_shared::types::Callsign;
use rfmp_shared::FramingError;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This station's callsign; required, no default on air.
    pub callsign: String,
    pub ssid: u8,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub tnc_host: String,
    pub tnc_port: u16,
    /// Disable all wire I/O; the engine runs against its queue only.
    pub offline_mode: bool,
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Maximum RFMP payload bytes per AX.25 UI frame.
    pub mtu: usize,
    pub sync_interval_s: u64,
    pub bloom_window_s: u64,
    pub bloom_m_log2: u8,
    pub bloom_k: u8,
    pub req_per_minute: u32,
    /// TX queue depth above which submissions fail and SYNCs are suppressed.
    pub queue_high_water: u64,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database file path; `None` selects the platform data directory.
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                callsign: "N0CALL".to_string(),
                ssid: 0,
            },
            network: NetworkConfig {
                tnc_host: "127.0.0.1".to_string(),
                tnc_port: 8001,
                offline_mode: false,
            },
            protocol: ProtocolConfig {
                mtu: DEFAULT_MTU,
                sync_interval_s: 30,
                bloom_window_s: 600,
                bloom_m_log2: DEFAULT_BLOOM_M_LOG2,
                bloom_k: DEFAULT_BLOOM_K,
                req_per_minute: 6,
                queue_high_water: 1000,
            },
            storage: StorageConfig {
                database_path: None,
            },
        }
    }
}

impl Config {
    /// Parse and validate the configured callsign + SSID.
    pub fn node_callsign(&self) -> Result<Callsign, FramingError> {
        Callsign::new(&self.node.callsign, self.node.ssid)
    }

    /// Validate ranges; rejects values the protocol cannot carry.
    pub fn validate(&self) -> Result<(), String> {
        self.node_callsign()
            .map_err(|e| format!("node.callsign: {e}"))?;

        if !(32..=1024).contains(&self.protocol.mtu) {
            return Err(format!("protocol.mtu {} out of range 32..=1024", self.protocol.mtu));
        }
        if !(6..=14).contains(&self.protocol.bloom_m_log2) {
            return Err(format!(
                "protocol.bloom_m_log2 {} out of range 6..=14",
                self.protocol.bloom_m_log2
            ));
        }
        if self.protocol.bloom_k == 0 || self.protocol.bloom_k > 16 {
            return Err(format!(
                "protocol.bloom_k {} out of range 1..=16",
                self.protocol.bloom_k
            ));
        }
        if self.protocol.sync_interval_s < 5 {
            return Err("protocol.sync_interval_s must be at least 5".to_string());
        }
        if self.protocol.bloom_window_s < 60 {
            return Err("protocol.bloom_window_s must be at least 60".to_string());
        }
        if self.protocol.req_per_minute == 0 {
            return Err("protocol.req_per_minute must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_callsign() {
        let mut config = Config::default();
        config.node.callsign = "NOT A CALL".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_bloom() {
        let mut config = Config::default();
        config.protocol.bloom_m_log2 = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn callsign_includes_ssid() {
        let mut config = Config::default();
        config.node.callsign = "n0call".into();
        config.node.ssid = 7;
        assert_eq!(config.node_callsign().unwrap().to_string(), "N0CALL-7");
    }
}
