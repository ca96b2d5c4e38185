//! Daemon configuration: parses the TOML file the out-of-scope config loader
//! hands to the core (spec §6, "Configuration inputs").

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Tap,
    Tun,
}

/// A single configured peer: optional fixed remote address plus its public
/// key. A peer with no `remote` is floating (spec §4.3).
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub remote: Option<SocketAddr>,
    /// Hex-encoded public key material for the negotiated protocol.
    pub public_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub mtu: u16,
    pub bind_v4: Option<SocketAddr>,
    pub bind_v6: Option<SocketAddr>,
    pub protocol: String,
    pub key: String,
    pub peers: Vec<PeerConfig>,
    pub secure_handshakes: bool,

    pub peer_stale_time_secs: u64,
    pub peer_stale_time_temp_secs: u64,
    pub eth_addr_stale_time_secs: u64,
    pub key_valid_secs: u64,
    pub key_valid_old_secs: u64,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Tun,
            mtu: 1400,
            bind_v4: Some("0.0.0.0:10000".parse().unwrap()),
            bind_v6: None,
            protocol: "ec25519-fhmqvc".to_string(),
            key: String::new(),
            peers: Vec::new(),
            secure_handshakes: false,
            peer_stale_time_secs: 300,
            peer_stale_time_temp_secs: 30,
            eth_addr_stale_time_secs: 600,
            key_valid_secs: 3600,
            key_valid_old_secs: 60,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = toml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let min_mtu = match self.mode {
            Mode::Tun => 576,
            Mode::Tap => 576 + 14,
        };
        if self.mtu < min_mtu {
            return Err(Error::config(format!(
                "mtu {} below minimum {min_mtu} for mode {:?}",
                self.mtu, self.mode
            )));
        }
        if self.bind_v4.is_none() && self.bind_v6.is_none() {
            return Err(Error::config("at least one of bind_v4/bind_v6 required"));
        }
        Ok(())
    }

    /// Number of configured peers with no fixed remote (floating slots).
    pub fn floating_slots(&self) -> usize {
        self.peers.iter().filter(|p| p.remote.is_none()).count()
    }
}
