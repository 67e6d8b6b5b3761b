//! Node startup configuration.
//!
//! Out of scope per §6: "CLI / environment... the core accepts a
//! `{controller_ip, lpid (0 = auto), isolated?}` triple at start." The
//! triple can come from a `node.toml` file or be built programmatically by
//! whatever CLI layer wraps this core (see `proclet-node` for a `clap`
//! based one).

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ids::LpId;

/// The `{controller_ip, lpid, isolated?}` triple every node starts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub controller_ip: IpAddr,
    #[serde(default)]
    pub controller_port: Option<u16>,
    /// 0 = auto-allocate a fresh LP.
    #[serde(default)]
    pub lpid: u16,
    #[serde(default)]
    pub isolated: bool,
    /// Bind address for this node's own RPC listener.
    pub bind_ip: IpAddr,
    #[serde(default)]
    pub bind_port: Option<u16>,
    /// Image hash presented at registration; re-registration with a
    /// mismatched hash is rejected (open question in §9, defaulted to
    /// rejecting).
    #[serde(default = "default_image_hash")]
    pub image_hash: u64,
}

fn default_image_hash() -> u64 {
    0
}

impl NodeConfig {
    pub fn lpid(&self) -> LpId {
        LpId(self.lpid)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(ConfigError::Parse)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Read(#[source] std::io::Error),
    #[error("parsing config file: {0}")]
    Parse(#[source] toml::de::Error),
}
