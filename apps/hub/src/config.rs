//! Hub configuration file

use anyhow::{Context, Result};
use h2_tunnel_common::constants::{
    DEFAULT_MAX_STREAMS_PER_WORKER, SWEEP_INTERVAL_SECS, WORKER_IDLE_TIMEOUT_SECS,
};
use h2_tunnel_common::validation::validate_tag;
use h2_tunnel_common::{ListenAddr, ListenerSettings, TunnelError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub listeners: Vec<ListenerEntry>,
    pub portals: Vec<PortalEntry>,
}

/// One HTTP tunnel listener and the portal its connections go to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerEntry {
    pub listen: ListenAddr,

    #[serde(default)]
    pub settings: ListenerSettings,

    /// Tag of the portal receiving accepted connections
    pub portal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalEntry {
    pub tag: String,

    /// Where bridges dial in to register as workers
    pub registration: SocketAddr,

    /// Optional plain TCP inbound in addition to tunnel listeners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<SocketAddr>,

    #[serde(default = "default_max_streams")]
    pub max_streams_per_worker: usize,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub worker_idle_timeout_secs: u64,
}

fn default_max_streams() -> usize {
    DEFAULT_MAX_STREAMS_PER_WORKER
}

fn default_sweep_interval() -> u64 {
    SWEEP_INTERVAL_SECS
}

fn default_idle_timeout() -> u64 {
    WORKER_IDLE_TIMEOUT_SECS
}

impl PortalEntry {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_secs)
    }
}

impl HubConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        let mut tags = HashSet::new();
        for portal in &self.portals {
            validate_tag(&portal.tag).map_err(|e| TunnelError::InvalidConfig(e.to_string()))?;
            if !tags.insert(portal.tag.as_str()) {
                return Err(TunnelError::InvalidConfig(format!("duplicate portal tag {}", portal.tag)));
            }
            if portal.max_streams_per_worker == 0 {
                return Err(TunnelError::InvalidConfig(format!(
                    "portal {}: max_streams_per_worker must be positive",
                    portal.tag
                )));
            }
            if portal.sweep_interval_secs == 0 {
                return Err(TunnelError::InvalidConfig(format!(
                    "portal {}: sweep_interval_secs must be positive",
                    portal.tag
                )));
            }
        }

        for listener in &self.listeners {
            if !tags.contains(listener.portal.as_str()) {
                return Err(TunnelError::InvalidConfig(format!(
                    "listener {} references unknown portal {}",
                    listener.listen, listener.portal
                )));
            }
            listener.settings.validate()?;
        }

        Ok(())
    }

    pub fn portal(&self, tag: &str) -> Option<&PortalEntry> {
        self.portals.iter().find(|p| p.tag == tag)
    }
}
