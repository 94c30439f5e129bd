use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, TunnelError};
use crate::validation::{host_allowed, normalize_path, validate_host, validate_path};

/// Prefix marking a Unix domain socket address in configuration
pub const UNIX_PREFIX: &str = "unix:";

/// Settings of one HTTP tunnel listener
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Allowed `Host` values; empty allows any host
    pub hosts: Vec<String>,

    /// Path prefix requests must start with
    pub path: String,

    /// Certificate and key; presence switches the listener to TLS + h2
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,

    /// PROXY protocol is expected to be parsed upstream of this listener
    pub accept_proxy_protocol: bool,
}

impl ListenerSettings {
    pub fn new(hosts: Vec<String>, path: impl Into<String>) -> Self {
        Self {
            hosts,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn normalized_path(&self) -> String {
        normalize_path(&self.path)
    }

    pub fn is_valid_host(&self, host: &str) -> bool {
        host_allowed(&self.hosts, host)
    }

    pub fn validate(&self) -> Result<()> {
        validate_path(&self.path).map_err(|e| TunnelError::InvalidConfig(e.to_string()))?;
        for host in &self.hosts {
            validate_host(host).map_err(|e| TunnelError::InvalidConfig(e.to_string()))?;
        }
        Ok(())
    }
}

/// PEM files for the TLS server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Where a listener binds: a TCP socket or a Unix domain socket path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ListenAddr {
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }

    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) => Some(*addr),
            Self::Unix(_) => None,
        }
    }
}

impl FromStr for ListenAddr {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(TunnelError::InvalidConfig(
                    "empty unix socket path".to_string(),
                ));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        s.parse::<SocketAddr>()
            .map(Self::Tcp)
            .map_err(|e| TunnelError::InvalidConfig(format!("invalid listen address {s}: {e}")))
    }
}

impl TryFrom<String> for ListenAddr {
    type Error = TunnelError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ListenAddr> for String {
    fn from(addr: ListenAddr) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
        }
    }
}
