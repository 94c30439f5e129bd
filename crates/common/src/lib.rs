//! Common utilities and types for the h2-tunnel system
//!
//! This crate provides the pieces shared by the hub (HTTP tunnel listener and
//! reverse-tunnel portal) and the bridge agent: error types, configuration,
//! request policy, the completion [`Signal`] and the HTTP/2 sub-stream adapter.

pub mod config;
pub mod constants;
pub mod error;
pub mod signal;
pub mod stream;
pub mod utils;
pub mod validation;

// Re-export commonly used types for convenience
pub use config::{ListenAddr, ListenerSettings, TlsSettings};
pub use error::{Result, TunnelError};
pub use signal::Signal;
pub use stream::H2Stream;
pub use utils::{generate_connection_id, generate_worker_id, resolve_remote_addr};
