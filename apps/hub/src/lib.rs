//! HTTP/2 tunnel hub
//!
//! Serves tunnel requests over HTTP/1.1, H2C or TLS and relays accepted
//! streams through reverse-tunnel portals to registered bridges.

pub mod config;
pub mod connection;
pub mod hub;
pub mod listener;
pub mod lock;
pub mod reverse;
pub mod tls;

pub use config::{HubConfig, ListenerEntry, PortalEntry};
pub use connection::{ConnHandler, Connection, FlushWriter};
pub use hub::Hub;
pub use listener::{Listener, TransportMode, listen};
pub use lock::{FileLock, FileLocker};
