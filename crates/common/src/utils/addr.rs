use http::HeaderMap;
use std::net::SocketAddr;
use tracing::debug;

use super::headers::first_forwarded_ip;

/// Parse a transport-reported endpoint such as `tcp:1.2.3.4:80` or `[::1]:443`.
pub fn parse_destination(endpoint: &str) -> Option<SocketAddr> {
    let endpoint = endpoint.trim();
    let endpoint = endpoint
        .strip_prefix("tcp:")
        .or_else(|| endpoint.strip_prefix("udp:"))
        .unwrap_or(endpoint);
    endpoint.parse().ok()
}

/// Best-effort client address of an HTTP exchange.
///
/// The transport-reported endpoint is used when it parses; a valid first
/// `X-Forwarded-For` entry overrides it with port 0. Otherwise the address is
/// undetermined.
pub fn resolve_remote_addr(endpoint: Option<&str>, headers: &HeaderMap) -> Option<SocketAddr> {
    let mut remote = None;

    if let Some(endpoint) = endpoint {
        match parse_destination(endpoint) {
            Some(addr) => remote = Some(addr),
            None => debug!(endpoint, "failed to parse request remote addr"),
        }
    }

    if let Some(ip) = first_forwarded_ip(headers) {
        remote = Some(SocketAddr::new(ip, 0));
    }

    remote
}
