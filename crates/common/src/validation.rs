//! Request policy and configuration validation
//!
//! This module decides which HTTP requests may open a tunnel (host and path
//! policy) and validates identifiers that come from configuration files.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::constants::DEFAULT_PATH;

/// Regex for portal tags (letters, digits, `.`, `_`, `-`)
static TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,64}$").unwrap());

/// Maximum length for a configured path prefix
pub const MAX_PATH_LENGTH: usize = 2048;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid portal tag: {0}")]
    InvalidTag(String),

    #[error("Path too long: {0} bytes (max: {1})")]
    PathTooLong(usize, usize),

    #[error("Invalid host: {0}")]
    InvalidHost(String),
}

/// Normalize a configured path prefix so it starts and ends with `/`.
///
/// ```
/// use h2_tunnel_common::validation::normalize_path;
///
/// assert_eq!(normalize_path(""), "/");
/// assert_eq!(normalize_path("tunnel"), "/tunnel/");
/// assert_eq!(normalize_path("/tunnel/"), "/tunnel/");
/// ```
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return DEFAULT_PATH.to_string();
    }

    let mut normalized = String::with_capacity(trimmed.len() + 2);
    if !trimmed.starts_with('/') {
        normalized.push('/');
    }
    normalized.push_str(trimmed);
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

/// Check a request path against a normalized prefix.
///
/// The prefix itself without its trailing slash also matches, so `/tunnel`
/// is accepted for the prefix `/tunnel/`.
pub fn path_matches(prefix: &str, path: &str) -> bool {
    if path.starts_with(prefix) {
        return true;
    }
    let bare = prefix.trim_end_matches('/');
    !bare.is_empty() && path == bare
}

/// Check a request host against the allowed set; an empty set allows any host.
pub fn host_allowed(hosts: &[String], host: &str) -> bool {
    hosts.is_empty() || hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
}

/// Validate a portal tag
pub fn validate_tag(tag: &str) -> Result<(), ValidationError> {
    if !TAG_REGEX.is_match(tag) {
        return Err(ValidationError::InvalidTag(
            tag.chars().take(64).collect::<String>(),
        ));
    }
    Ok(())
}

/// Validate a configured path prefix before normalization
pub fn validate_path(path: &str) -> Result<(), ValidationError> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(ValidationError::PathTooLong(path.len(), MAX_PATH_LENGTH));
    }
    Ok(())
}

/// Validate a configured host name
pub fn validate_host(host: &str) -> Result<(), ValidationError> {
    if host.is_empty() || !host.is_ascii() || host.chars().any(|c| c.is_control() || c == ' ') {
        return Err(ValidationError::InvalidHost(
            host.chars().take(64).collect::<String>(),
        ));
    }
    Ok(())
}
