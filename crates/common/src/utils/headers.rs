use http::HeaderMap;
use std::net::IpAddr;

/// Header carrying the client chain added by intermediate proxies
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// First address of the forwarded-for chain, if it is a valid IP
pub fn first_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let first = headers
        .get(X_FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim();
    first.parse().ok()
}
