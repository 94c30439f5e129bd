//! TLS server configuration loading.

use h2_tunnel_common::{Result, TlsSettings, TunnelError};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use tracing::info;

/// ALPN protocols offered by TLS listeners, HTTP/2 first
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];

/// Build a server config with ALPN `h2` from PEM certificate and key files.
pub fn load_tls_config(settings: &TlsSettings) -> Result<rustls::ServerConfig> {
    let certs = load_certs(&settings.cert)?;
    if certs.is_empty() {
        return Err(TunnelError::Tls(format!(
            "no certificates found in {}",
            settings.cert.display()
        )));
    }
    let key = load_private_key(&settings.key)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(e.to_string()))?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    info!(cert = %settings.cert.display(), "TLS configured");
    Ok(config)
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::Tls(format!("failed to open {}: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

/// Load certificates from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .filter_map(|c| c.ok().map(|v| v.into_owned()))
        .collect();
    Ok(certs)
}

/// Load private key from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TunnelError::Tls(e.to_string()))?
        .ok_or_else(|| TunnelError::Tls(format!("no private key found in {}", path.display())))
}
