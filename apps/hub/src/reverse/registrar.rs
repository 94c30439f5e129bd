//! Accepts bridge connections and registers them as workers.

use h2_tunnel_common::constants::REGISTRATION_HANDSHAKE_TIMEOUT_SECS;
use h2_tunnel_common::{Result, TunnelError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DynamicPicker, H2Session, Worker};

pub struct Registrar {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Registrar {
    /// Listen for bridges on `addr`; each becomes a worker of `picker`
    /// carrying at most `capacity` concurrent streams.
    pub async fn bind(addr: SocketAddr, picker: Arc<DynamicPicker>, capacity: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        info!(addr = %local_addr, "accepting bridge registrations");
        tokio::spawn(accept_loop(listener, picker, capacity, cancel.clone()));

        Ok(Self { local_addr, cancel })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Registrar {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    picker: Arc<DynamicPicker>,
    capacity: usize,
    cancel: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept bridge");
                    continue;
                }
            },
        };
        let _ = socket.set_nodelay(true);

        let picker = picker.clone();
        tokio::spawn(async move {
            let timeout = Duration::from_secs(REGISTRATION_HANDSHAKE_TIMEOUT_SECS);
            match tokio::time::timeout(timeout, H2Session::handshake(socket)).await {
                Ok(Ok(session)) => {
                    let worker = Worker::new(session, capacity);
                    debug!(worker = %worker.id(), %peer, "bridge connected");
                    picker.register(worker);
                }
                Ok(Err(e)) => warn!(%peer, error = %e, "bridge handshake failed"),
                Err(_) => warn!(%peer, "bridge handshake timed out"),
            }
        });
    }
    debug!("registrar stopped");
}
