//! HTTP/2 worker session
//!
//! The bridge dials in and the portal runs the *client* side of HTTP/2 over
//! that socket, so the portal can open streams towards the bridge.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use h2::client::SendRequest;
use h2_tunnel_common::{H2Stream, Result, Signal, TunnelError};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{BoxedStream, MuxSession};

pub struct H2Session {
    sender: SendRequest<Bytes>,
    closed: Signal,
}

impl H2Session {
    /// Run the client handshake over a socket accepted from a bridge.
    ///
    /// The connection is driven by a background task which ends, and marks
    /// the session closed, on I/O error, peer shutdown or [`MuxSession::close`].
    pub async fn handshake<T>(io: T) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, connection) = h2::client::handshake(io).await?;
        let closed = Signal::new();

        let watcher = closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = connection => match result {
                    Ok(()) => debug!("worker session ended"),
                    Err(e) => warn!(error = %e, "worker session failed"),
                },
                _ = watcher.wait() => debug!("worker session closed locally"),
            }
            watcher.signal();
        });

        Ok(Self { sender, closed })
    }
}

impl MuxSession for H2Session {
    fn open_stream(&self) -> BoxFuture<'_, Result<BoxedStream>> {
        Box::pin(async move {
            if self.closed.is_done() {
                return Err(TunnelError::SessionClosed);
            }
            let stream = H2Stream::open(&self.sender).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.is_done()
    }

    fn close(&self) {
        self.closed.signal();
    }
}
