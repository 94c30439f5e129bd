//! In-memory session for exercising workers, pickers and portals.

use futures_util::future::BoxFuture;
use h2::Reason;
use h2_tunnel_common::{Result, TunnelError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};

use super::{BoxedStream, MuxSession};

/// Each opened sub-stream is one end of a duplex pipe; the other end is
/// queued for the test to pick up with [`MemorySession::next_peer`].
#[derive(Clone)]
pub struct MemorySession {
    closed: Arc<AtomicBool>,
    failing_opens: Arc<AtomicUsize>,
    refused_opens: Arc<AtomicUsize>,
    peers_tx: mpsc::UnboundedSender<DuplexStream>,
    peers_rx: Arc<Mutex<mpsc::UnboundedReceiver<DuplexStream>>>,
}

impl MemorySession {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            closed: Arc::new(AtomicBool::new(false)),
            failing_opens: Arc::new(AtomicUsize::new(0)),
            refused_opens: Arc::new(AtomicUsize::new(0)),
            peers_tx,
            peers_rx: Arc::new(Mutex::new(peers_rx)),
        }
    }

    /// Make the next open fail as if the session died mid-handshake.
    pub fn fail_next_open(&self) {
        self.failing_opens.fetch_add(1, Ordering::AcqRel);
    }

    /// Make the next open fail as if the peer reset that one stream.
    pub fn refuse_next_open(&self) {
        self.refused_opens.fetch_add(1, Ordering::AcqRel);
    }

    pub async fn next_peer(&self) -> DuplexStream {
        self.peers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("session dropped")
    }
}

impl MuxSession for MemorySession {
    fn open_stream(&self) -> BoxFuture<'_, Result<BoxedStream>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(TunnelError::SessionClosed);
            }
            if take_one(&self.failing_opens) {
                return Err(TunnelError::SessionClosed);
            }
            if take_one(&self.refused_opens) {
                return Err(TunnelError::StreamReset(Reason::REFUSED_STREAM));
            }
            let (local, remote) = tokio::io::duplex(16 * 1024);
            self.peers_tx
                .send(remote)
                .map_err(|_| TunnelError::SessionClosed)?;
            Ok(Box::new(local) as BoxedStream)
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}
