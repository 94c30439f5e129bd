//! Sources of connections for a portal

use h2_tunnel_common::generate_connection_id;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::warn;

use super::BoxedStream;
use crate::connection::{ConnHandler, Connection};

/// A connection waiting to be carried to a worker
pub struct InboundConn {
    pub id: String,
    pub peer: Option<SocketAddr>,
    pub stream: BoxedStream,
}

impl InboundConn {
    pub fn new(id: impl Into<String>, peer: Option<SocketAddr>, stream: BoxedStream) -> Self {
        Self {
            id: id.into(),
            peer,
            stream,
        }
    }
}

/// Yields inbound connections; `Ok(None)` means the source is exhausted.
pub trait Inbound: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<Option<InboundConn>>> + Send;
}

/// Plain TCP accept socket
pub struct TcpInbound {
    listener: TcpListener,
}

impl TcpInbound {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Inbound for TcpInbound {
    async fn accept(&mut self) -> io::Result<Option<InboundConn>> {
        let (socket, peer) = self.listener.accept().await?;
        socket.set_nodelay(true)?;
        Ok(Some(InboundConn::new(
            generate_connection_id(),
            Some(peer),
            Box::new(socket),
        )))
    }
}

/// Connections handed over by a tunnel listener
pub struct ChannelInbound {
    rx: mpsc::Receiver<InboundConn>,
}

impl Inbound for ChannelInbound {
    async fn accept(&mut self) -> io::Result<Option<InboundConn>> {
        Ok(self.rx.recv().await)
    }
}

/// Listener handler that forwards accepted tunnel connections to a portal
#[derive(Clone)]
pub struct PortalHandler {
    tag: String,
    tx: mpsc::Sender<InboundConn>,
}

impl ConnHandler for PortalHandler {
    fn handle(&self, conn: Connection) {
        let inbound = InboundConn::new(conn.id().to_string(), conn.remote_addr(), Box::new(conn));
        if let Err(e) = self.tx.try_send(inbound) {
            // The rejected connection is dropped here, which ends its response.
            warn!(portal = %self.tag, error = %e, "portal backlog full or closed, dropping connection");
        }
    }
}

/// Wire a tunnel listener to a portal through a bounded queue.
pub fn inbound_channel(tag: impl Into<String>, capacity: usize) -> (PortalHandler, ChannelInbound) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PortalHandler {
            tag: tag.into(),
            tx,
        },
        ChannelInbound { rx },
    )
}
