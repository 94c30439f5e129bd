//! Reverse tunneling
//!
//! Bridges behind NAT dial in and register as [`Worker`]s. A [`Portal`]
//! takes inbound connections and carries each one over a sub-stream of a
//! worker chosen by a [`Picker`].

mod inbound;
mod picker;
mod portal;
mod registrar;
mod session;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

use tokio::io::{AsyncRead, AsyncWrite};

pub use inbound::{
    ChannelInbound, Inbound, InboundConn, PortalHandler, TcpInbound, inbound_channel,
};
pub use picker::{DynamicPicker, Picker, StaticPicker};
pub use portal::{Portal, PortalState};
pub use registrar::Registrar;
pub use session::H2Session;
pub use worker::{MuxSession, Worker, WorkerLease, WorkerState, WorkerStream};

/// Full-duplex byte stream carried through a portal
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;
