//! Full-duplex connection synthesized from one HTTP exchange
//!
//! The request body is the read side and the response body is the write side.
//! Writes go through [`FlushWriter`], which hands every buffer to the response
//! as its own data frame and refuses writes once the exchange is done.
//!
//! The frame queue holds a single frame: a write returns once its frame is
//! queued, and a flush returns once the response body has taken it.

use bytes::{Buf, Bytes};
use h2_tunnel_common::{ListenAddr, Signal, TunnelError};
use http_body::Body;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Internal connection handler invoked for every accepted tunnel request
pub trait ConnHandler: Send + Sync + 'static {
    fn handle(&self, conn: Connection);
}

impl<F> ConnHandler for F
where
    F: Fn(Connection) + Send + Sync + 'static,
{
    fn handle(&self, conn: Connection) {
        self(conn)
    }
}

fn stream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, TunnelError::StreamClosed)
}

/// Writer that pushes each write straight into the response body
pub struct FlushWriter {
    sink: PollSender<Bytes>,
    done: Signal,
}

impl FlushWriter {
    pub fn new(sink: mpsc::Sender<Bytes>, done: Signal) -> Self {
        Self {
            sink: PollSender::new(sink),
            done,
        }
    }

    pub fn close(&mut self) {
        self.sink.close();
    }
}

impl AsyncWrite for FlushWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.done.is_done() {
            return Poll::Ready(Err(stream_closed()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(this.sink.poll_reserve(cx)).map_err(|_| stream_closed())?;
        if this.done.is_done() {
            this.sink.abort_send();
            return Poll::Ready(Err(stream_closed()));
        }

        this.sink
            .send_item(Bytes::copy_from_slice(buf))
            .map_err(|_| stream_closed())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.sink.is_closed() {
            return Poll::Ready(Ok(()));
        }
        // a free slot means the body has taken the last frame
        ready!(this.sink.poll_reserve(cx)).map_err(|_| stream_closed())?;
        this.sink.abort_send();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.sink.close();
        this.done.signal();
        Poll::Ready(Ok(()))
    }
}

/// `AsyncRead` over an HTTP request body; trailers are ignored
pub struct BodyReader<B> {
    body: B,
    pending: Bytes,
    finished: bool,
}

impl<B> BodyReader<B> {
    pub fn new(body: B) -> Self {
        Self {
            body,
            pending: Bytes::new(),
            finished: false,
        }
    }
}

impl<B> AsyncRead for BodyReader<B>
where
    B: Body + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.pending.is_empty() {
            if this.finished {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.body).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Ok(mut data) = frame.into_data() {
                        this.pending = data.copy_to_bytes(data.remaining());
                    }
                }
                Some(Err(e)) => {
                    this.finished = true;
                    return Poll::Ready(Err(io::Error::other(e.into())));
                }
                None => this.finished = true,
            }
        }

        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// One tunneled stream handed to a [`ConnHandler`]
pub struct Connection {
    id: String,
    reader: Option<BoxedReader>,
    writer: FlushWriter,
    done: Signal,
    local_addr: ListenAddr,
    remote_addr: Option<SocketAddr>,
}

impl Connection {
    pub fn new(
        id: String,
        reader: BoxedReader,
        writer: FlushWriter,
        done: Signal,
        local_addr: ListenAddr,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            id,
            reader: Some(reader),
            writer,
            done,
            local_addr,
            remote_addr,
        }
    }

    /// Correlation id used in log records for this connection
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_addr(&self) -> &ListenAddr {
        &self.local_addr
    }

    /// Best-effort client address; `None` when it could not be determined
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Signal fired when this connection is finished
    pub fn done_signal(&self) -> Signal {
        self.done.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_done()
    }

    /// Fire the done signal and release both the request and response bodies.
    pub fn close(&mut self) {
        self.done.signal();
        self.writer.close();
        self.reader = None;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().reader.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}
