//! Byte-stream adapter over a single HTTP/2 stream
//!
//! A worker session carries each proxied connection as one HTTP/2 request:
//! the portal writes into the request body and reads the response body, the
//! bridge does the opposite. [`H2Stream`] exposes either end as
//! `AsyncRead + AsyncWrite` so it can be relayed with the usual tokio tools.

use bytes::Bytes;
use h2::client::SendRequest;
use h2::server::SendResponse;
use h2::{Reason, RecvStream, SendStream};
use http::{Method, Request, Response, StatusCode};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Result, TunnelError};

/// URI of every sub-stream request; the bridge does not route on it
pub const STREAM_URI: &str = "http://h2-tunnel/";

/// One HTTP/2 stream used as a full-duplex byte stream
pub struct H2Stream {
    send: SendStream<Bytes>,
    recv: RecvStream,
    pending: Bytes,
    end_sent: bool,
}

impl H2Stream {
    pub fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        Self {
            send,
            recv,
            pending: Bytes::new(),
            end_sent: false,
        }
    }

    /// Open a new sub-stream on a client session.
    pub async fn open(sender: &SendRequest<Bytes>) -> Result<Self> {
        let mut sender = sender.clone().ready().await?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(STREAM_URI)
            .body(())
            .map_err(|e| TunnelError::Internal(e.to_string()))?;

        let (response, send) = sender.send_request(request, false)?;
        let response = response.await?;
        if response.status() != StatusCode::OK {
            return Err(TunnelError::Internal(format!(
                "bridge refused stream with status {}",
                response.status()
            )));
        }

        Ok(Self::new(send, response.into_body()))
    }

    /// Accept a sub-stream on the serving side by answering `200`.
    pub fn accept(request: Request<RecvStream>, mut respond: SendResponse<Bytes>) -> Result<Self> {
        let response = Response::builder()
            .status(StatusCode::OK)
            .body(())
            .map_err(|e| TunnelError::Internal(e.to_string()))?;
        let send = respond.send_response(response, false)?;
        Ok(Self::new(send, request.into_body()))
    }
}

fn h2_to_io(err: h2::Error) -> io::Error {
    if err.is_io() {
        return err
            .into_io()
            .unwrap_or_else(|| io::Error::from(io::ErrorKind::Other));
    }
    match err.reason() {
        Some(Reason::CANCEL) | Some(Reason::STREAM_CLOSED) => {
            io::Error::new(io::ErrorKind::ConnectionReset, err)
        }
        _ => io::Error::other(err),
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.pending.is_empty() {
            match ready!(this.recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    let _ = this.recv.flow_control().release_capacity(data.len());
                    this.pending = data;
                }
                Some(Err(e)) if e.reason() == Some(Reason::NO_ERROR) => {
                    return Poll::Ready(Ok(()));
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.end_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                TunnelError::StreamClosed,
            )));
        }

        this.send.reserve_capacity(buf.len());
        loop {
            match ready!(this.send.poll_capacity(cx)) {
                Some(Ok(0)) => continue,
                Some(Ok(capacity)) => {
                    let n = capacity.min(buf.len());
                    this.send
                        .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(h2_to_io)?;
                    return Poll::Ready(Ok(n));
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        TunnelError::StreamClosed,
                    )));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.end_sent {
            this.end_sent = true;
            this.send
                .send_data(Bytes::new(), true)
                .map_err(h2_to_io)?;
        }
        Poll::Ready(Ok(()))
    }
}
