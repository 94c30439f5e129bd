//! HTTP tunnel listener
//!
//! Serves HTTP/1.1 and HTTP/2 (prior-knowledge H2C in plaintext mode, ALPN
//! `h2` in TLS mode). Cleartext HTTP/2 is only reachable with prior
//! knowledge; an HTTP/1.1 `Upgrade: h2c` request is served as plain HTTP/1.1.
//!
//! Every request that passes the host/path policy becomes a [`Connection`]
//! whose read side is the request body and whose write side is the response
//! body. The response head (`200`, `Cache-Control: no-store`) is sent before
//! the handler writes anything, and the response body stays open until the
//! connection's done signal fires.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use h2_tunnel_common::constants::{
    BODY_CHANNEL_CAPACITY, CACHE_CONTROL_NO_STORE, READ_HEADER_TIMEOUT_SECS,
};
use h2_tunnel_common::validation::path_matches;
use h2_tunnel_common::{
    ListenAddr, ListenerSettings, Result, Signal, TunnelError, generate_connection_id,
    resolve_remote_addr,
};
use http::header::{CACHE_CONTROL, HOST};
use http::{Request, Response, StatusCode};
use http_body::{Body, Frame};
use http_body_util::{Either, Empty};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, rustls};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::connection::{BodyReader, ConnHandler, Connection, FlushWriter};
use crate::lock::FileLocker;
use crate::tls::load_tls_config;

/// How accepted sockets are served, chosen once per listener
#[derive(Clone)]
pub enum TransportMode {
    /// HTTP/1.1 and prior-knowledge HTTP/2 over cleartext
    Plaintext,
    /// TLS handshake first, HTTP/2 negotiated through ALPN
    Tls(Arc<rustls::ServerConfig>),
}

impl TransportMode {
    /// Load the TLS configuration named by the settings, if any.
    pub fn from_settings(settings: &ListenerSettings) -> Result<Self> {
        match &settings.tls {
            Some(tls) => Ok(Self::Tls(Arc::new(load_tls_config(tls)?))),
            None => Ok(Self::Plaintext),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl fmt::Debug for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plaintext => f.write_str("Plaintext"),
            Self::Tls(_) => f.write_str("Tls"),
        }
    }
}

/// Response body of an accepted tunnel request
pub struct TunnelBody {
    id: String,
    rx: mpsc::Receiver<Bytes>,
    done: BoxFuture<'static, ()>,
}

impl TunnelBody {
    fn new(id: String, rx: mpsc::Receiver<Bytes>, done: Signal) -> Self {
        Self {
            id,
            rx,
            done: Box::pin(async move { done.wait().await }),
        }
    }
}

impl Body for TunnelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => return Poll::Ready(Some(Ok(Frame::data(data)))),
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }
        match this.done.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TunnelBody {
    fn drop(&mut self) {
        debug!(conn = %self.id, "tunnel stream finished");
    }
}

type ResponseBody = Either<TunnelBody, Empty<Bytes>>;

/// State shared by every exchange served by one listener
struct Shared {
    local: ListenAddr,
    settings: ListenerSettings,
    path: String,
    handler: Arc<dyn ConnHandler>,
}

impl Shared {
    fn request_host<B>(request: &Request<B>) -> &str {
        request
            .uri()
            .authority()
            .map(|a| a.as_str())
            .or_else(|| request.headers().get(HOST).and_then(|v| v.to_str().ok()))
            .unwrap_or("")
    }

    fn reject() -> Response<ResponseBody> {
        let mut response = Response::new(Either::Right(Empty::new()));
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
    }

    /// Apply the host/path policy and hand an accepted request to the handler.
    fn serve_http<B>(&self, request: Request<B>, remote_endpoint: Option<&str>) -> Response<ResponseBody>
    where
        B: Body + Send + Unpin + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let host = Self::request_host(&request);
        if !self.settings.is_valid_host(host) {
            debug!(host, "rejecting request for unknown host");
            return Self::reject();
        }
        if !path_matches(&self.path, request.uri().path()) {
            debug!(path = request.uri().path(), "rejecting request outside tunnel path");
            return Self::reject();
        }

        let remote = resolve_remote_addr(remote_endpoint, request.headers());
        let id = generate_connection_id();
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let done = Signal::new();

        let conn = Connection::new(
            id.clone(),
            Box::new(BodyReader::new(request.into_body())),
            FlushWriter::new(tx, done.clone()),
            done.clone(),
            self.local.clone(),
            remote,
        );

        debug!(conn = %id, remote = ?remote, "accepted tunnel request");
        self.handler.handle(conn);

        let mut response = Response::new(Either::Left(TunnelBody::new(id, rx, done)));
        response.headers_mut().insert(
            CACHE_CONTROL,
            http::HeaderValue::from_static(CACHE_CONTROL_NO_STORE),
        );
        response
    }
}

/// A bound tunnel listener; dropping it stops serving
pub struct Listener {
    local: ListenAddr,
    cancel: CancellationToken,
    locker: Mutex<Option<Box<dyn FileLocker>>>,
}

impl Listener {
    pub fn addr(&self) -> &ListenAddr {
        &self.local
    }

    /// Release the socket lock (at most once) and stop serving.
    ///
    /// Every in-flight exchange is aborted. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        let locker = self
            .locker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let released = match locker {
            Some(locker) => {
                info!(addr = %self.local, "releasing socket lock");
                locker.release()
            }
            None => Ok(()),
        };
        self.cancel.cancel();
        Ok(released?)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum RawListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Bind `addr` and start serving tunnel requests in the background.
///
/// For Unix sockets a supplied lock is recorded on the listener and a stale
/// socket file is removed before binding. Errors after the listener has been
/// returned are logged and end the accept loop.
pub async fn listen(
    addr: ListenAddr,
    settings: ListenerSettings,
    mode: TransportMode,
    handler: Arc<dyn ConnHandler>,
    locker: Option<Box<dyn FileLocker>>,
) -> Result<Listener> {
    settings.validate()?;

    if settings.accept_proxy_protocol {
        warn!(addr = %addr, "accepting PROXY protocol; headers must be parsed upstream");
    }

    let (raw, local, locker) = bind(&addr, locker).await.inspect_err(|e| {
        error!(addr = %addr, error = %e, "failed to listen");
    })?;

    let shared = Arc::new(Shared {
        local: local.clone(),
        path: settings.normalized_path(),
        settings,
        handler,
    });

    let cancel = CancellationToken::new();
    let span = info_span!("listener", addr = %local, tls = mode.is_tls());
    tokio::spawn(accept_loop(raw, mode, shared, cancel.clone()).instrument(span));

    Ok(Listener {
        local,
        cancel,
        locker: Mutex::new(locker),
    })
}

async fn bind(
    addr: &ListenAddr,
    locker: Option<Box<dyn FileLocker>>,
) -> Result<(RawListener, ListenAddr, Option<Box<dyn FileLocker>>)> {
    let bind_err = |source: io::Error| TunnelError::Bind {
        addr: addr.to_string(),
        source,
    };

    match addr {
        ListenAddr::Tcp(socket) => {
            if locker.is_some() {
                debug!(addr = %addr, "ignoring file lock for tcp listener");
            }
            let listener = TcpListener::bind(socket).await.map_err(bind_err)?;
            let local = ListenAddr::Tcp(listener.local_addr().map_err(bind_err)?);
            Ok((RawListener::Tcp(listener), local, None))
        }
        #[cfg(unix)]
        ListenAddr::Unix(path) => {
            if locker.is_some() {
                match std::fs::remove_file(path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(bind_err(e)),
                    _ => {}
                }
            }
            let listener = UnixListener::bind(path).map_err(bind_err)?;
            Ok((RawListener::Unix(listener), addr.clone(), locker))
        }
        #[cfg(not(unix))]
        ListenAddr::Unix(_) => Err(bind_err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix domain sockets are not supported on this platform",
        ))),
    }
}

async fn accept_loop(
    raw: RawListener,
    mode: TransportMode,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    info!("serving {}", if mode.is_tls() { "TLS" } else { "H2C" });
    let acceptor = match &mode {
        TransportMode::Tls(config) => Some(TlsAcceptor::from(config.clone())),
        TransportMode::Plaintext => None,
    };

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = accept(&raw) => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                let shared = shared.clone();
                let cancel = cancel.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => debug!("listener closed, aborting exchange"),
                        _ = serve_stream(stream, remote, acceptor, shared) => {}
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "stopped serving");
                break;
            }
        }
    }
    debug!("accept loop exited");
}

trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

async fn accept(raw: &RawListener) -> io::Result<(Box<dyn Io>, Option<String>)> {
    match raw {
        RawListener::Tcp(listener) => {
            let (stream, peer) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            Ok((Box::new(stream), Some(peer.to_string())))
        }
        #[cfg(unix)]
        RawListener::Unix(listener) => {
            let (stream, _) = listener.accept().await?;
            Ok((Box::new(stream), None))
        }
    }
}

async fn serve_stream(
    stream: Box<dyn Io>,
    remote: Option<String>,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
) {
    let header_timeout = Duration::from_secs(READ_HEADER_TIMEOUT_SECS);
    match acceptor {
        Some(acceptor) => {
            match tokio::time::timeout(header_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => serve_http(tls, remote, shared).await,
                Ok(Err(e)) => debug!(remote = ?remote, error = %e, "TLS handshake failed"),
                Err(_) => debug!(remote = ?remote, "TLS handshake timed out"),
            }
        }
        None => serve_http(stream, remote, shared).await,
    }
}

async fn serve_http<I: Io>(io: I, remote: Option<String>, shared: Arc<Shared>) {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(Duration::from_secs(READ_HEADER_TIMEOUT_SECS));
    builder.http2().timer(TokioTimer::new());

    let service = service_fn(move |request: Request<Incoming>| {
        let response = shared.serve_http(request, remote.as_deref());
        async move { Ok::<_, Infallible>(response) }
    });

    if let Err(e) = builder.serve_connection(TokioIo::new(io), service).await {
        debug!(error = %e, "connection ended with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2_tunnel_common::TlsSettings;
    use http_body_util::{BodyExt, Full, StreamBody};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn tunnel_settings() -> ListenerSettings {
        ListenerSettings::new(vec!["example.com".to_string()], "/tunnel")
    }

    fn counting_handler() -> (Arc<dyn ConnHandler>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handler = move |_conn: Connection| {
            seen.fetch_add(1, Ordering::SeqCst);
        };
        (Arc::new(handler), count)
    }

    fn echo_handler() -> Arc<dyn ConnHandler> {
        Arc::new(|mut conn: Connection| {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                conn.close();
            });
        })
    }

    fn shared(settings: ListenerSettings, handler: Arc<dyn ConnHandler>) -> Shared {
        Shared {
            local: ListenAddr::Tcp("127.0.0.1:443".parse().unwrap()),
            path: settings.normalized_path(),
            settings,
            handler,
        }
    }

    fn request(host: &str, path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(path)
            .header(HOST, host)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn listen_local(handler: Arc<dyn ConnHandler>) -> Listener {
        listen(
            ListenAddr::Tcp("127.0.0.1:0".parse().unwrap()),
            tunnel_settings(),
            TransportMode::Plaintext,
            handler,
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_host_is_rejected() {
        let (handler, count) = counting_handler();
        let shared = shared(tunnel_settings(), handler);

        let response = shared.serve_http(request("other.com", "/tunnel"), None);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_path_outside_prefix_is_rejected() {
        let (handler, count) = counting_handler();
        let shared = shared(tunnel_settings(), handler);

        for path in ["/", "/other", "/tunnelx"] {
            let response = shared.serve_http(request("example.com", path), None);
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "path {path}");
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_accepted_request_headers() {
        let (handler, count) = counting_handler();
        let shared = shared(tunnel_settings(), handler);

        let response = shared.serve_http(request("example.com", "/tunnel/x"), None);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CACHE_CONTROL], "no-store");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_hosts_accept_any_host() {
        let (handler, count) = counting_handler();
        let shared = shared(ListenerSettings::default(), handler);

        let response = shared.serve_http(request("anything.net", "/whatever"), None);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_addr_resolution() {
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let handler: Arc<dyn ConnHandler> = Arc::new(move |conn: Connection| {
            *sink.lock().unwrap() = Some(conn.remote_addr());
        });
        let shared = shared(tunnel_settings(), handler);

        let _ = shared.serve_http(request("example.com", "/tunnel"), Some("10.1.2.3:4000"));
        assert_eq!(
            captured.lock().unwrap().take().unwrap(),
            Some("10.1.2.3:4000".parse().unwrap())
        );

        let mut req = request("example.com", "/tunnel");
        req.headers_mut()
            .insert("x-forwarded-for", "192.0.2.1, 10.0.0.1".parse().unwrap());
        let _ = shared.serve_http(req, Some("10.1.2.3:4000"));
        assert_eq!(
            captured.lock().unwrap().take().unwrap(),
            Some("192.0.2.1:0".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_body_ends_when_done_fires() {
        let parked = Arc::new(Mutex::new(None));
        let sink = parked.clone();
        let handler: Arc<dyn ConnHandler> = Arc::new(move |conn: Connection| {
            *sink.lock().unwrap() = Some(conn);
        });
        let shared = shared(tunnel_settings(), handler);

        let response = shared.serve_http(request("example.com", "/tunnel"), None);
        let mut body = response.into_body();

        // the connection (and its writer) stays alive; only the signal fires
        let conn = parked.lock().unwrap().take().unwrap();
        conn.done_signal().signal();

        let frame = body.frame().await;
        assert!(frame.is_none());
        drop(conn);
    }

    #[tokio::test]
    async fn test_h2c_end_to_end_echo() {
        let listener = listen_local(echo_handler()).await;
        let addr = listener.addr().as_socket_addr().unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                .await
                .unwrap();
        tokio::spawn(conn);

        let (body_tx, body_rx) = mpsc::channel::<std::result::Result<Frame<Bytes>, io::Error>>(4);
        let body = StreamBody::new(tokio_stream_from(body_rx));
        let request = Request::builder()
            .uri("http://example.com/tunnel")
            .body(body)
            .unwrap();

        // headers arrive before any payload is written
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CACHE_CONTROL], "no-store");

        let mut body = response.into_body();
        body_tx
            .send(Ok(Frame::data(Bytes::from_static(b"hello"))))
            .await
            .unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < 5 {
            let frame = body.frame().await.unwrap().unwrap();
            if let Ok(data) = frame.into_data() {
                echoed.extend_from_slice(&data);
            }
        }
        assert_eq!(echoed, b"hello");

        drop(body_tx);
        listener.close().unwrap();
    }

    #[tokio::test]
    async fn test_tls_negotiates_h2_and_echoes() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, certified.cert.pem()).unwrap();
        std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();

        let settings = ListenerSettings {
            tls: Some(TlsSettings { cert, key }),
            ..tunnel_settings()
        };
        let mode = TransportMode::from_settings(&settings).unwrap();
        assert!(mode.is_tls());
        let listener = listen(
            ListenAddr::Tcp("127.0.0.1:0".parse().unwrap()),
            settings,
            mode,
            echo_handler(),
            None,
        )
        .await
        .unwrap();
        let addr = listener.addr().as_socket_addr().unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(certified.cert.der().clone()).unwrap();
        let mut client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        client_config.alpn_protocols = vec![b"h2".to_vec()];
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

        let tcp = TcpStream::connect(addr).await.unwrap();
        let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let tls = connector.connect(server_name, tcp).await.unwrap();
        assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

        let (mut sender, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
                .await
                .unwrap();
        tokio::spawn(conn);

        let (body_tx, body_rx) = mpsc::channel::<std::result::Result<Frame<Bytes>, io::Error>>(4);
        let request = Request::builder()
            .uri("https://example.com/tunnel")
            .body(StreamBody::new(tokio_stream_from(body_rx)))
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.version(), http::Version::HTTP_2);

        body_tx
            .send(Ok(Frame::data(Bytes::from_static(b"secure"))))
            .await
            .unwrap();
        let mut body = response.into_body();
        let mut echoed = Vec::new();
        while echoed.len() < 6 {
            let frame = body.frame().await.unwrap().unwrap();
            if let Ok(data) = frame.into_data() {
                echoed.extend_from_slice(&data);
            }
        }
        assert_eq!(echoed, b"secure");

        drop(body_tx);
        listener.close().unwrap();
    }

    #[tokio::test]
    async fn test_http1_unknown_host_gets_404() {
        let (handler, count) = counting_handler();
        let listener = listen_local(handler).await;
        let addr = listener.addr().as_socket_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /tunnel HTTP/1.1\r\nHost: other.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 404"), "{response}");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        listener.close().unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_lock_once() {
        struct CountingLocker(Arc<AtomicUsize>);
        impl FileLocker for CountingLocker {
            fn release(self: Box<Self>) -> io::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let releases = Arc::new(AtomicUsize::new(0));
        let (handler, _) = counting_handler();
        let listener = listen(
            ListenAddr::Unix(dir.path().join("hub.sock")),
            ListenerSettings::default(),
            TransportMode::Plaintext,
            handler,
            Some(Box::new(CountingLocker(releases.clone()))),
        )
        .await
        .unwrap();

        listener.close().unwrap();
        listener.close().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn test_unix_socket_serves_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.sock");
        let (handler, count) = counting_handler();
        let listener = listen(
            ListenAddr::Unix(path.clone()),
            ListenerSettings::default(),
            TransportMode::Plaintext,
            handler,
            None,
        )
        .await
        .unwrap();

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: local\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 12];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 200");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        listener.close().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let (handler, _) = counting_handler();

        let result = listen(
            ListenAddr::Tcp(addr),
            ListenerSettings::default(),
            TransportMode::Plaintext,
            handler,
            None,
        )
        .await;
        assert!(matches!(result, Err(TunnelError::Bind { .. })));
    }

    fn tokio_stream_from<T: Send + 'static>(
        mut rx: mpsc::Receiver<T>,
    ) -> impl futures_util::Stream<Item = T> + Send + Unpin {
        Box::pin(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }
}
