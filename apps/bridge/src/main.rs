use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use h2::RecvStream;
use h2::server::SendResponse;
use h2_tunnel_common::{
    H2Stream, TunnelError,
    constants::{RECONNECT_MAX_DELAY_MS, RECONNECT_MIN_DELAY_MS, RECONNECT_MULTIPLIER},
    generate_connection_id,
};
use http::{Request, Response, StatusCode};
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// CLI arguments for the bridge
#[derive(Parser, Debug)]
#[command(name = "bridge")]
#[command(about = "Reverse-tunnel bridge relaying portal streams to a local service", long_about = None)]
#[command(version)]
struct Args {
    /// Portal registration endpoint (host:port)
    #[arg(short, long, env = "BRIDGE_PORTAL", default_value = "127.0.0.1:9000")]
    portal: String,

    /// Local service every stream is relayed to (host:port)
    #[arg(short, long, env = "BRIDGE_TARGET", default_value = "127.0.0.1:3000")]
    target: String,

    /// Number of parallel sessions registered with the portal
    #[arg(short, long, default_value = "1")]
    sessions: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Connection timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,
}

/// Configuration for the bridge
#[derive(Debug, Clone)]
pub struct Config {
    /// Portal registration endpoint
    pub portal_address: String,

    /// Local service address
    pub target_address: String,

    /// Parallel sessions, each registered as one worker
    pub sessions: usize,

    /// Timeout for dialing the portal or the target
    pub connect_timeout: Duration,

    /// Reconnection strategy
    pub reconnect_config: ReconnectConfig,
}

/// Reconnection configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: Option<usize>,
}

impl ReconnectConfig {
    /// Delay following `current`, capped at `max_delay`
    fn next_delay(&self, current: Duration) -> Duration {
        Duration::from_millis(
            ((current.as_millis() as f64 * self.multiplier).min(self.max_delay.as_millis() as f64))
                as u64,
        )
    }
}

impl Config {
    fn from_args(args: Args) -> Self {
        Self {
            portal_address: args.portal,
            target_address: args.target,
            sessions: args.sessions.max(1),
            connect_timeout: Duration::from_secs(args.connect_timeout),
            reconnect_config: ReconnectConfig {
                min_delay: Duration::from_millis(RECONNECT_MIN_DELAY_MS),
                max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
                multiplier: RECONNECT_MULTIPLIER,
                max_attempts: None, // Infinite retries
            },
        }
    }
}

/// Session state tracking
#[derive(Debug, Clone, PartialEq)]
enum SessionState {
    Disconnected,
    Connecting,
    Registered,
    Reconnecting { attempt: usize, next_delay: Duration },
}

/// Keeps one registered session with the portal alive
pub struct SessionManager {
    index: usize,
    config: Config,
    state: Arc<Mutex<SessionState>>,
}

impl SessionManager {
    pub fn new(index: usize, config: Config) -> Self {
        Self {
            index,
            config,
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
        }
    }

    async fn set_state(&self, next: SessionState) {
        *self.state.lock().await = next;
    }

    /// Main run loop with automatic reconnection.
    ///
    /// `max_attempts` bounds consecutive failed dials; a registered session
    /// resets the count.
    pub async fn run(&self) -> Result<()> {
        let reconnect = &self.config.reconnect_config;
        let mut reconnect_delay = reconnect.min_delay;
        let mut attempt = 0;

        loop {
            self.set_state(SessionState::Connecting).await;

            match self.establish_session().await {
                Ok(socket) => {
                    info!(session = self.index, portal = %self.config.portal_address, "registered with portal");
                    self.set_state(SessionState::Registered).await;
                    reconnect_delay = reconnect.min_delay;
                    attempt = 0;

                    if let Err(e) = serve_session(
                        socket,
                        &self.config.target_address,
                        self.config.connect_timeout,
                    )
                    .await
                    {
                        error!(session = self.index, error = %e, "session error");
                    }
                    self.set_state(SessionState::Disconnected).await;
                }
                Err(e) => {
                    attempt += 1;
                    error!(session = self.index, attempt, error = %e, "failed to connect");
                    if reconnect.max_attempts.is_some_and(|max| attempt >= max) {
                        self.set_state(SessionState::Disconnected).await;
                        return Err(TunnelError::SessionClosed)
                            .context(format!("giving up after {attempt} attempts"));
                    }
                }
            }

            self.set_state(SessionState::Reconnecting {
                attempt,
                next_delay: reconnect_delay,
            })
            .await;

            info!(
                session = self.index,
                "Reconnecting in {:?} (attempt {})", reconnect_delay, attempt + 1
            );
            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = reconnect.next_delay(reconnect_delay);
        }
    }

    async fn establish_session(&self) -> Result<TcpStream> {
        debug!(session = self.index, "Connecting to {}", self.config.portal_address);
        let socket = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.portal_address),
        )
        .await
        .context("portal connect timed out")?
        .with_context(|| format!("failed to connect to {}", self.config.portal_address))?;
        socket.set_nodelay(true)?;
        Ok(socket)
    }
}

/// Serve the HTTP/2 side of a registered session until the portal goes away.
///
/// Every stream the portal opens is relayed to `target`.
async fn serve_session<T>(io: T, target: &str, connect_timeout: Duration) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut connection = h2::server::handshake(io)
        .await
        .context("HTTP/2 handshake with portal failed")?;

    while let Some(accepted) = connection.accept().await {
        let (request, respond) = accepted.context("portal session failed")?;
        let id = generate_connection_id();
        let target = target.to_string();
        tokio::spawn(
            async move {
                if let Err(e) = relay_stream(request, respond, &target, connect_timeout).await {
                    warn!(error = %e, "stream relay failed");
                }
            }
            .instrument(info_span!("stream", conn = %id)),
        );
    }

    info!("Portal closed session");
    Ok(())
}

/// Connect to the target, then accept the stream and copy both ways.
///
/// A target that cannot be reached is reported to the portal as `502`.
async fn relay_stream(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    target: &str,
    connect_timeout: Duration,
) -> Result<()> {
    let connected = tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await;
    let mut upstream = match connected {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            reject(&mut respond);
            return Err(e).with_context(|| format!("failed to connect to {target}"));
        }
        Err(_) => {
            reject(&mut respond);
            anyhow::bail!("connect to {target} timed out");
        }
    };
    let _ = upstream.set_nodelay(true);

    let mut stream = H2Stream::accept(request, respond)?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
    debug!(sent, received, "stream finished");
    Ok(())
}

fn reject(respond: &mut SendResponse<Bytes>) {
    let mut response = Response::new(());
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    if let Err(e) = respond.send_response(response, true) {
        debug!(error = %e, "failed to refuse stream");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("h2-tunnel bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Portal: {}", args.portal);
    info!("Target: {}", args.target);

    let config = Config::from_args(args);

    let mut sessions = tokio::task::JoinSet::new();
    for index in 0..config.sessions {
        let manager = SessionManager::new(index, config.clone());
        sessions.spawn(async move { manager.run().await });
    }

    // Run until interrupted
    tokio::select! {
        Some(result) = sessions.join_next() => {
            error!("Session manager exited: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
        }
    }
    sessions.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2_tunnel_common::TunnelError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn args() -> Args {
        Args {
            portal: "portal.example.com:9000".to_string(),
            target: "127.0.0.1:8080".to_string(),
            sessions: 2,
            verbose: false,
            connect_timeout: 10,
        }
    }

    async fn echo_target() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = socket.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr.to_string()
    }

    /// Run a bridge session over an in-memory pipe and return the portal's
    /// side of the HTTP/2 connection.
    async fn bridge_session(target: String) -> h2::client::SendRequest<Bytes> {
        let (portal_io, bridge_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = serve_session(bridge_io, &target, Duration::from_secs(1)).await;
        });
        let (sender, connection) = h2::client::handshake(portal_io).await.unwrap();
        tokio::spawn(connection);
        sender
    }

    #[test]
    fn test_config_from_args() {
        let config = Config::from_args(args());
        assert_eq!(config.portal_address, "portal.example.com:9000");
        assert_eq!(config.target_address, "127.0.0.1:8080");
        assert_eq!(config.sessions, 2);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_sessions_means_one() {
        let mut args = args();
        args.sessions = 0;
        assert_eq!(Config::from_args(args).sessions, 1);
    }

    #[test]
    fn test_reconnect_config_defaults() {
        let config = Config::from_args(args());
        let reconnect = &config.reconnect_config;

        assert_eq!(
            reconnect.min_delay,
            Duration::from_millis(RECONNECT_MIN_DELAY_MS)
        );
        assert_eq!(
            reconnect.max_delay,
            Duration::from_millis(RECONNECT_MAX_DELAY_MS)
        );
        assert_eq!(reconnect.multiplier, RECONNECT_MULTIPLIER);
        assert_eq!(reconnect.max_attempts, None);
    }

    #[test]
    fn test_backoff_doubles_and_saturates() {
        let reconnect = Config::from_args(args()).reconnect_config;
        let mut delay = reconnect.min_delay;
        let mut seen = vec![delay];
        for _ in 0..8 {
            delay = reconnect.next_delay(delay);
            seen.push(delay);
        }
        assert_eq!(seen[1], Duration::from_secs(2));
        assert_eq!(seen[2], Duration::from_secs(4));
        assert_eq!(*seen.last().unwrap(), reconnect.max_delay);
    }

    #[tokio::test]
    async fn test_stream_relayed_to_target() {
        let sender = bridge_session(echo_target().await).await;

        let mut stream = H2Stream::open(&sender).await.unwrap();
        stream.write_all(b"hello bridge").await.unwrap();
        let mut buf = [0u8; 12];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello bridge");
    }

    #[tokio::test]
    async fn test_unreachable_target_refuses_stream() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = unused.local_addr().unwrap().to_string();
        drop(unused);

        let sender = bridge_session(target).await;
        let err = H2Stream::open(&sender).await.err().unwrap();
        assert!(matches!(err, TunnelError::Internal(_)));
        assert!(err.to_string().contains("502"));
    }

    async fn refused_portal() -> String {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap().to_string();
        drop(unused);
        addr
    }

    #[tokio::test]
    async fn test_give_up_after_max_attempts() {
        let mut config = Config::from_args(args());
        config.portal_address = refused_portal().await;
        config.reconnect_config.min_delay = Duration::from_millis(1);
        config.reconnect_config.max_attempts = Some(2);

        let manager = SessionManager::new(0, config);
        let err = manager.run().await.unwrap_err();
        assert!(err.to_string().contains("giving up after 2 attempts"));
        assert_eq!(*manager.state.lock().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_single_attempt_does_not_back_off() {
        let mut config = Config::from_args(args());
        config.portal_address = refused_portal().await;
        config.reconnect_config.max_attempts = Some(1);

        let started = std::time::Instant::now();
        let manager = SessionManager::new(0, config);
        let err = manager.run().await.unwrap_err();
        assert!(err.to_string().contains("giving up after 1 attempts"));
        assert!(started.elapsed() < Duration::from_millis(RECONNECT_MIN_DELAY_MS));
    }
}
