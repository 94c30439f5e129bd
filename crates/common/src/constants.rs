/// Time allowed for a client to send request headers (4 seconds)
pub const READ_HEADER_TIMEOUT_SECS: u64 = 4;

/// Path prefix accepted when none is configured
pub const DEFAULT_PATH: &str = "/";

/// Header value sent on every accepted tunnel response
pub const CACHE_CONTROL_NO_STORE: &str = "no-store";

/// Default number of concurrent sub-streams one worker may carry
pub const DEFAULT_MAX_STREAMS_PER_WORKER: usize = 16;

/// Interval between dynamic picker sweeps (10 seconds)
pub const SWEEP_INTERVAL_SECS: u64 = 10;

/// Workers without open streams for this long are closed (5 minutes)
pub const WORKER_IDLE_TIMEOUT_SECS: u64 = 300;

/// Timeout for the HTTP/2 handshake with a registering bridge (10 seconds)
pub const REGISTRATION_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Pick attempts per inbound connection before giving up
pub const MAX_PICK_ATTEMPTS: usize = 3;

/// Connections queued between a tunnel listener and its portal
pub const PORTAL_BACKLOG: usize = 128;

/// Time a closing portal waits for in-flight relays before aborting them (5 seconds)
pub const PORTAL_DRAIN_TIMEOUT_SECS: u64 = 5;

/// Minimum delay for exponential backoff reconnection (1 second)
pub const RECONNECT_MIN_DELAY_MS: u64 = 1000;

/// Maximum delay for exponential backoff reconnection (60 seconds)
pub const RECONNECT_MAX_DELAY_MS: u64 = 60000;

/// Multiplier for exponential backoff reconnection
pub const RECONNECT_MULTIPLIER: f64 = 2.0;

/// Buffered body frames between a connection writer and the HTTP response
pub const BODY_CHANNEL_CAPACITY: usize = 1;
