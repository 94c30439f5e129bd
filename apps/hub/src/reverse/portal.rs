//! Portal: public side of a reverse tunnel
//!
//! Every inbound connection is paired with a fresh sub-stream on a picked
//! worker and bytes are relayed both ways until either side finishes.

use h2_tunnel_common::constants::{MAX_PICK_ATTEMPTS, PORTAL_DRAIN_TIMEOUT_SECS};
use h2_tunnel_common::{Result, TunnelError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{Inbound, InboundConn, Picker, WorkerStream};

/// Delay before accepting again after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub struct Portal {
    tag: String,
    state: Mutex<PortalState>,
    accepting: CancellationToken,
    relays: CancellationToken,
    tracker: TaskTracker,
}

impl Portal {
    /// Start relaying connections from `inbound` through workers of `picker`.
    pub fn start<I: Inbound>(tag: impl Into<String>, inbound: I, picker: Arc<dyn Picker>) -> Self {
        let portal = Self {
            tag: tag.into(),
            state: Mutex::new(PortalState::Starting),
            accepting: CancellationToken::new(),
            relays: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };

        let span = info_span!("portal", tag = %portal.tag);
        portal.tracker.spawn(
            accept_loop(
                inbound,
                picker,
                portal.accepting.clone(),
                portal.relays.clone(),
                portal.tracker.clone(),
            )
            .instrument(span),
        );
        portal.set_state(PortalState::Running);
        info!(tag = %portal.tag, "portal started");
        portal
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> PortalState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop accepting and drain in-flight relays, aborting whatever is
    /// still running after the default drain timeout.
    pub async fn close(&self) {
        self.close_within(Duration::from_secs(PORTAL_DRAIN_TIMEOUT_SECS))
            .await
    }

    /// Like [`Portal::close`] with an explicit drain timeout.
    pub async fn close_within(&self, grace: Duration) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, PortalState::Stopping | PortalState::Stopped) {
                return;
            }
            *state = PortalState::Stopping;
        }

        self.accepting.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(tag = %self.tag, relays = self.tracker.len(), "drain timed out, aborting relays");
            self.relays.cancel();
            self.tracker.wait().await;
        }

        self.set_state(PortalState::Stopped);
        info!(tag = %self.tag, "portal stopped");
    }

    fn set_state(&self, next: PortalState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        self.accepting.cancel();
        self.relays.cancel();
    }
}

async fn accept_loop<I: Inbound>(
    mut inbound: I,
    picker: Arc<dyn Picker>,
    accepting: CancellationToken,
    relays: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let conn = tokio::select! {
            _ = accepting.cancelled() => break,
            result = inbound.accept() => result,
        };

        match conn {
            Ok(Some(conn)) => {
                let span = info_span!("relay", conn = %conn.id);
                tracker.spawn(
                    bridge_inbound(conn, picker.clone(), relays.clone()).instrument(span),
                );
            }
            Ok(None) => {
                debug!("inbound exhausted");
                break;
            }
            Err(e) => {
                warn!(error = %e, "failed to accept inbound connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Pick a worker and open a sub-stream, retrying when the worker turns out
/// to be dead.
async fn open_worker_stream(picker: &dyn Picker) -> Result<WorkerStream> {
    let mut last_error = TunnelError::NoAvailableWorker;
    for attempt in 1..=MAX_PICK_ATTEMPTS {
        let lease = picker.pick_available()?;
        let worker = lease.worker().id().to_string();
        match lease.open_stream().await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.is_retryable() => {
                debug!(worker, attempt, error = %e, "worker unusable, picking again");
                last_error = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error)
}

async fn bridge_inbound(mut conn: InboundConn, picker: Arc<dyn Picker>, cancel: CancellationToken) {
    let mut upstream = match open_worker_stream(picker.as_ref()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = ?conn.peer, error = %e, "no worker for inbound connection");
            let _ = conn.stream.shutdown().await;
            return;
        }
    };
    debug!(worker = %upstream.worker().id(), peer = ?conn.peer, "relaying");

    tokio::select! {
        _ = cancel.cancelled() => debug!("relay aborted by portal shutdown"),
        result = tokio::io::copy_bidirectional(&mut conn.stream, &mut upstream) => match result {
            Ok((sent, received)) => debug!(sent, received, "relay finished"),
            Err(e) => debug!(error = %e, "relay ended with error"),
        },
    }
}
