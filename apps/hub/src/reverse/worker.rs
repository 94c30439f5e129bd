//! Worker: one registered multiplexed session
//!
//! A worker moves through `Registering -> Active -> Draining -> Closed`.
//! Stream slots are reserved atomically against the worker's capacity before
//! a sub-stream is opened, and released when the sub-stream is dropped.

use futures_util::future::BoxFuture;
use h2_tunnel_common::{Result, TunnelError, generate_worker_id};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info};

use super::BoxedStream;

/// Multiplexed transport session able to open logical sub-streams
pub trait MuxSession: Send + Sync + 'static {
    fn open_stream(&self) -> BoxFuture<'_, Result<BoxedStream>>;

    fn is_closed(&self) -> bool;

    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Registering = 0,
    Active = 1,
    Draining = 2,
    Closed = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Registering,
            1 => Self::Active,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

pub struct Worker {
    id: String,
    session: Box<dyn MuxSession>,
    state: AtomicU8,
    active: AtomicUsize,
    capacity: usize,
    last_used: Mutex<Instant>,
}

impl Worker {
    /// Wrap a session; the worker starts in `Registering`.
    pub fn new(session: impl MuxSession, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: generate_worker_id(),
            session: Box::new(session),
            state: AtomicU8::new(WorkerState::Registering as u8),
            active: AtomicUsize::new(0),
            capacity: capacity.max(1),
            last_used: Mutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Current state; a dead session is observed here as `Closed`.
    pub fn state(&self) -> WorkerState {
        let state = WorkerState::from_u8(self.state.load(Ordering::Acquire));
        if state != WorkerState::Closed && self.session.is_closed() {
            self.mark_closed();
            return WorkerState::Closed;
        }
        state
    }

    /// `Registering -> Active`; returns whether the transition happened.
    pub fn activate(&self) -> bool {
        self.transition(WorkerState::Registering, WorkerState::Active)
    }

    /// Session open and spare stream capacity left
    pub fn is_available(&self) -> bool {
        self.state() == WorkerState::Active && self.active_streams() < self.capacity
    }

    /// Reserve one stream slot, failing when not active or at capacity.
    pub fn try_reserve(self: &Arc<Self>) -> Option<WorkerLease> {
        if self.state() != WorkerState::Active {
            return None;
        }
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()?;
        Some(WorkerLease {
            worker: self.clone(),
        })
    }

    /// Reserve a slot and open a sub-stream in one step.
    pub async fn open_stream(self: &Arc<Self>) -> Result<WorkerStream> {
        match self.try_reserve() {
            Some(lease) => lease.open_stream().await,
            None if self.state() == WorkerState::Closed => Err(TunnelError::SessionClosed),
            None => Err(TunnelError::NoAvailableWorker),
        }
    }

    /// Stop taking new streams; the worker closes once in-flight streams end.
    pub fn drain(&self) {
        if self.transition(WorkerState::Active, WorkerState::Draining)
            || self.transition(WorkerState::Registering, WorkerState::Draining)
        {
            debug!(worker = %self.id, "worker draining");
        }
        if self.active_streams() == 0 && self.state() == WorkerState::Draining {
            self.mark_closed();
        }
    }

    pub fn close(&self) {
        self.mark_closed();
    }

    /// Close the worker when it has carried no stream for `idle_timeout`.
    pub fn close_if_idle(&self, idle_timeout: Duration) -> bool {
        if self.active_streams() > 0 || self.state() == WorkerState::Closed {
            return false;
        }
        if self.idle_for() < idle_timeout {
            return false;
        }
        debug!(worker = %self.id, "closing idle worker");
        self.mark_closed();
        true
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn mark_closed(&self) {
        let previous = self.state.swap(WorkerState::Closed as u8, Ordering::AcqRel);
        if previous != WorkerState::Closed as u8 {
            self.session.close();
            info!(worker = %self.id, "worker closed");
        }
    }

    fn release_slot(&self) {
        let remaining = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        self.touch();
        if remaining == 0 && self.state() == WorkerState::Draining {
            self.mark_closed();
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("active", &self.active_streams())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// A reserved stream slot on a worker, handed out by a picker
#[derive(Debug)]
pub struct WorkerLease {
    worker: Arc<Worker>,
}

impl WorkerLease {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Open a sub-stream using this slot.
    ///
    /// Fails with `SessionClosed` if the worker died since it was picked. A
    /// stream refused by the peer leaves the worker usable and comes back as
    /// `StreamReset`. Both are retryable by picking again.
    pub async fn open_stream(self) -> Result<WorkerStream> {
        let worker = self.worker.clone();
        match worker.session.open_stream().await {
            Ok(stream) => {
                worker.touch();
                Ok(WorkerStream {
                    inner: stream,
                    lease: self,
                })
            }
            Err(e) => {
                debug!(worker = %worker.id, error = %e, "failed to open sub-stream");
                if worker.session.is_closed() || e.is_session_fatal() {
                    worker.mark_closed();
                    return Err(TunnelError::SessionClosed);
                }
                Err(e)
            }
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.worker.release_slot();
    }
}

/// Sub-stream of a worker session; holds its slot until dropped
pub struct WorkerStream {
    inner: BoxedStream,
    lease: WorkerLease,
}

impl WorkerStream {
    pub fn worker(&self) -> &Arc<Worker> {
        self.lease.worker()
    }
}

impl fmt::Debug for WorkerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerStream")
            .field("worker", &self.worker().id())
            .finish()
    }
}

impl AsyncRead for WorkerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for WorkerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
