//! Worker pickers
//!
//! Both pickers hand out a [`WorkerLease`] so that checking availability
//! and reserving a stream slot happen together under the pool lock.

use h2_tunnel_common::{Result, TunnelError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Worker, WorkerLease, WorkerState};

/// Chooses a worker with spare capacity for a new sub-stream
pub trait Picker: Send + Sync {
    /// Returns a reserved slot, or `NoAvailableWorker` when every worker is
    /// closed, draining or full.
    fn pick_available(&self) -> Result<WorkerLease>;
}

#[derive(Default)]
struct Pool {
    workers: Vec<Arc<Worker>>,
    cursor: usize,
}

impl Pool {
    /// Round-robin from the cursor; the cursor moves past the chosen worker.
    fn pick(&mut self) -> Option<WorkerLease> {
        let len = self.workers.len();
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            if let Some(lease) = self.workers[index].try_reserve() {
                self.cursor = (index + 1) % len;
                return Some(lease);
            }
        }
        None
    }

    fn evict_closed(&mut self) -> usize {
        let before = self.workers.len();
        self.workers.retain(|w| w.state() != WorkerState::Closed);
        let evicted = before - self.workers.len();
        if evicted > 0 {
            self.cursor = 0;
        }
        evicted
    }
}

/// Fixed worker set; closed workers are never replaced
pub struct StaticPicker {
    pool: Mutex<Pool>,
}

impl StaticPicker {
    /// Workers are activated as they are handed over.
    pub fn new(workers: Vec<Arc<Worker>>) -> Self {
        for worker in &workers {
            worker.activate();
        }
        Self {
            pool: Mutex::new(Pool { workers, cursor: 0 }),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Picker for StaticPicker {
    fn pick_available(&self) -> Result<WorkerLease> {
        let mut pool = self.lock();
        if let Some(lease) = pool.pick() {
            return Ok(lease);
        }
        pool.evict_closed();
        Err(TunnelError::NoAvailableWorker)
    }
}

/// Worker set that grows as bridges register and is swept periodically
pub struct DynamicPicker {
    pool: Mutex<Pool>,
    idle_timeout: Duration,
}

impl DynamicPicker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            pool: Mutex::new(Pool::default()),
            idle_timeout,
        }
    }

    /// Activate a freshly registered worker and make it pickable.
    pub fn register(&self, worker: Arc<Worker>) {
        worker.activate();
        info!(worker = %worker.id(), capacity = worker.capacity(), "worker registered");
        self.lock().workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close idle workers, drop closed ones and rank the rest by load.
    ///
    /// Returns the number of workers evicted.
    pub fn sweep(&self) -> usize {
        let mut pool = self.lock();
        for worker in &pool.workers {
            worker.close_if_idle(self.idle_timeout);
        }
        let evicted = pool.evict_closed();
        pool.workers.sort_by_key(|w| w.active_streams());
        pool.cursor = 0;
        if evicted > 0 {
            debug!(evicted, remaining = pool.workers.len(), "picker swept");
        }
        evicted
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
        debug!("picker sweeper stopped");
    }

    /// Stop handing out every worker; each closes once its streams end.
    pub fn drain_all(&self) {
        for worker in &self.lock().workers {
            worker.drain();
        }
    }

    /// Close every worker and empty the pool.
    pub fn close_all(&self) {
        let mut pool = self.lock();
        for worker in pool.workers.drain(..) {
            worker.close();
        }
        pool.cursor = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Picker for DynamicPicker {
    fn pick_available(&self) -> Result<WorkerLease> {
        let mut pool = self.lock();
        if let Some(lease) = pool.pick() {
            return Ok(lease);
        }
        // Nothing usable; drop the dead weight so the next register is picked.
        pool.evict_closed();
        Err(TunnelError::NoAvailableWorker)
    }
}
