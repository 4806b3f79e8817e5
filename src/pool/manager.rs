//! # WorkerPool — warm pool of tokenizer processes
//!
//! ## Responsibility
//! Start `pool_size` workers up front, hand them out through
//! [`WorkerPool::acquire`], take them back when the [`WorkerLease`] drops
//! and respawn the ones that broke.
//!
//! ## Guarantees
//! - Fair-ish: idle workers sit in a FIFO; waiters are served by a
//!   semaphore whose permits equal the idle count.
//! - Leak-free: a lease always returns (or retires) its worker on drop.
//! - Isolated failure: one crashed worker costs one request, never the pool.
//!
//! ## NOT Responsible For
//! - Talking to a single process (see: worker.rs)
//! - Retry policy (callers decide)

use super::protocol::WorkerRequest;
use super::worker::PooledWorker;
use super::{PoolConfig, PoolError, Tokenizer};
use crate::metrics;
use crate::model::TokenId;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured size.
    pub configured: usize,
    /// Idle workers.
    pub available: usize,
    /// Workers currently leased.
    pub busy: usize,
    /// Live processes (idle + leased).
    pub live: usize,
    /// Successful respawns since start.
    pub restarts: u64,
    /// Whether `shutdown` has run.
    pub shut_down: bool,
}

struct PoolInner {
    config: PoolConfig,
    idle: Mutex<VecDeque<PooledWorker>>,
    permits: Semaphore,
    live: AtomicUsize,
    restarts: AtomicU64,
    next_id: AtomicUsize,
    shut_down: AtomicBool,
}

impl PoolInner {
    fn next_worker_id(&self) -> String {
        format!("worker-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Queue `worker` as idle. The shutdown flag is checked under the idle
    /// lock, so a worker can never land in the queue after `shutdown` has
    /// drained it; in that case the worker is handed back.
    fn push_idle(&self, worker: PooledWorker) -> Result<(), PooledWorker> {
        let available = {
            let mut idle = self.idle.lock();
            if self.shut_down.load(Ordering::SeqCst) {
                return Err(worker);
            }
            idle.push_back(worker);
            idle.len()
        };
        self.permits.add_permits(1);
        metrics::set_workers_available(available);
        Ok(())
    }

    fn retire(&self, mut worker: PooledWorker) {
        debug!(worker_id = %worker.id(), "pool shut down, retiring returned worker");
        worker.kill();
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn release(self: &Arc<Self>, mut worker: PooledWorker) {
        if self.shut_down.load(Ordering::SeqCst) {
            self.retire(worker);
            return;
        }

        if worker.is_reusable() {
            debug!(worker_id = %worker.id(), "worker released");
            if let Err(worker) = self.push_idle(worker) {
                self.retire(worker);
            }
            return;
        }

        if worker.is_in_flight() {
            warn!(worker_id = %worker.id(), "worker returned mid-request, respawning");
        } else {
            warn!(worker_id = %worker.id(), "discarding unhealthy worker, respawning");
        }
        worker.kill();
        drop(worker);
        self.live.fetch_sub(1, Ordering::SeqCst);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move { inner.respawn().await });
            }
            Err(_) => {
                error!("no async runtime to respawn worker, pool capacity reduced");
            }
        }
    }

    async fn respawn(self: Arc<Self>) {
        let id = self.next_worker_id();
        match PooledWorker::spawn(id.clone(), &self.config).await {
            Ok(worker) => {
                if self.shut_down.load(Ordering::SeqCst) {
                    worker.shutdown(self.config.shutdown_grace()).await;
                    return;
                }
                self.live.fetch_add(1, Ordering::SeqCst);
                self.restarts.fetch_add(1, Ordering::Relaxed);
                metrics::inc_worker_restart();
                info!(worker_id = %id, "replacement worker ready");
                if let Err(worker) = self.push_idle(worker) {
                    self.retire(worker);
                }
            }
            Err(e) => {
                error!(
                    worker_id = %id,
                    error = %e,
                    live = self.live.load(Ordering::SeqCst),
                    "worker restart failed, pool capacity reduced"
                );
            }
        }
    }
}

/// Warm pool of tokenizer subprocesses.
///
/// Cheap to clone; all clones share the same workers.
///
/// # Example
///
/// ```rust,no_run
/// use tokio_completion_orchestrator::pool::{PoolConfig, WorkerPool};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = WorkerPool::initialize(PoolConfig::new("byte_tokenizer", 3)).await?;
/// let tokens = pool.tokenize("fn main() {}").await?;
/// let text = pool.detokenize(tokens).await?;
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn every worker in parallel and wait for all ready lines.
    ///
    /// # Errors
    ///
    /// The first worker error if any worker fails to start; workers that
    /// did start are killed. The process cannot serve without tokenizers,
    /// so callers should treat this as fatal.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn initialize(config: PoolConfig) -> Result<Self, PoolError> {
        let start = Instant::now();
        let inner = Arc::new(PoolInner {
            idle: Mutex::new(VecDeque::with_capacity(config.pool_size)),
            permits: Semaphore::new(0),
            live: AtomicUsize::new(0),
            restarts: AtomicU64::new(0),
            next_id: AtomicUsize::new(1),
            shut_down: AtomicBool::new(false),
            config,
        });

        info!(
            pool_size = inner.config.pool_size,
            program = %inner.config.program,
            "starting worker pool"
        );

        let spawns = (0..inner.config.pool_size).map(|_| {
            let id = inner.next_worker_id();
            let config = &inner.config;
            async move { PooledWorker::spawn(id, config).await }
        });
        let results = join_all(spawns).await;

        let mut workers = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    error!(error = %e, "worker failed to start");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            for mut worker in workers {
                worker.kill();
            }
            return Err(e);
        }

        inner.live.store(workers.len(), Ordering::SeqCst);
        for worker in workers {
            if let Err(worker) = inner.push_idle(worker) {
                inner.retire(worker);
            }
        }

        info!(
            pool_size = inner.config.pool_size,
            startup_ms = start.elapsed().as_millis() as u64,
            "worker pool ready"
        );
        Ok(Self { inner })
    }

    /// Check out a worker, waiting up to the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// [`PoolError::AcquireTimeout`] or [`PoolError::ShutDown`].
    pub async fn acquire(&self) -> Result<WorkerLease, PoolError> {
        self.acquire_timeout(self.inner.config.acquire_timeout())
            .await
    }

    /// Check out a worker, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// [`PoolError::AcquireTimeout`] or [`PoolError::ShutDown`].
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<WorkerLease, PoolError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }

        let permit = match tokio::time::timeout(timeout, self.inner.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::ShutDown),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "worker acquire timed out");
                return Err(PoolError::AcquireTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };
        permit.forget();

        let (worker, available) = {
            let mut idle = self.inner.idle.lock();
            (idle.pop_front(), idle.len())
        };
        metrics::set_workers_available(available);

        match worker {
            Some(worker) => {
                debug!(worker_id = %worker.id(), available, "worker acquired");
                Ok(WorkerLease {
                    worker: Some(worker),
                    pool: Arc::clone(&self.inner),
                })
            }
            None => Err(PoolError::ShutDown),
        }
    }

    /// Tokenize `text` on any idle worker.
    ///
    /// # Errors
    ///
    /// Any [`PoolError`] from acquisition or the round trip.
    pub async fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, PoolError> {
        self.acquire().await?.tokenize(text).await
    }

    /// Detokenize `tokens` on any idle worker.
    ///
    /// # Errors
    ///
    /// Any [`PoolError`] from acquisition or the round trip.
    pub async fn detokenize(&self, tokens: Vec<TokenId>) -> Result<String, PoolError> {
        self.acquire().await?.detokenize(tokens).await
    }

    /// Ping one idle worker.
    ///
    /// # Errors
    ///
    /// Any [`PoolError`] from acquisition or the round trip.
    pub async fn ping(&self) -> Result<Duration, PoolError> {
        self.acquire().await?.ping().await
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let available = self.inner.idle.lock().len();
        let live = self.inner.live.load(Ordering::SeqCst);
        PoolStats {
            configured: self.inner.config.pool_size,
            available,
            busy: live.saturating_sub(available),
            live,
            restarts: self.inner.restarts.load(Ordering::Relaxed),
            shut_down: self.inner.shut_down.load(Ordering::SeqCst),
        }
    }

    /// The configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Stop every idle worker gracefully; leased workers are retired when
    /// their lease drops. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("worker pool already shut down");
            return;
        }
        self.inner.permits.close();

        let workers: Vec<PooledWorker> = self.inner.idle.lock().drain(..).collect();
        let count = workers.len();
        let grace = self.inner.config.shutdown_grace();
        join_all(workers.into_iter().map(|w| w.shutdown(grace))).await;
        self.inner.live.fetch_sub(count, Ordering::SeqCst);
        metrics::set_workers_available(0);

        info!(stopped = count, "worker pool shut down");
    }
}

#[async_trait]
impl Tokenizer for WorkerPool {
    async fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, PoolError> {
        WorkerPool::tokenize(self, text).await
    }

    async fn detokenize(&self, tokens: Vec<TokenId>) -> Result<String, PoolError> {
        WorkerPool::detokenize(self, tokens).await
    }
}

/// Exclusive checkout of one worker.
///
/// Dropping the lease returns the worker to the pool, or retires and
/// respawns it if it was marked unhealthy or dropped mid-request.
#[must_use = "dropping a lease immediately returns the worker"]
pub struct WorkerLease {
    worker: Option<PooledWorker>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.worker)
            .finish()
    }
}

impl WorkerLease {
    fn worker_mut(&mut self) -> Result<&mut PooledWorker, PoolError> {
        self.worker.as_mut().ok_or(PoolError::ShutDown)
    }

    /// Id of the leased worker.
    pub fn worker_id(&self) -> &str {
        self.worker.as_ref().map_or("", |w| w.id())
    }

    /// Health of the leased worker.
    pub fn is_healthy(&self) -> bool {
        self.worker.as_ref().is_some_and(PooledWorker::is_healthy)
    }

    /// Flag the leased worker for replacement on release.
    pub fn mark_unhealthy(&mut self) {
        if let Some(worker) = self.worker.as_mut() {
            worker.mark_unhealthy();
        }
    }

    /// Raw round trip with the pool's request timeout.
    ///
    /// # Errors
    ///
    /// See [`PooledWorker::send`].
    pub async fn send(
        &mut self,
        request: &WorkerRequest,
    ) -> Result<super::WorkerResponse, PoolError> {
        let timeout = self.pool.config.request_timeout();
        self.worker_mut()?.send(request, timeout).await
    }

    /// `TOKENIZE` round trip.
    ///
    /// # Errors
    ///
    /// Worker failures, or [`PoolError::Malformed`] if the result is not a
    /// token array.
    pub async fn tokenize(&mut self, text: &str) -> Result<Vec<TokenId>, PoolError> {
        let resp = self.send(&WorkerRequest::tokenize(text)).await?;
        resp.tokens().ok_or_else(|| self.malformed("result is not a token array"))
    }

    /// `DETOKENIZE` round trip.
    ///
    /// # Errors
    ///
    /// Worker failures, or [`PoolError::Malformed`] if the result is not a
    /// string.
    pub async fn detokenize(&mut self, tokens: Vec<TokenId>) -> Result<String, PoolError> {
        let resp = self.send(&WorkerRequest::detokenize(tokens)).await?;
        resp.text().ok_or_else(|| self.malformed("result is not text"))
    }

    /// `PING` round trip; returns the measured latency.
    ///
    /// # Errors
    ///
    /// Any worker failure.
    pub async fn ping(&mut self) -> Result<Duration, PoolError> {
        let start = Instant::now();
        self.send(&WorkerRequest::ping()).await?;
        Ok(start.elapsed())
    }

    fn malformed(&mut self, reason: &str) -> PoolError {
        self.mark_unhealthy();
        PoolError::Malformed {
            worker_id: self.worker_id().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Return the worker now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }
}
