//! # Stage: Tokenizer Worker Pool
//!
//! ## Responsibility
//! Keep a fixed number of tokenizer subprocesses warm so requests never pay
//! their multi-second cold start. Hand them out one at a time, detect broken
//! ones and replace them in the background.
//!
//! ## Guarantees
//! - Bounded wait: [`WorkerPool::acquire`] gives up after the acquire
//!   timeout instead of blocking forever.
//! - Scoped checkout: a [`WorkerLease`] returns its worker on drop, on every
//!   exit path including errors and cancelled futures.
//! - Self-healing: a worker whose stream fails is marked unhealthy, killed
//!   on release and respawned asynchronously. A failed respawn is logged
//!   and shrinks the pool instead of crashing the process.
//! - Idempotent shutdown.
//!
//! ## NOT Responsible For
//! - Retrying failed requests (callers decide)
//! - The tokenization algorithm (lives in the worker binary)

pub mod manager;
pub mod protocol;
pub mod worker;

use crate::model::TokenId;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use manager::{PoolStats, WorkerLease, WorkerPool};
pub use protocol::{Command, Status, WorkerRequest, WorkerResponse};
pub use worker::PooledWorker;

/// Text ⇄ token-id conversion as seen by the decode loop.
///
/// [`WorkerPool`] is the production implementation; the trait exists so the
/// orchestrator can be driven by an in-process tokenizer in tests.
#[async_trait]
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids.
    async fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, PoolError>;

    /// Decode token ids back into text.
    async fn detokenize(&self, tokens: Vec<TokenId>) -> Result<String, PoolError>;
}

// ── Default value functions ────────────────────────────────────────────

fn default_program() -> String {
    "byte_tokenizer".to_string()
}

fn default_pool_size() -> usize {
    3
}

fn default_startup_timeout_ms() -> u64 {
    15_000
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    3_000
}

/// Worker pool configuration (`[pool]` section).
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PoolConfig {
    /// Worker executable.
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments passed to every worker.
    #[serde(default)]
    pub args: Vec<String>,

    /// Number of workers kept warm. Range `1..=32`.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long a worker may take to print its ready line.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// How long `acquire` waits for an idle worker.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Per-request round-trip limit.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long a worker gets to exit after `SHUTDOWN` before it is killed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            pool_size: default_pool_size(),
            startup_timeout_ms: default_startup_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl PoolConfig {
    /// Pool of `pool_size` workers running `program`.
    pub fn new(program: impl Into<String>, pool_size: usize) -> Self {
        Self {
            program: program.into(),
            pool_size,
            ..Self::default()
        }
    }

    /// Startup timeout as a [`Duration`].
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Acquire timeout as a [`Duration`].
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Errors raised by the worker pool.
///
/// # Panics
///
/// This type never panics.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The worker executable could not be started.
    #[error("failed to spawn {worker_id}: {source}")]
    Spawn {
        /// Worker that failed.
        worker_id: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A worker did not print its ready line in time.
    #[error("{worker_id} not ready after {timeout_ms}ms")]
    StartupTimeout {
        /// Worker that stalled.
        worker_id: String,
        /// Configured startup timeout.
        timeout_ms: u64,
    },

    /// A worker reported a startup error.
    #[error("{worker_id} failed to start: {message}")]
    StartupFailed {
        /// Worker that failed.
        worker_id: String,
        /// Worker-provided reason.
        message: String,
    },

    /// No worker became available within the acquire timeout.
    #[error("no tokenizer worker available within {timeout_ms}ms")]
    AcquireTimeout {
        /// Configured acquire timeout.
        timeout_ms: u64,
    },

    /// The pool was shut down.
    #[error("worker pool is shut down")]
    ShutDown,

    /// Reading or writing the worker's streams failed.
    #[error("I/O error talking to {worker_id}: {source}")]
    Io {
        /// Worker that failed.
        worker_id: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The worker did not answer within the request timeout.
    #[error("{worker_id} did not respond within {timeout_ms}ms")]
    RequestTimeout {
        /// Worker that stalled.
        worker_id: String,
        /// Configured request timeout.
        timeout_ms: u64,
    },

    /// The worker's stdout closed.
    #[error("{worker_id} closed its output stream")]
    StreamClosed {
        /// Worker that exited.
        worker_id: String,
    },

    /// The worker printed something that is not a valid response.
    #[error("malformed response from {worker_id}: {reason}")]
    Malformed {
        /// Worker that misbehaved.
        worker_id: String,
        /// What was wrong.
        reason: String,
    },

    /// The worker answered with `status: "error"`. The worker stays healthy.
    #[error("{worker_id} rejected request: {message}")]
    Rejected {
        /// Worker that rejected the request.
        worker_id: String,
        /// Worker-provided reason.
        message: String,
    },
}

impl PoolError {
    /// True for failures that leave the worker unusable.
    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::RequestTimeout { .. }
                | Self::StreamClosed { .. }
                | Self::Malformed { .. }
        )
    }

    /// True when no worker could be obtained in time.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::AcquireTimeout { .. })
    }
}
