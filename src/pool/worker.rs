//! # PooledWorker — one tokenizer subprocess
//!
//! ## Responsibility
//! Start one worker process, wait for its ready line, and run
//! request/response round trips over its stdin/stdout.
//!
//! ## Guarantees
//! - Health tracking: any I/O error, timeout, premature EOF or unparsable
//!   line flips the health flag before the error is returned.
//! - In-flight tracking: a round trip abandoned between write and read
//!   (the caller's future was dropped) leaves the worker flagged, so its
//!   stale reply is never read by the next caller.
//! - No orphans: the child is spawned with `kill_on_drop`, so dropping a
//!   worker always terminates its process.
//! - Stderr is drained in the background and logged, so a chatty worker
//!   can never block on a full pipe.
//!
//! ## NOT Responsible For
//! - Replacement of unhealthy workers (see: manager.rs)

use super::protocol::{Status, WorkerRequest, WorkerResponse};
use super::{PoolConfig, PoolError};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// A live worker process plus its streams and health flag.
///
/// # Panics
///
/// No methods on this type panic.
pub struct PooledWorker {
    id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    started_at: Instant,
    healthy: bool,
    in_flight: bool,
    requests: u64,
}

impl std::fmt::Debug for PooledWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWorker")
            .field("id", &self.id)
            .field("pid", &self.child.id())
            .field("healthy", &self.healthy)
            .field("in_flight", &self.in_flight)
            .field("requests", &self.requests)
            .finish()
    }
}

impl PooledWorker {
    /// Spawn a worker and wait for its ready line.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Spawn`] if the executable cannot be started
    /// - [`PoolError::StartupFailed`] if it reports `status: "error"`
    /// - [`PoolError::StartupTimeout`] if no line arrives in time
    /// - [`PoolError::StreamClosed`] / [`PoolError::Malformed`] for a bad
    ///   startup line
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn spawn(id: String, config: &PoolConfig) -> Result<Self, PoolError> {
        let start = Instant::now();
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PoolError::Spawn {
                worker_id: id.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PoolError::Spawn {
                worker_id: id,
                source: std::io::Error::other("stdio not captured"),
            });
        };

        if let Some(stderr) = child.stderr.take() {
            let worker_id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(worker_id = %worker_id, stderr = %line, "worker stderr");
                }
            });
        }

        let mut worker = Self {
            id,
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            started_at: start,
            healthy: true,
            in_flight: false,
            requests: 0,
        };

        let timeout = config.startup_timeout();
        let ready = match tokio::time::timeout(timeout, worker.read_response()).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::StartupTimeout {
                worker_id: worker.id.clone(),
                timeout_ms: config.startup_timeout_ms,
            }),
        };

        match ready {
            Ok(resp) if resp.status == Status::Ready => {
                info!(
                    worker_id = %worker.id,
                    pid = worker.child.id(),
                    startup_ms = start.elapsed().as_millis() as u64,
                    "worker ready"
                );
                Ok(worker)
            }
            Ok(resp) if resp.status == Status::Error => {
                worker.kill();
                Err(PoolError::StartupFailed {
                    worker_id: worker.id.clone(),
                    message: resp.message.unwrap_or_else(|| "unknown error".into()),
                })
            }
            Ok(resp) => {
                worker.kill();
                Err(PoolError::Malformed {
                    worker_id: worker.id.clone(),
                    reason: format!("expected ready line, got status {:?}", resp.status),
                })
            }
            Err(e) => {
                worker.kill();
                Err(e)
            }
        }
    }

    /// Worker identifier, e.g. `worker-2`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// False once a communication failure was observed.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// True while a request was written but its reply not yet read.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Healthy and not holding an unread reply.
    pub fn is_reusable(&self) -> bool {
        self.healthy && !self.in_flight
    }

    /// Flag the worker for replacement.
    pub fn mark_unhealthy(&mut self) {
        if self.healthy {
            warn!(worker_id = %self.id, "worker marked unhealthy");
        }
        self.healthy = false;
    }

    /// Time since spawn.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Completed round trips.
    pub fn requests_served(&self) -> u64 {
        self.requests
    }

    /// OS process id, if still running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Write one request line and read one response line.
    ///
    /// # Errors
    ///
    /// Worker failures ([`PoolError::is_worker_failure`]) mark the worker
    /// unhealthy first. A `status: "error"` reply yields
    /// [`PoolError::Rejected`] and leaves the worker healthy.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn send(
        &mut self,
        request: &WorkerRequest,
        timeout: Duration,
    ) -> Result<WorkerResponse, PoolError> {
        let result = match tokio::time::timeout(timeout, self.round_trip(request)).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::RequestTimeout {
                worker_id: self.id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(resp) if resp.status == Status::Error => Err(PoolError::Rejected {
                worker_id: self.id.clone(),
                message: resp.message.unwrap_or_else(|| "unspecified".into()),
            }),
            Ok(resp) => {
                self.requests += 1;
                Ok(resp)
            }
            Err(e) => {
                if e.is_worker_failure() {
                    self.mark_unhealthy();
                }
                Err(e)
            }
        }
    }

    async fn round_trip(&mut self, request: &WorkerRequest) -> Result<WorkerResponse, PoolError> {
        let mut line = serde_json::to_string(request).map_err(|e| PoolError::Malformed {
            worker_id: self.id.clone(),
            reason: format!("request encoding failed: {e}"),
        })?;
        line.push('\n');

        self.in_flight = true;
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|source| self.io_error(source))?;
        self.stdin
            .flush()
            .await
            .map_err(|source| self.io_error(source))?;
        debug!(worker_id = %self.id, command = ?request.command, id = %request.id, "request sent");

        let resp = self.read_response().await?;
        self.in_flight = false;
        if let Some(echoed) = &resp.id {
            if echoed != &request.id {
                return Err(PoolError::Malformed {
                    worker_id: self.id.clone(),
                    reason: format!("response id {echoed} does not match {}", request.id),
                });
            }
        }
        Ok(resp)
    }

    async fn read_response(&mut self) -> Result<WorkerResponse, PoolError> {
        let line = self
            .stdout
            .next_line()
            .await
            .map_err(|source| self.io_error(source))?
            .ok_or_else(|| PoolError::StreamClosed {
                worker_id: self.id.clone(),
            })?;
        serde_json::from_str(&line).map_err(|e| PoolError::Malformed {
            worker_id: self.id.clone(),
            reason: format!("{e}: {line}"),
        })
    }

    fn io_error(&self, source: std::io::Error) -> PoolError {
        PoolError::Io {
            worker_id: self.id.clone(),
            source,
        }
    }

    /// Ask the worker to exit, then force-kill it after `grace`.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn shutdown(mut self, grace: Duration) {
        let request = WorkerRequest::shutdown();
        if let Err(e) = self.send(&request, grace).await {
            debug!(worker_id = %self.id, error = %e, "shutdown command not acknowledged");
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker_id = %self.id, %status, "worker exited");
            }
            Ok(Err(e)) => {
                warn!(worker_id = %self.id, error = %e, "waiting for worker failed, killing");
                let _ = self.child.kill().await;
            }
            Err(_) => {
                warn!(worker_id = %self.id, "worker ignored shutdown, killing");
                let _ = self.child.kill().await;
            }
        }
    }

    /// Start killing the process without waiting.
    pub fn kill(&mut self) {
        self.healthy = false;
        if let Err(e) = self.child.start_kill() {
            debug!(worker_id = %self.id, error = %e, "kill failed (already exited?)");
        }
    }
}
