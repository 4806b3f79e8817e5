//! Integration tests for the tokenizer worker pool against the real
//! `byte_tokenizer` subprocess.
//!
//! Covers:
//! - Tokenize/detokenize round trips and ping
//! - Startup failure and startup timeout
//! - Crash and hang recovery (worker marked unhealthy, respawned)
//! - Cancelled requests never hand a stale reply to the next caller
//! - Exhaustion under concurrent leases
//! - Idempotent shutdown

use std::time::Duration;

use tokio_completion_orchestrator::pool::{PoolConfig, PoolError, WorkerPool};

// ============================================================================
// Helpers
// ============================================================================

fn tokenizer_config(pool_size: usize, args: &[&str]) -> PoolConfig {
    let mut config = PoolConfig::new(env!("CARGO_BIN_EXE_byte_tokenizer"), pool_size);
    config.args = args.iter().map(|a| a.to_string()).collect();
    config.startup_timeout_ms = 10_000;
    config.acquire_timeout_ms = 2_000;
    config.request_timeout_ms = 2_000;
    config.shutdown_grace_ms = 1_000;
    config
}

async fn start(pool_size: usize, args: &[&str]) -> WorkerPool {
    WorkerPool::initialize(tokenizer_config(pool_size, args))
        .await
        .expect("pool must start")
}

/// Poll until a replacement worker has joined the pool.
async fn wait_for_restart(pool: &WorkerPool, restarts: u64) {
    for _ in 0..100 {
        if pool.stats().restarts >= restarts && pool.stats().available == pool.stats().live {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("worker was not respawned: {:?}", pool.stats());
}

// ============================================================================
// Round trips
// ============================================================================

#[tokio::test]
async fn test_tokenize_detokenize_round_trip() {
    let pool = start(2, &[]).await;

    let tokens = pool.tokenize("fn main() {}").await.expect("tokenize");
    assert_eq!(tokens.len(), "fn main() {}".len() + 1);
    assert_eq!(tokens.last(), Some(&1));

    let text = pool.detokenize(tokens).await.expect("detokenize");
    assert_eq!(text, "fn main() {}");

    pool.shutdown().await;
}

#[tokio::test]
async fn test_ping_reports_latency() {
    let pool = start(1, &[]).await;
    let latency = pool.ping().await.expect("ping");
    assert!(latency < Duration::from_secs(2));
    pool.shutdown().await;
}

#[tokio::test]
async fn test_lease_returns_worker_on_drop() {
    let pool = start(1, &[]).await;
    {
        let mut lease = pool.acquire().await.expect("acquire");
        assert_eq!(pool.stats().available, 0);
        assert_eq!(pool.stats().busy, 1);
        lease.tokenize("x").await.expect("tokenize");
    }
    assert_eq!(pool.stats().available, 1);
    pool.shutdown().await;
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_startup_failure_is_reported() {
    let err = WorkerPool::initialize(tokenizer_config(2, &["--fail-startup"]))
        .await
        .expect_err("startup must fail");
    assert!(
        matches!(err, PoolError::StartupFailed { .. }),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_startup_timeout_is_reported() {
    let mut config = tokenizer_config(1, &["--startup-delay-ms", "2000"]);
    config.startup_timeout_ms = 100;
    let err = WorkerPool::initialize(config)
        .await
        .expect_err("startup must time out");
    assert!(matches!(err, PoolError::StartupTimeout { .. }), "{err}");
}

#[tokio::test]
async fn test_missing_program_is_spawn_error() {
    let config = PoolConfig::new("/nonexistent/byte_tokenizer", 1);
    let err = WorkerPool::initialize(config)
        .await
        .expect_err("spawn must fail");
    assert!(matches!(err, PoolError::Spawn { .. }), "{err}");
}

// ============================================================================
// Failure recovery
// ============================================================================

#[tokio::test]
async fn test_crashed_worker_is_respawned() {
    let pool = start(1, &["--crash-on", "CRASH"]).await;

    let err = pool.tokenize("please CRASH now").await.expect_err("worker crashes");
    assert!(err.is_worker_failure(), "{err}");

    wait_for_restart(&pool, 1).await;
    let tokens = pool.tokenize("ok").await.expect("replacement serves");
    assert_eq!(tokens.len(), 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_hung_worker_times_out_and_is_replaced() {
    let mut config = tokenizer_config(1, &["--hang-on", "HANG"]);
    config.request_timeout_ms = 200;
    let pool = WorkerPool::initialize(config).await.expect("pool must start");

    let err = pool.tokenize("HANG").await.expect_err("request must time out");
    assert!(matches!(err, PoolError::RequestTimeout { .. }), "{err}");

    wait_for_restart(&pool, 1).await;
    assert!(pool.tokenize("fine").await.is_ok());

    pool.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_request_does_not_poison_next_caller() {
    let mut config = tokenizer_config(1, &["--reply-delay-ms", "300"]);
    config.acquire_timeout_ms = 5_000;
    let pool = WorkerPool::initialize(config).await.expect("pool must start");

    let cancelled = tokio::time::timeout(Duration::from_millis(50), pool.tokenize("a")).await;
    assert!(cancelled.is_err(), "first call must be cut off mid-request");

    // The abandoned worker is replaced, never handed out again.
    wait_for_restart(&pool, 1).await;
    let tokens = pool.tokenize("b").await.expect("second caller is unaffected");
    assert_eq!(tokens, vec![u32::from(b'b') + 3, 1]);
    assert_eq!(pool.stats().restarts, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_lease_dropped_after_shutdown_is_retired() {
    let pool = start(1, &[]).await;
    let lease = pool.acquire().await.expect("acquire");
    pool.shutdown().await;
    assert_eq!(pool.stats().live, 1);

    drop(lease);
    let stats = pool.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.available, 0);
}

#[tokio::test]
async fn test_rejected_request_keeps_worker_healthy() {
    let pool = start(1, &[]).await;
    let mut lease = pool.acquire().await.expect("acquire");
    let mut request = tokio_completion_orchestrator::pool::WorkerRequest::ping();
    request.command = tokio_completion_orchestrator::pool::Command::Tokenize;
    let err = lease.send(&request).await.expect_err("TOKENIZE without text");
    assert!(matches!(err, PoolError::Rejected { .. }), "{err}");
    assert!(lease.is_healthy());
    drop(lease);
    assert_eq!(pool.stats().restarts, 0);
    pool.shutdown().await;
}

// ============================================================================
// Concurrency and shutdown
// ============================================================================

#[tokio::test]
async fn test_exhausted_pool_times_out_acquire() {
    let pool = start(2, &[]).await;
    let _a = pool.acquire().await.expect("first");
    let _b = pool.acquire().await.expect("second");

    let err = pool
        .acquire_timeout(Duration::from_millis(100))
        .await
        .expect_err("pool is exhausted");
    assert!(err.is_exhaustion());
    pool.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_share_pool() {
    let pool = start(3, &[]).await;
    let tasks: Vec<_> = (0..12)
        .map(|i| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let text = format!("snippet {i}");
                let tokens = pool.tokenize(&text).await?;
                let back = pool.detokenize(tokens).await?;
                Ok::<_, PoolError>((text, back))
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        let (sent, received) = task.expect("task").expect("round trip");
        assert_eq!(sent, received);
    }
    assert_eq!(pool.stats().available, 3);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_final() {
    let pool = start(2, &[]).await;
    pool.shutdown().await;
    pool.shutdown().await;

    let stats = pool.stats();
    assert!(stats.shut_down);
    assert_eq!(stats.live, 0);
    assert!(matches!(pool.acquire().await, Err(PoolError::ShutDown)));
}
