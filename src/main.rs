//! Completion engine host process.
//!
//! Reads one JSON [`CompletionRequest`] per stdin line and writes one JSON
//! [`CompletionResponse`] per stdout line. Requests are served concurrently,
//! so responses may come back out of order; match them by `id`.
//!
//! ```text
//! completion-orchestrator --config engine.toml < requests.jsonl
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (overrides the config file)
//! - `RUST_LOG=info` — log level filter

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_completion_orchestrator::config::{self, loader};
use tokio_completion_orchestrator::model::EchoModelLoader;
use tokio_completion_orchestrator::{
    init_tracing_with, metrics, CompletionRequest, CompletionResponse, EngineConfig, ErrorKind,
    ModelCache, Orchestrator, WorkerPool,
};
use tracing::{error, info, warn};

/// Vocabulary of the bundled byte tokenizer.
const BYTE_VOCAB_SIZE: usize = 259;

/// Parsed command-line arguments.
struct Args {
    config: Option<PathBuf>,
    tokenizer: Option<String>,
    print_schema: bool,
    print_metrics: bool,
}

/// Parse command-line arguments.
///
/// # Returns
///
/// - `Ok(Args)` on success
/// - `Err(String)` with a usage message on failure
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config: None,
        tokenizer: None,
        print_schema: false,
        print_metrics: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a value")?;
                parsed.config = Some(PathBuf::from(value));
            }
            "--tokenizer" | "-t" => {
                i += 1;
                let value = args.get(i).ok_or("--tokenizer requires a value")?;
                parsed.tokenizer = Some(value.clone());
            }
            "--schema" => parsed.print_schema = true,
            "--metrics" => parsed.print_metrics = true,
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }

    Ok(parsed)
}

fn usage() -> String {
    [
        "Usage: completion-orchestrator [OPTIONS] < requests.jsonl",
        "",
        "Options:",
        "  --config, -c <FILE>       Engine configuration (TOML)",
        "  --tokenizer, -t <PATH>    Tokenizer worker executable (overrides pool.program)",
        "  --schema                  Print the config JSON Schema and exit",
        "  --metrics                 Dump Prometheus metrics to stderr on exit",
        "  --help, -h                Show this help message",
    ]
    .join("\n")
}

/// Resolve a bare program name against the directory of this executable, so
/// the bundled `byte_tokenizer` is found without being on `PATH`.
fn resolve_program(program: &str) -> String {
    if Path::new(program).components().count() > 1 {
        return program.to_string();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(program)))
        .filter(|candidate| candidate.is_file())
        .map_or_else(|| program.to_string(), |p| p.display().to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    if args.print_schema {
        println!("{}", config::export_schema()?);
        return Ok(());
    }

    let mut cfg = match &args.config {
        Some(path) => loader::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(program) = args.tokenizer {
        cfg.pool.program = program;
    }
    cfg.pool.program = resolve_program(&cfg.pool.program);

    let format = std::env::var("LOG_FORMAT")
        .unwrap_or_else(|_| cfg.observability.log_format.as_str().to_string());
    let _ = init_tracing_with(&format);
    metrics::init_metrics()?;

    let accountant = cfg.accountant();
    info!(
        program = %cfg.pool.program,
        pool_size = cfg.pool.pool_size,
        memory = %accountant.stats().format(),
        "starting completion engine"
    );

    let pool = WorkerPool::initialize(cfg.pool.clone()).await?;
    let cache = Arc::new(ModelCache::new(
        cfg.cache.capacity,
        accountant,
        Arc::new(EchoModelLoader::new(BYTE_VOCAB_SIZE)),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(pool.clone()),
        cache,
        Arc::new(cfg.attention_manager()),
        cfg.routing,
        cfg.generation.clone(),
    ));

    let (tx, mut rx) = mpsc::channel::<CompletionResponse>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_string(&response) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "failed to encode response");
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!(error = %e, "stdout closed");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let tx = tx.clone();
        match serde_json::from_str::<CompletionRequest>(&line) {
            Ok(request) => {
                let orchestrator = Arc::clone(&orchestrator);
                in_flight.push(tokio::spawn(async move {
                    let response = orchestrator.complete(request).await;
                    let _ = tx.send(response).await;
                }));
            }
            Err(e) => {
                warn!(error = %e, "unparseable request line");
                metrics::inc_request("error");
                metrics::inc_error(ErrorKind::InvalidRequest.as_str());
                let response = CompletionResponse::Error {
                    id: String::new(),
                    message: format!("invalid request: {e}"),
                    kind: ErrorKind::InvalidRequest,
                    latency_ms: 0,
                };
                let _ = tx.send(response).await;
            }
        }
    }

    futures::future::join_all(in_flight).await;
    drop(tx);
    let _ = writer.await;

    orchestrator.shutdown();
    pool.shutdown().await;

    if args.print_metrics {
        eprintln!("{}", metrics::gather());
    }
    let summary = metrics::get_metrics_summary();
    info!(?summary, "completion engine stopped");
    Ok(())
}
