//! # tokio-completion-orchestrator
//!
//! Serving core of an on-device code-completion engine over Tokio.
//!
//! ## Architecture
//!
//! One request flows through the [`engine::Orchestrator`]:
//! ```text
//! CompletionRequest
//!   → Router (ComplexityAnalyzer + ResourceAccountant) → ModelTier
//!   → ModelCache.get_or_load
//!   → WorkerPool: TOKENIZE
//!   → encode → greedy decode loop (SessionAttentionCache) → WorkerPool: DETOKENIZE
//!   → CompletionResponse
//! ```
//!
//! Long-lived services (worker pool, model cache, attention cache) are built
//! once and injected; nothing lives in ambient statics except metrics.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod attention;
pub mod config;
pub mod engine;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod routing;

// Re-exports for convenience
pub use attention::{AttentionCacheError, AttentionCacheManager};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Completion, DecodeState, Orchestrator, PromptStrategy};
pub use memory::ResourceAccountant;
pub use model::{BackendError, ModelCache, ModelCacheError};
pub use pool::{PoolError, Tokenizer, WorkerPool};
pub use routing::{ComplexityAnalyzer, ModelRouter, ModelTier};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use tokio_completion_orchestrator::{init_tracing, OrchestratorError};
/// # fn example() -> Result<(), OrchestratorError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    init_tracing_with(&format)
}

/// Like [`init_tracing`] but with an explicit format (`json` or `pretty`).
///
/// Logs go to stderr so stdout stays free for the response stream.
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if a subscriber is already set.
pub fn init_tracing_with(format: &str) -> Result<(), OrchestratorError> {
    let result = match format {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Error taxonomy used for responses and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A model could not be admitted into memory.
    Admission,
    /// A tokenizer worker failed (I/O, timeout, malformed output).
    Worker,
    /// No tokenizer worker became available in time.
    PoolExhausted,
    /// Attention cache contract violation inside the decode loop.
    DecodeFatal,
    /// The model backend failed.
    Backend,
    /// The request itself was unusable.
    InvalidRequest,
    /// Configuration could not be loaded.
    Config,
    /// Anything else.
    Other,
}

impl ErrorKind {
    /// Stable label for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admission => "admission",
            Self::Worker => "worker",
            Self::PoolExhausted => "pool_exhausted",
            Self::DecodeFatal => "decode_fatal",
            Self::Backend => "backend",
            Self::InvalidRequest => "invalid_request",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Top-level orchestrator errors.
///
/// Every error surface in the engine is mapped to a variant here.
/// All variants implement `std::error::Error` via [`thiserror`].
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Model cache refused or failed to load a model.
    #[error(transparent)]
    ModelCache(#[from] ModelCacheError),

    /// Tokenizer pool failure.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Attention cache contract violation.
    #[error(transparent)]
    Attention(#[from] AttentionCacheError),

    /// Model execution failure.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The request was rejected before any work started.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A request failed in a specific decode state.
    #[error("failed while {state}: {source}")]
    Failed {
        /// State the request was in when it failed.
        state: DecodeState,
        /// Underlying error.
        #[source]
        source: Box<OrchestratorError>,
    },

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Classify into the [`ErrorKind`] taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelCache(ModelCacheError::OutOfMemory { .. }) => ErrorKind::Admission,
            Self::ModelCache(ModelCacheError::Load(_)) | Self::Backend(_) => ErrorKind::Backend,
            Self::Pool(e) if e.is_exhaustion() => ErrorKind::PoolExhausted,
            Self::Pool(_) => ErrorKind::Worker,
            Self::Attention(_) => ErrorKind::DecodeFatal,
            Self::Config(_) => ErrorKind::Config,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Failed { source, .. } => source.kind(),
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// The decode state the error was raised in, if recorded.
    pub fn state(&self) -> Option<DecodeState> {
        match self {
            Self::Failed { state, .. } => Some(*state),
            _ => None,
        }
    }
}

/// One completion request as received from the transport.
///
/// Field names follow the transport's camelCase; snake_case is accepted too.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    /// Caller correlation id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Code snippet to complete.
    pub code: String,

    /// Advisory language name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Prompt strategy tag (see [`PromptStrategy`]).
    #[serde(default, alias = "prompt_strategy", skip_serializing_if = "Option::is_none")]
    pub prompt_strategy: Option<String>,

    /// Advisory model name; the router has the final say.
    #[serde(default, alias = "model_name", skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

impl CompletionRequest {
    /// Request for `code` with every optional field unset.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }
}

/// One response line for the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionResponse {
    /// Successful completion.
    #[serde(rename_all = "camelCase")]
    Completion {
        /// Request id.
        id: String,
        /// Generated text.
        text: String,
        /// End-to-end latency.
        latency_ms: u64,
        /// Tokens produced by the decode loop.
        tokens_generated: usize,
        /// Stable id of the tier that served the request.
        model: String,
        /// Router explanation.
        justification: String,
    },
    /// Failed request.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Request id.
        id: String,
        /// Short human-readable reason.
        message: String,
        /// Taxonomy kind.
        kind: ErrorKind,
        /// Time spent before failing.
        latency_ms: u64,
    },
}

impl CompletionResponse {
    /// Whether this is a successful completion.
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::Completion { .. })
    }

    /// Latency figure of either variant.
    pub fn latency_ms(&self) -> u64 {
        match self {
            Self::Completion { latency_ms, .. } | Self::Error { latency_ms, .. } => *latency_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ModelTier;

    #[test]
    fn test_request_accepts_camel_and_snake_case() {
        let camel: CompletionRequest = serde_json::from_str(
            r#"{"code":"x","promptStrategy":"few_shot","modelName":"codet5p-33m"}"#,
        )
        .unwrap_or_default();
        assert_eq!(camel.prompt_strategy.as_deref(), Some("few_shot"));
        assert_eq!(camel.model_name.as_deref(), Some("codet5p-33m"));

        let snake: CompletionRequest =
            serde_json::from_str(r#"{"code":"x","prompt_strategy":"none"}"#).unwrap_or_default();
        assert_eq!(snake.prompt_strategy.as_deref(), Some("none"));
    }

    #[test]
    fn test_response_tagged_by_type() {
        let ok = CompletionResponse::Completion {
            id: "r1".into(),
            text: "fn".into(),
            latency_ms: 12,
            tokens_generated: 2,
            model: "codet5p-33m".into(),
            justification: "ideal".into(),
        };
        let value = serde_json::to_value(&ok).unwrap_or_default();
        assert_eq!(value["type"], "completion");
        assert_eq!(value["latencyMs"], 12);
        assert!(ok.is_completion());

        let err = CompletionResponse::Error {
            id: "r2".into(),
            message: "boom".into(),
            kind: ErrorKind::Worker,
            latency_ms: 3,
        };
        let value = serde_json::to_value(&err).unwrap_or_default();
        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "worker");
        assert_eq!(err.latency_ms(), 3);
    }

    #[test]
    fn test_error_kind_classification() {
        let oom = OrchestratorError::ModelCache(ModelCacheError::OutOfMemory {
            tier: ModelTier::Large,
            required_mb: 3072,
            free_mb: 100,
        });
        assert_eq!(oom.kind(), ErrorKind::Admission);

        let exhausted = OrchestratorError::Pool(PoolError::AcquireTimeout { timeout_ms: 5 });
        assert_eq!(exhausted.kind(), ErrorKind::PoolExhausted);

        let closed = OrchestratorError::Pool(PoolError::StreamClosed {
            worker_id: "worker-1".into(),
        });
        assert_eq!(closed.kind(), ErrorKind::Worker);

        let fatal = OrchestratorError::Attention(AttentionCacheError::UnknownSession("s".into()));
        assert_eq!(fatal.kind(), ErrorKind::DecodeFatal);
    }

    #[test]
    fn test_failed_wrapper_keeps_kind_and_state() {
        let err = OrchestratorError::Failed {
            state: DecodeState::Tokenizing,
            source: Box::new(OrchestratorError::Pool(PoolError::AcquireTimeout {
                timeout_ms: 5,
            })),
        };
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        assert_eq!(err.state(), Some(DecodeState::Tokenizing));
        assert!(err.to_string().starts_with("failed while tokenizing"));
    }

    #[test]
    fn test_error_kind_labels_unique() {
        let kinds = [
            ErrorKind::Admission,
            ErrorKind::Worker,
            ErrorKind::PoolExhausted,
            ErrorKind::DecodeFatal,
            ErrorKind::Backend,
            ErrorKind::InvalidRequest,
            ErrorKind::Config,
            ErrorKind::Other,
        ];
        let labels: std::collections::HashSet<_> = kinds.iter().map(|k| k.as_str()).collect();
        assert_eq!(labels.len(), kinds.len());
    }
}
