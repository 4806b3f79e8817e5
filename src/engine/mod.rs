//! # Stage: Inference Orchestrator
//!
//! ## Responsibility
//! Drive one completion request end to end:
//! route → load model → tokenize → encode → greedy decode → detokenize.
//!
//! ```text
//! Idle → Tokenizing → Encoding → Decoding → Detokenizing → Done
//!   └──────────┴───────────┴──────────┴────────────┴──→ Failed
//! ```
//!
//! ## Guarantees
//! - Cleanup on every path: the session's attention cache is evicted by a
//!   drop guard, so success, failure and a dropped (cancelled) future all
//!   release it. Pool workers are released by their lease the same way.
//! - Deterministic decoding: greedy argmax, no sampling.
//! - Isolation: a failing session never affects other sessions.
//!
//! ## NOT Responsible For
//! - Retrying failed requests
//! - Transport framing (see `main.rs`)

pub mod prompt;

use crate::attention::AttentionCacheManager;
use crate::metrics;
use crate::model::{BackendError, HiddenState, ModelCache, ModelExecutor, TokenId};
use crate::pool::Tokenizer;
use crate::routing::{ModelRouter, ModelSelection, ModelTier, RoutingConfig};
use crate::{CompletionRequest, CompletionResponse, OrchestratorError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use prompt::{detect_language, PromptStrategy};

// ── Generation config ──────────────────────────────────────────────────

fn default_max_new_tokens() -> usize {
    50
}

fn default_start_token_id() -> TokenId {
    0
}

fn default_end_token_id() -> TokenId {
    1
}

/// Decode loop settings (`[generation]` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GenerationConfig {
    /// Upper bound on generated tokens per request.
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Token fed to the first decode step.
    #[serde(default = "default_start_token_id")]
    pub start_token_id: TokenId,

    /// Token that ends generation.
    #[serde(default = "default_end_token_id")]
    pub end_token_id: TokenId,

    /// Strategy used when the request names none.
    #[serde(default)]
    pub default_strategy: PromptStrategy,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            start_token_id: default_start_token_id(),
            end_token_id: default_end_token_id(),
            default_strategy: PromptStrategy::default(),
        }
    }
}

// ── State machine ──────────────────────────────────────────────────────

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeState {
    /// Not started; routing and model loading happen here.
    Idle,
    /// Converting the prompt to token ids.
    Tokenizing,
    /// Running the encoder pass.
    Encoding,
    /// Running the autoregressive loop.
    Decoding,
    /// Converting generated ids to text.
    Detokenizing,
    /// Finished successfully.
    Done,
    /// Terminal failure.
    Failed,
}

impl DecodeState {
    /// Stage label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Tokenizing => "tokenizing",
            Self::Encoding => "encoding",
            Self::Decoding => "decoding",
            Self::Detokenizing => "detokenizing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DecodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finished generation.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Session used for the attention cache.
    pub session_id: String,
    /// Detokenized output.
    pub text: String,
    /// Generated ids, end-of-sequence excluded.
    pub tokens: Vec<TokenId>,
    /// Router decision.
    pub selection: ModelSelection,
    /// Prompt length in tokens.
    pub prompt_tokens: usize,
    /// End-to-end duration.
    pub latency: Duration,
}

/// Evicts the session's attention cache when dropped.
struct SessionGuard<'a> {
    attention: &'a AttentionCacheManager,
    session_id: String,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.attention.evict(&self.session_id);
    }
}

/// Tracks the current state and tags errors with it.
struct StateTracker {
    state: DecodeState,
    entered: Instant,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            entered: Instant::now(),
        }
    }

    fn enter(&mut self, next: DecodeState, session_id: &str) {
        metrics::record_stage_latency(self.state.as_str(), self.entered.elapsed());
        debug!(session = %session_id, from = %self.state, to = %next, "state transition");
        self.state = next;
        self.entered = Instant::now();
    }

    fn fail<E: Into<OrchestratorError>>(&self, err: E) -> OrchestratorError {
        OrchestratorError::Failed {
            state: self.state,
            source: Box::new(err.into()),
        }
    }
}

/// Index of the largest logit; ties resolve to the lowest index.
pub fn argmax(logits: &[f32]) -> Option<TokenId> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in logits.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.and_then(|(i, _)| TokenId::try_from(i).ok())
}

// ── Orchestrator ───────────────────────────────────────────────────────

/// Ties router, model cache, tokenizer pool and attention cache together.
///
/// Cheap to share behind an `Arc`; every request owns its own session.
///
/// # Panics
///
/// No methods on this type panic.
pub struct Orchestrator {
    router: ModelRouter,
    cache: Arc<ModelCache>,
    attention: Arc<AttentionCacheManager>,
    tokenizer: Arc<dyn Tokenizer>,
    generation: GenerationConfig,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("router", &self.router)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Orchestrator {
    /// Assemble an orchestrator from already-built services.
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        cache: Arc<ModelCache>,
        attention: Arc<AttentionCacheManager>,
        routing: RoutingConfig,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            router: ModelRouter::new(routing, Arc::clone(&cache)),
            cache,
            attention,
            tokenizer,
            generation,
        }
    }

    /// The router.
    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// The model cache.
    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    /// The attention cache manager.
    pub fn attention(&self) -> &Arc<AttentionCacheManager> {
        &self.attention
    }

    /// Decode loop settings.
    pub fn generation(&self) -> &GenerationConfig {
        &self.generation
    }

    /// Serve one transport request. Never fails: errors become
    /// [`CompletionResponse::Error`] with a latency figure.
    pub async fn complete(&self, request: CompletionRequest) -> CompletionResponse {
        let start = Instant::now();
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match self.generate(&request).await {
            Ok(done) => {
                metrics::inc_request("completion");
                info!(
                    request_id = %id,
                    model = %done.selection.tier,
                    tokens = done.tokens.len(),
                    latency_ms = done.latency.as_millis() as u64,
                    "completion served"
                );
                CompletionResponse::Completion {
                    id,
                    text: done.text,
                    latency_ms: elapsed_ms(start),
                    tokens_generated: done.tokens.len(),
                    model: done.selection.tier.id().to_string(),
                    justification: done.selection.justification,
                }
            }
            Err(e) => {
                let kind = e.kind();
                metrics::inc_request("error");
                metrics::inc_error(kind.as_str());
                warn!(request_id = %id, kind = kind.as_str(), error = %e, "completion failed");
                CompletionResponse::Error {
                    id,
                    message: e.to_string(),
                    kind,
                    latency_ms: elapsed_ms(start),
                }
            }
        }
    }

    /// Run the full pipeline for `request`.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::InvalidRequest`] for empty code
    /// - [`OrchestratorError::Failed`] wrapping the cause and the state it
    ///   happened in
    pub async fn generate(
        &self,
        request: &CompletionRequest,
    ) -> Result<Completion, OrchestratorError> {
        let start = Instant::now();
        if request.code.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "code input is empty".into(),
            ));
        }

        let session_id = Uuid::new_v4().to_string();
        let mut tracker = StateTracker::new();

        let selection = self.router.select_model(&request.code);
        if let Some(requested) = request.model_name.as_deref() {
            if ModelTier::from_id(requested) != Some(selection.tier) {
                debug!(
                    session = %session_id,
                    requested,
                    selected = %selection.tier,
                    "advisory model name overridden by router"
                );
            }
        }
        info!(
            session = %session_id,
            tier = %selection.tier,
            score = selection.score.total,
            justification = %selection.justification,
            "model routed"
        );

        let model = self
            .cache
            .get_or_load(selection.tier)
            .map_err(|e| tracker.fail(e))?;
        let executor = model.executor();
        let num_layers = executor.num_layers();

        self.attention
            .create_cache(&session_id, num_layers, self.generation.max_new_tokens)
            .map_err(|e| tracker.fail(e))?;
        let _guard = SessionGuard {
            attention: &self.attention,
            session_id: session_id.clone(),
        };

        let result = self
            .run_session(&session_id, request, executor, &mut tracker)
            .await;

        match result {
            Ok((tokens, text, prompt_tokens)) => {
                tracker.enter(DecodeState::Done, &session_id);
                metrics::add_generated_tokens(tokens.len());
                Ok(Completion {
                    session_id,
                    text,
                    tokens,
                    selection,
                    prompt_tokens,
                    latency: start.elapsed(),
                })
            }
            Err(e) => {
                warn!(session = %session_id, state = %tracker.state, error = %e, "session failed");
                tracker.enter(DecodeState::Failed, &session_id);
                Err(e)
            }
        }
    }

    async fn run_session(
        &self,
        session_id: &str,
        request: &CompletionRequest,
        executor: &dyn ModelExecutor,
        tracker: &mut StateTracker,
    ) -> Result<(Vec<TokenId>, String, usize), OrchestratorError> {
        let strategy = request
            .prompt_strategy
            .as_deref()
            .map_or(self.generation.default_strategy, PromptStrategy::from_tag);
        let prompt = strategy.apply(&request.code, request.language.as_deref());

        tracker.enter(DecodeState::Tokenizing, session_id);
        let input = self
            .tokenizer
            .tokenize(&prompt)
            .await
            .map_err(|e| tracker.fail(e))?;
        if input.is_empty() {
            return Err(tracker.fail(BackendError::InvalidInput(
                "tokenizer returned no tokens".into(),
            )));
        }

        tracker.enter(DecodeState::Encoding, session_id);
        let hidden = executor.encode(&input).map_err(|e| tracker.fail(e))?;

        tracker.enter(DecodeState::Decoding, session_id);
        let generated = self
            .decode_loop(session_id, executor, &hidden)
            .map_err(|e| tracker.fail(e))?;

        tracker.enter(DecodeState::Detokenizing, session_id);
        let text = if generated.is_empty() {
            String::new()
        } else {
            self.tokenizer
                .detokenize(generated.clone())
                .await
                .map_err(|e| tracker.fail(e))?
        };

        Ok((generated, text, input.len()))
    }

    fn decode_loop(
        &self,
        session_id: &str,
        executor: &dyn ModelExecutor,
        hidden: &HiddenState,
    ) -> Result<Vec<TokenId>, OrchestratorError> {
        let num_layers = executor.num_layers();
        let mut generated = Vec::with_capacity(self.generation.max_new_tokens);
        let mut token = self.generation.start_token_id;

        for step in 0..self.generation.max_new_tokens {
            let output = self
                .attention
                .with_session(session_id, |past| executor.decode_step(token, hidden, past))??;

            if output.present.len() != num_layers {
                return Err(BackendError::Execution(format!(
                    "decode step returned {} layers, model has {num_layers}",
                    output.present.len()
                ))
                .into());
            }
            for (layer, kv) in output.present.into_iter().enumerate() {
                self.attention.append(session_id, layer, kv.key, kv.value)?;
            }

            let next = argmax(&output.logits).ok_or_else(|| {
                BackendError::Execution("decode step returned an empty distribution".into())
            })?;
            if next == self.generation.end_token_id {
                debug!(session = %session_id, step, "end of sequence");
                break;
            }
            generated.push(next);
            token = next;
        }

        Ok(generated)
    }

    /// Close every model and drop every attention session.
    pub fn shutdown(&self) {
        let sessions = self.attention.clear_all();
        self.cache.clear();
        info!(sessions, "orchestrator shut down");
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    // Sub-millisecond requests still report 1ms.
    (start.elapsed().as_millis() as u64).max(1)
}
