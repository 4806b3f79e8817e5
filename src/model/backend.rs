//! Model execution handle seam.
//!
//! The numeric backend is an external collaborator. This module fixes only
//! its two call shapes:
//!
//! - `encode(tokens) -> HiddenState`
//! - `decode_step(token, hidden, past) -> StepOutput`
//!
//! Tensor payloads travel as opaque [`TensorBlob`]s; the cache and the decode
//! loop never look inside them.
//!
//! [`EchoModel`] is a deterministic in-process backend that replays the
//! encoded input one token per step. It backs the demo binary, the benches
//! and the tests.

use crate::attention::SessionCache;
use crate::routing::ModelTier;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Token identifier in a model vocabulary.
pub type TokenId = u32;

/// Errors raised by a model execution backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The model for `tier` could not be loaded.
    #[error("failed to load model {tier}: {reason}")]
    Load {
        /// Tier that failed to load.
        tier: ModelTier,
        /// Backend-specific detail.
        reason: String,
    },

    /// A forward pass failed.
    #[error("model execution failed: {0}")]
    Execution(String),

    /// Input rejected before running.
    #[error("invalid model input: {0}")]
    InvalidInput(String),
}

/// Opaque, cheaply clonable tensor payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TensorBlob(Arc<[u8]>);

impl TensorBlob {
    /// Wrap raw bytes.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-byte payload.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Encoder output consumed by every decode step of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct HiddenState {
    /// Backend-specific payload.
    pub data: TensorBlob,
    /// Number of encoded positions.
    pub seq_len: usize,
}

/// One layer's key/value pair for the newest token.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerKv {
    /// Key tensor.
    pub key: TensorBlob,
    /// Value tensor.
    pub value: TensorBlob,
}

/// Result of one decode step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Unnormalised next-token distribution over the vocabulary.
    pub logits: Vec<f32>,
    /// New key/value state, one entry per layer.
    pub present: Vec<LayerKv>,
}

/// A loaded model able to run encode and decode passes.
///
/// Calls are synchronous and CPU-bound on the calling thread.
pub trait ModelExecutor: Send + Sync {
    /// Tier this handle serves.
    fn tier(&self) -> ModelTier;

    /// Number of transformer layers in the decoder.
    fn num_layers(&self) -> usize;

    /// Run the encoder once over the whole input.
    fn encode(&self, tokens: &[TokenId]) -> Result<HiddenState, BackendError>;

    /// Compute the distribution for the token after `token`, reading prior
    /// attention state from `past`.
    fn decode_step(
        &self,
        token: TokenId,
        hidden: &HiddenState,
        past: &SessionCache,
    ) -> Result<StepOutput, BackendError>;

    /// Release backend resources. Called once, when the last cache handle to
    /// the model is dropped.
    fn unload(&self) {}
}

/// Factory for [`ModelExecutor`]s, invoked by the model cache on a miss.
pub trait ModelLoader: Send + Sync {
    /// Load the model for `tier`.
    fn load(&self, tier: ModelTier) -> Result<Arc<dyn ModelExecutor>, BackendError>;
}

// ── Deterministic echo backend ─────────────────────────────────────────

/// Default end-of-sequence id for [`EchoModel`].
pub const ECHO_EOS: TokenId = 1;

/// Deterministic backend that re-emits its encoded input.
///
/// Step `n` returns a one-hot distribution peaking at input position `n`,
/// so greedy decoding reproduces the prompt until its end-of-sequence
/// token. Past the end of the input it predicts end-of-sequence.
#[derive(Debug)]
pub struct EchoModel {
    tier: ModelTier,
    num_layers: usize,
    vocab_size: usize,
    eos: TokenId,
    unloads: Arc<AtomicUsize>,
}

impl EchoModel {
    /// Build an echo model for `tier`. Larger tiers get more layers.
    pub fn new(tier: ModelTier, vocab_size: usize) -> Self {
        let num_layers = match tier {
            ModelTier::Small => 2,
            ModelTier::Medium => 4,
            ModelTier::Large => 6,
        };
        Self {
            tier,
            num_layers,
            vocab_size,
            eos: ECHO_EOS,
            unloads: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn with_unload_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.unloads = counter;
        self
    }

    fn token_at(hidden: &HiddenState, position: usize) -> Option<TokenId> {
        let start = position.checked_mul(4)?;
        let bytes = hidden.data.as_bytes().get(start..start + 4)?;
        let mut word = [0_u8; 4];
        word.copy_from_slice(bytes);
        Some(TokenId::from_le_bytes(word))
    }
}

impl ModelExecutor for EchoModel {
    fn tier(&self) -> ModelTier {
        self.tier
    }

    fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn encode(&self, tokens: &[TokenId]) -> Result<HiddenState, BackendError> {
        if tokens.is_empty() {
            return Err(BackendError::InvalidInput("empty token sequence".into()));
        }
        let data: Vec<u8> = tokens.iter().flat_map(|t| t.to_le_bytes()).collect();
        Ok(HiddenState {
            data: TensorBlob::from_vec(data),
            seq_len: tokens.len(),
        })
    }

    fn decode_step(
        &self,
        token: TokenId,
        hidden: &HiddenState,
        past: &SessionCache,
    ) -> Result<StepOutput, BackendError> {
        if token as usize >= self.vocab_size {
            return Err(BackendError::InvalidInput(format!(
                "token {token} outside vocabulary of {}",
                self.vocab_size
            )));
        }

        let position = past.current_length();
        let next = Self::token_at(hidden, position)
            .filter(|t| (*t as usize) < self.vocab_size)
            .unwrap_or(self.eos);

        let mut logits = vec![0.0_f32; self.vocab_size];
        if let Some(slot) = logits.get_mut(next as usize) {
            *slot = 1.0;
        }

        let kv = TensorBlob::from_vec(token.to_le_bytes().to_vec());
        let present = (0..self.num_layers)
            .map(|_| LayerKv {
                key: kv.clone(),
                value: kv.clone(),
            })
            .collect();

        Ok(StepOutput { logits, present })
    }

    fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Loader producing [`EchoModel`]s, with load/unload counters for tests.
#[derive(Debug, Clone)]
pub struct EchoModelLoader {
    vocab_size: usize,
    loads: Arc<AtomicUsize>,
    unloads: Arc<AtomicUsize>,
}

impl EchoModelLoader {
    /// Loader for a vocabulary of `vocab_size` ids.
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            loads: Arc::new(AtomicUsize::new(0)),
            unloads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Models loaded so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Models unloaded so far.
    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for EchoModelLoader {
    fn load(&self, tier: ModelTier) -> Result<Arc<dyn ModelExecutor>, BackendError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(
            EchoModel::new(tier, self.vocab_size).with_unload_counter(Arc::clone(&self.unloads)),
        ))
    }
}
