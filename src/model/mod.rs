//! # Stage: Model Management
//!
//! ## Responsibility
//! Own every loaded model. [`ModelCache`] keeps at most a few models
//! resident, admits new ones through the
//! [`ResourceAccountant`](crate::memory::ResourceAccountant) and evicts the
//! least recently used when memory runs short.
//!
//! ## Guarantees
//! - Single owner: only the cache mutates [`CachedModel`] counters or closes
//!   a model.
//! - Idempotent hits: repeated `get_or_load` for a resident tier returns the
//!   same `Arc` and bumps the hit counter once per call.
//! - Bounded: O(1) hit, miss and evict.
//!
//! ## NOT Responsible For
//! - Choosing a tier (that belongs to `routing`)
//! - Tensor math (behind the [`ModelExecutor`] seam)

pub mod backend;
pub mod cache;

pub use backend::{
    BackendError, EchoModel, EchoModelLoader, HiddenState, LayerKv, ModelExecutor, ModelLoader,
    StepOutput, TensorBlob, TokenId,
};
pub use cache::{CacheStats, CachedModel, ModelCache, ModelCacheError, DEFAULT_CACHE_CAPACITY};
