//! # Stage: Model Routing
//!
//! ## Responsibility
//! Score a code snippet's complexity and pick the model tier that should
//! complete it. Simple snippets go to the small model, deeply nested or
//! pattern-heavy code to the large one. When memory cannot admit the ideal
//! tier the router steps down one tier at a time.
//!
//! ## Guarantees
//! - Deterministic: the same snippet always produces the same score and,
//!   for the same memory state, the same tier.
//! - No unnecessary fallback: if the ideal tier is admittable it is chosen.
//! - Never fails: when nothing fits, the smallest tier is returned after a
//!   reclaim hint.
//! - Non-blocking: routing is a regex scan plus one memory probe.
//!
//! ## NOT Responsible For
//! - Loading models (that belongs to `model::cache`)
//! - Semantic understanding of the code (heuristic-only)

pub mod analyzer;
pub mod config;
pub mod router;
pub mod tier;

pub use analyzer::{ComplexityAnalyzer, ComplexityScore};
pub use config::RoutingConfig;
pub use router::{ModelRouter, ModelSelection};
pub use tier::ModelTier;
