//! Model routing logic.
//!
//! The [`ModelRouter`] combines a [`ComplexityAnalyzer`] with a
//! [`RoutingConfig`] and the [`ModelCache`] to decide which model tier
//! should serve each snippet, walking down the tier ladder when memory will
//! not admit the ideal choice.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::analyzer::{ComplexityAnalyzer, ComplexityScore};
use super::config::RoutingConfig;
use super::tier::ModelTier;
use crate::metrics;
use crate::model::ModelCache;

/// The routing decision for a single request.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    /// Tier that will serve the request.
    pub tier: ModelTier,
    /// Tier the score alone asked for.
    pub ideal: ModelTier,
    /// Score that drove the decision.
    pub score: ComplexityScore,
    /// Human-readable explanation.
    pub justification: String,
    /// True when even the smallest tier was refused and it was chosen anyway.
    pub degraded: bool,
}

impl ModelSelection {
    /// Whether memory pressure forced a smaller tier than the ideal one.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn is_fallback(&self) -> bool {
        self.tier != self.ideal
    }

    /// Stable identifier of the selected tier.
    pub fn model_id(&self) -> &'static str {
        self.tier.id()
    }

    /// Display name of the selected tier.
    pub fn display_name(&self) -> &'static str {
        self.tier.display_name()
    }

    /// Approximate resident size of the selected tier.
    pub fn size_bytes(&self) -> u64 {
        self.tier.size_bytes()
    }
}

/// Complexity- and memory-aware model router.
///
/// Stateless apart from the live memory figure read through the cache's
/// accountant; safe to share across sessions.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct ModelRouter {
    analyzer: ComplexityAnalyzer,
    config: RoutingConfig,
    cache: Arc<ModelCache>,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("config", &self.config)
            .finish()
    }
}

impl ModelRouter {
    /// Create a router over `cache`.
    ///
    /// # Arguments
    ///
    /// * `config` — Tier thresholds.
    /// * `cache` — Model cache; its accountant decides admission.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn new(config: RoutingConfig, cache: Arc<ModelCache>) -> Self {
        Self {
            analyzer: ComplexityAnalyzer::new(),
            config,
            cache,
        }
    }

    /// Map a score onto a tier with the configured thresholds.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn ideal_tier(&self, score: f64) -> ModelTier {
        if score < self.config.simple_threshold {
            ModelTier::Small
        } else if score < self.config.complex_threshold {
            ModelTier::Medium
        } else {
            ModelTier::Large
        }
    }

    /// Pick a tier for `code`.
    ///
    /// Walks from the ideal tier downward and returns the first tier that is
    /// either resident or admittable. If none is, asks the accountant to
    /// reclaim memory and returns [`ModelTier::Small`] in degraded mode.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn select_model(&self, code: &str) -> ModelSelection {
        let start = Instant::now();
        let score = self.analyzer.analyze(code);
        let ideal = self.ideal_tier(score.total);

        let mut candidate = Some(ideal);
        let mut chosen = None;
        while let Some(tier) = candidate {
            if self.cache.can_serve(tier) {
                chosen = Some(tier);
                break;
            }
            debug!(tier = %tier, "tier not admittable, trying smaller");
            candidate = tier.smaller();
        }

        let (tier, degraded) = match chosen {
            Some(tier) => (tier, false),
            None => {
                warn!(
                    ideal = %ideal,
                    free_mb = self.cache.accountant().free_memory() / crate::memory::MIB,
                    "no tier admittable, requesting reclaim and using smallest"
                );
                self.cache.accountant().suggest_reclaim();
                (ModelTier::Small, true)
            }
        };

        let mut justification = if tier == ideal {
            format!(
                "Complexity {:.2} → {} (ideal match)",
                score.total,
                ideal.display_name()
            )
        } else {
            format!(
                "Complexity {:.2} → {} preferred, but insufficient memory → {} fallback",
                score.total,
                ideal.display_name(),
                tier.display_name()
            )
        };
        if degraded {
            justification.push_str(" (degraded: memory reclaim requested)");
        }

        let selection = ModelSelection {
            tier,
            ideal,
            score,
            justification,
            degraded,
        };
        metrics::inc_model_selection(tier.id(), selection.is_fallback());
        debug!(
            tier = %tier,
            ideal = %ideal,
            score = score.total,
            elapsed_us = start.elapsed().as_micros() as u64,
            "model selected"
        );
        selection
    }

    /// The analyzer used for scoring.
    pub fn analyzer(&self) -> &ComplexityAnalyzer {
        &self.analyzer
    }

    /// The routing thresholds.
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
