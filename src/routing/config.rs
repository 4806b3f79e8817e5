//! Routing configuration types.
//!
//! Provides [`RoutingConfig`] for tuning the two complexity thresholds that
//! map a [`super::ComplexityScore`] onto a [`super::ModelTier`]. All fields
//! have defaults and are (de)serialisable via serde for TOML/JSON config
//! files.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ────────────────────────────────────────────

/// Default score below which code routes to the Small tier.
fn default_simple_threshold() -> f64 {
    0.3
}

/// Default score at or above which code routes to the Large tier.
fn default_complex_threshold() -> f64 {
    0.7
}

// ── RoutingConfig ──────────────────────────────────────────────────────

/// Configuration for the model routing layer.
///
/// `score < simple_threshold` → Small, `score < complex_threshold` → Medium,
/// otherwise Large.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct RoutingConfig {
    /// Upper bound (exclusive) of the Small band.
    ///
    /// Range: `0.0..=1.0`.  Default: `0.3`.
    #[serde(default = "default_simple_threshold")]
    pub simple_threshold: f64,

    /// Upper bound (exclusive) of the Medium band.
    ///
    /// Range: `0.0..=1.0`, must be `>= simple_threshold`.  Default: `0.7`.
    #[serde(default = "default_complex_threshold")]
    pub complex_threshold: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            simple_threshold: default_simple_threshold(),
            complex_threshold: default_complex_threshold(),
        }
    }
}

/// Validate a [`RoutingConfig`], returning a list of human-readable errors.
///
/// # Returns
///
/// An empty `Vec` on success, or one error string per violated constraint.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &RoutingConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if !(0.0..=1.0).contains(&config.simple_threshold) {
        errors.push(format!(
            "simple_threshold must be in [0.0, 1.0], got {}",
            config.simple_threshold
        ));
    }

    if !(0.0..=1.0).contains(&config.complex_threshold) {
        errors.push(format!(
            "complex_threshold must be in [0.0, 1.0], got {}",
            config.complex_threshold
        ));
    }

    if config.complex_threshold < config.simple_threshold {
        errors.push(format!(
            "complex_threshold ({}) must be >= simple_threshold ({})",
            config.complex_threshold, config.simple_threshold
        ));
    }

    errors
}

// ── Tests ──────────────────────────────────────────────────────────────
