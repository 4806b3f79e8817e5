//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`EngineConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::EngineConfig;
use crate::routing;

/// Largest accepted worker pool.
pub const MAX_POOL_SIZE: usize = 32;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "pool.pool_size").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on an [`EngineConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &EngineConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Worker pool ──────────────────────────────────────────────────
    let pool = &config.pool;
    if pool.program.trim().is_empty() {
        errors.push(invalid("pool.program", "\"\"", "must name an executable"));
    }
    if pool.pool_size == 0 || pool.pool_size > MAX_POOL_SIZE {
        errors.push(invalid(
            "pool.pool_size",
            pool.pool_size,
            "must be between 1 and 32",
        ));
    }
    for (field, value) in [
        ("pool.startup_timeout_ms", pool.startup_timeout_ms),
        ("pool.acquire_timeout_ms", pool.acquire_timeout_ms),
        ("pool.request_timeout_ms", pool.request_timeout_ms),
    ] {
        if value == 0 {
            errors.push(invalid(field, value, "must be greater than 0"));
        }
    }

    // ── Memory ───────────────────────────────────────────────────────
    if let Some(budget) = config.memory.budget_mb {
        if budget <= config.memory.safety_margin_mb {
            errors.push(invalid(
                "memory.budget_mb",
                budget,
                "must exceed memory.safety_margin_mb",
            ));
        }
    }

    // ── Routing ──────────────────────────────────────────────────────
    for message in routing::config::validate(&config.routing) {
        errors.push(ConfigError::InvalidField {
            field: "routing".into(),
            value: format!(
                "{}/{}",
                config.routing.simple_threshold, config.routing.complex_threshold
            ),
            reason: message,
        });
    }

    // ── Model cache ──────────────────────────────────────────────────
    if config.cache.capacity == 0 {
        errors.push(invalid("cache.capacity", 0, "must be at least 1"));
    }

    // ── Generation ───────────────────────────────────────────────────
    let generation = &config.generation;
    if generation.max_new_tokens == 0 {
        errors.push(invalid("generation.max_new_tokens", 0, "must be at least 1"));
    }
    if generation.start_token_id == generation.end_token_id {
        errors.push(invalid(
            "generation.end_token_id",
            generation.end_token_id,
            "must differ from start_token_id",
        ));
    }

    // ── Attention ────────────────────────────────────────────────────
    if config.attention.bytes_per_token_per_layer == 0 {
        errors.push(invalid(
            "attention.bytes_per_token_per_layer",
            0,
            "must be at least 1",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_errors(config: &EngineConfig) -> Vec<String> {
        match validate(config) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .into_iter()
                .filter_map(|e| match e {
                    ConfigError::InvalidField { field, .. } => Some(field),
                    _ => None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&EngineConfig::default()).is_ok());
    }

    #[test]
    fn test_pool_size_bounds() {
        let mut cfg = EngineConfig::default();
        cfg.pool.pool_size = 0;
        assert_eq!(field_errors(&cfg), vec!["pool.pool_size"]);
        cfg.pool.pool_size = 33;
        assert_eq!(field_errors(&cfg), vec!["pool.pool_size"]);
        cfg.pool.pool_size = 32;
        assert!(field_errors(&cfg).is_empty());
    }

    #[test]
    fn test_empty_program_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.pool.program = "  ".into();
        assert_eq!(field_errors(&cfg), vec!["pool.program"]);
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.pool.acquire_timeout_ms = 0;
        cfg.pool.request_timeout_ms = 0;
        let fields = field_errors(&cfg);
        assert!(fields.contains(&"pool.acquire_timeout_ms".to_string()));
        assert!(fields.contains(&"pool.request_timeout_ms".to_string()));
    }

    #[test]
    fn test_budget_must_exceed_margin() {
        let mut cfg = EngineConfig::default();
        cfg.memory.budget_mb = Some(256);
        assert_eq!(field_errors(&cfg), vec!["memory.budget_mb"]);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.routing.simple_threshold = 0.8;
        cfg.routing.complex_threshold = 0.2;
        assert!(field_errors(&cfg).contains(&"routing".to_string()));
    }

    #[test]
    fn test_zero_capacity_and_tokens_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.cache.capacity = 0;
        cfg.generation.max_new_tokens = 0;
        cfg.attention.bytes_per_token_per_layer = 0;
        let fields = field_errors(&cfg);
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn test_start_equal_to_end_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.generation.end_token_id = cfg.generation.start_token_id;
        assert_eq!(field_errors(&cfg), vec!["generation.end_token_id"]);
    }

    #[test]
    fn test_all_violations_collected() {
        let mut cfg = EngineConfig::default();
        cfg.pool.pool_size = 0;
        cfg.cache.capacity = 0;
        let errors = validate(&cfg).err().unwrap_or_default();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("pool.pool_size"));
    }
}
