//! # Stage: Engine Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that sizes the engine: worker pool,
//! memory accounting, routing thresholds, model cache, decode loop and
//! logging. Every section and every field is optional.
//! ```text
//! completion-orchestrator --config engine.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `EngineConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the long-lived services (see `main.rs`)
//! - Hot reload; the engine reads its config once at startup

pub mod loader;
pub mod validation;

use crate::attention::{AttentionCacheManager, DEFAULT_BYTES_PER_TOKEN_PER_LAYER};
use crate::engine::GenerationConfig;
use crate::memory::{ResourceAccountant, SystemMemoryProbe, MIB};
use crate::model::DEFAULT_CACHE_CAPACITY;
use crate::pool::PoolConfig;
use crate::routing::RoutingConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

/// Default headroom kept free below every admission: 512 MiB.
fn default_safety_margin_mb() -> u64 {
    512
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_bytes_per_token_per_layer() -> usize {
    DEFAULT_BYTES_PER_TOKEN_PER_LAYER
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an engine instance.
///
/// # Example
///
/// ```toml
/// [pool]
/// program = "byte_tokenizer"
/// pool_size = 3
///
/// [memory]
/// safety_margin_mb = 512
/// budget_mb = 1536
///
/// [routing]
/// simple_threshold = 0.3
/// complex_threshold = 0.7
///
/// [generation]
/// max_new_tokens = 50
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EngineConfig {
    /// Tokenizer worker pool.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Memory accounting.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Complexity thresholds.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Model cache sizing.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Decode loop settings.
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Attention cache accounting.
    #[serde(default)]
    pub attention: AttentionConfig,
    /// Logging.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl EngineConfig {
    /// Accountant over the host's memory, capped to `memory.budget_mb`
    /// when set.
    pub fn accountant(&self) -> ResourceAccountant {
        let probe = match self.memory.budget_mb {
            Some(mb) => SystemMemoryProbe::with_budget(mb.saturating_mul(MIB)),
            None => SystemMemoryProbe::new(),
        };
        ResourceAccountant::with_safety_margin(Arc::new(probe), self.memory.safety_margin_bytes())
    }

    /// Empty attention cache manager sized by `attention`.
    pub fn attention_manager(&self) -> AttentionCacheManager {
        AttentionCacheManager::new(self.attention.bytes_per_token_per_layer)
    }
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Memory accounting (`[memory]`).
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Headroom that must remain free after loading a model.
    #[serde(default = "default_safety_margin_mb")]
    pub safety_margin_mb: u64,
    /// Memory cap for this process, e.g. the device's app limit. Free
    /// memory is reported as this minus the process's resident set.
    /// `None` uses the whole machine.
    #[serde(default)]
    pub budget_mb: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            safety_margin_mb: default_safety_margin_mb(),
            budget_mb: None,
        }
    }
}

impl MemoryConfig {
    /// Safety margin in bytes.
    pub fn safety_margin_bytes(&self) -> u64 {
        self.safety_margin_mb.saturating_mul(MIB)
    }
}

/// Model cache sizing (`[cache]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum resident models.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

/// Attention cache accounting (`[attention]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct AttentionConfig {
    /// Bytes charged per cached token per layer in memory reports.
    #[serde(default = "default_bytes_per_token_per_layer")]
    pub bytes_per_token_per_layer: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            bytes_per_token_per_layer: default_bytes_per_token_per_layer(),
        }
    }
}

// ── Observability ────────────────────────────────────────────────────────

/// Observability configuration (`[observability]`).
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format. `LOG_FORMAT` in the environment wins over this.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

impl LogFormat {
    /// Name accepted by [`crate::init_tracing_with`].
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

/// Export the JSON Schema for `EngineConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(EngineConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_safety_margin_is_512_mb() {
        assert_eq!(default_safety_margin_mb(), 512);
        assert_eq!(MemoryConfig::default().safety_margin_bytes(), 512 * MIB);
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let cfg: EngineConfig = toml::from_str("").unwrap_or_else(|_| EngineConfig {
            cache: CacheConfig { capacity: 0 },
            ..EngineConfig::default()
        });
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.pool.pool_size, 3);
        assert_eq!(cfg.cache.capacity, 3);
        assert_eq!(cfg.generation.max_new_tokens, 50);
        assert_eq!(cfg.observability.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let cfg: EngineConfig = toml::from_str(
            "[memory]\nbudget_mb = 1536\n\n[generation]\nmax_new_tokens = 16\ndefault_strategy = \"few_shot\"",
        )
        .unwrap_or_default();
        assert_eq!(cfg.memory.budget_mb, Some(1536));
        assert_eq!(cfg.memory.safety_margin_mb, 512);
        assert_eq!(cfg.generation.max_new_tokens, 16);
        assert_eq!(
            cfg.generation.default_strategy,
            crate::engine::PromptStrategy::FewShot
        );
        assert_eq!(cfg.routing, RoutingConfig::default());
    }

    #[test]
    fn test_log_format_round_trip() {
        let cfg: ObservabilityConfig = toml::from_str("log_format = \"json\"").unwrap_or_default();
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log_format.as_str(), "json");
    }

    #[test]
    fn test_accountant_uses_configured_margin() {
        let cfg = EngineConfig {
            memory: MemoryConfig {
                safety_margin_mb: 64,
                budget_mb: Some(256),
            },
            ..EngineConfig::default()
        };
        let accountant = cfg.accountant();
        assert_eq!(accountant.safety_margin(), 64 * MIB);
        assert!(accountant.free_memory() <= 256 * MIB);
    }

    #[test]
    fn test_export_schema_names_sections() {
        let schema = export_schema().unwrap_or_default();
        assert!(schema.contains("EngineConfig"));
        assert!(schema.contains("max_new_tokens"));
        assert!(schema.contains("pool_size"));
    }
}
