//! Model tier table.
//!
//! A closed set of model sizes with their stable identifiers, display names
//! and approximate resident sizes. Static configuration, never mutated.

use crate::memory::{GIB, MIB};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the fixed model capability levels.
///
/// Ordered from smallest to largest, so `Small < Medium < Large`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Fast model for short, shallow snippets.
    Small,
    /// Balanced model for moderately structured code.
    Medium,
    /// Highest quality model for deeply nested or pattern-heavy code.
    Large,
}

impl ModelTier {
    /// All tiers, smallest first.
    pub const ALL: [ModelTier; 3] = [ModelTier::Small, ModelTier::Medium, ModelTier::Large];

    /// Stable identifier used in logs, metrics and the transport.
    pub fn id(self) -> &'static str {
        match self {
            Self::Small => "codet5p-33m",
            Self::Medium => "codet5p-770m",
            Self::Large => "stablecode-3b",
        }
    }

    /// Human-readable name.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Small => "CodeT5+ 33M",
            Self::Medium => "CodeT5+ 770M",
            Self::Large => "StableCode 3B",
        }
    }

    /// Approximate resident size once loaded, in bytes.
    pub fn size_bytes(self) -> u64 {
        match self {
            Self::Small => 33 * MIB,
            Self::Medium => 770 * MIB,
            Self::Large => 3 * GIB,
        }
    }

    /// The next tier down, or `None` for [`ModelTier::Small`].
    pub fn smaller(self) -> Option<ModelTier> {
        match self {
            Self::Small => None,
            Self::Medium => Some(Self::Small),
            Self::Large => Some(Self::Medium),
        }
    }

    /// Look a tier up by its stable identifier.
    pub fn from_id(id: &str) -> Option<ModelTier> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_ordered_by_size() {
        let sizes: Vec<u64> = ModelTier::ALL.iter().map(|t| t.size_bytes()).collect();
        assert!(sizes.windows(2).all(|w| w[0] < w[1]));
        assert!(ModelTier::Small < ModelTier::Large);
    }

    #[test]
    fn test_smaller_walks_down_to_small() {
        assert_eq!(ModelTier::Large.smaller(), Some(ModelTier::Medium));
        assert_eq!(ModelTier::Medium.smaller(), Some(ModelTier::Small));
        assert_eq!(ModelTier::Small.smaller(), None);
    }

    #[test]
    fn test_from_id_round_trips_every_tier() {
        for tier in ModelTier::ALL {
            assert_eq!(ModelTier::from_id(tier.id()), Some(tier));
        }
        assert_eq!(ModelTier::from_id("gpt-4"), None);
    }

    #[test]
    fn test_display_uses_stable_id() {
        assert_eq!(ModelTier::Medium.to_string(), "codet5p-770m");
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&ModelTier::Large).unwrap_or_default();
        assert_eq!(json, "\"large\"");
    }
}
