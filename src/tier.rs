//! Balance → tier → provider allowlist resolution.
//!
//! The table is built once at startup (see [`crate::config::Config`]) and
//! shared read-only through `Arc`. Every consumer (chat gate, verify route)
//! reads the same instance.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Access level derived from token balance. Variant order is tier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Tier1,
    Tier2,
    Tier3,
    Whale,
}

impl Tier {
    pub const ALL: [Tier; 5] = [Tier::Free, Tier::Tier1, Tier::Tier2, Tier::Tier3, Tier::Whale];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Tier1 => "tier1",
            Self::Tier2 => "tier2",
            Self::Tier3 => "tier3",
            Self::Whale => "whale",
        }
    }

    /// TIER3 and WHALE bypass the allowlist entirely.
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::Tier3 | Self::Whale)
    }
}

impl FromStr for Tier {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| GatewayError::Config(format!("unknown tier: {s}")))
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the tier table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TierRule {
    pub threshold: f64,
    /// Provider name patterns. Empty means every provider is permitted.
    #[serde(default)]
    pub providers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TierTable {
    rules: HashMap<Tier, TierRule>,
}

impl Default for TierTable {
    fn default() -> Self {
        let rule = |threshold: f64, providers: &[&str]| TierRule {
            threshold,
            providers: providers.iter().map(|p| p.to_string()).collect(),
        };
        let rules = HashMap::from([
            (Tier::Free, rule(0.0, &["Google"])),
            (Tier::Tier1, rule(100_000.0, &["Google", "Deepseek"])),
            (Tier::Tier2, rule(350_000.0, &["Google", "Deepseek", "Anthropic"])),
            (Tier::Tier3, rule(1_000_000.0, &[])),
            (Tier::Whale, rule(10_000_000.0, &[])),
        ]);
        Self { rules }
    }
}

impl TierTable {
    /// Build a table from config overrides layered on the defaults.
    /// Rejects tables whose thresholds are not strictly increasing in tier order.
    pub fn with_overrides(overrides: HashMap<Tier, TierRule>) -> Result<Self, GatewayError> {
        let mut table = Self::default();
        table.rules.extend(overrides);
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.threshold(Tier::Free) != 0.0 {
            return Err(GatewayError::Config(
                "free tier threshold must be 0".to_string(),
            ));
        }
        for pair in Tier::ALL.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if self.threshold(lo).partial_cmp(&self.threshold(hi)) != Some(Ordering::Less) {
                return Err(GatewayError::Config(format!(
                    "tier thresholds must be strictly increasing: {lo} ({}) >= {hi} ({})",
                    self.threshold(lo),
                    self.threshold(hi)
                )));
            }
        }
        Ok(())
    }

    pub fn threshold(&self, tier: Tier) -> f64 {
        self.rules.get(&tier).map_or(0.0, |r| r.threshold)
    }

    /// Highest tier whose threshold the balance meets or exceeds.
    /// Negative and NaN balances resolve to FREE.
    pub fn resolve_tier(&self, balance: f64) -> Tier {
        Tier::ALL
            .iter()
            .rev()
            .copied()
            .find(|tier| balance >= self.threshold(*tier))
            .unwrap_or(Tier::Free)
    }

    /// Provider patterns for a tier. An empty slice is the "all allowed"
    /// sentinel; callers check `is_empty()` explicitly.
    pub fn allowed_providers(&self, tier: Tier) -> &[String] {
        self.rules
            .get(&tier)
            .map(|r| r.providers.as_slice())
            .unwrap_or_default()
    }
}
