use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ReconError;
use crate::model::CardMarker;

pub const DEFAULT_FEE_MARKER: &str = "國外交易服務費";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconConfig {
    #[serde(default)]
    pub tolerance: ToleranceConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    /// Card-segment markers, checked in order against each raw row.
    #[serde(default)]
    pub cards: Vec<CardMarker>,
}

// ---------------------------------------------------------------------------
// Tolerance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceConfig {
    /// Largest accepted |group_sum - line_amount|, in minor units.
    #[serde(default = "default_amount_minor")]
    pub amount_minor: i64,
    /// Half-width of the closed window around a line's anchor date.
    #[serde(default = "default_date_window_days")]
    pub date_window_days: u32,
}

fn default_amount_minor() -> i64 {
    1
}

fn default_date_window_days() -> u32 {
    2
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            amount_minor: default_amount_minor(),
            date_window_days: default_date_window_days(),
        }
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Alternatives retained on a proposed outcome.
    #[serde(default = "default_max_alternatives")]
    pub max_alternatives: usize,
}

fn default_max_alternatives() -> usize {
    3
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_alternatives: default_max_alternatives(),
        }
    }
}

// ---------------------------------------------------------------------------
// Fees
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Description prefix identifying a foreign-transaction fee line.
    #[serde(default = "default_marker")]
    pub marker: String,
    /// Separators between the marker and the reference amount.
    #[serde(default = "default_separators")]
    pub separators: Vec<String>,
    /// Relative deviation above which a rate advisory is emitted.
    #[serde(default = "default_rate_deviation")]
    pub rate_deviation: f64,
}

fn default_marker() -> String {
    DEFAULT_FEE_MARKER.to_string()
}

fn default_separators() -> Vec<String> {
    ["—", "－", "-", ":", "："].iter().map(|s| s.to_string()).collect()
}

fn default_rate_deviation() -> f64 {
    0.01
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            marker: default_marker(),
            separators: default_separators(),
            rate_deviation: default_rate_deviation(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl ReconConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let config: ReconConfig =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if self.tolerance.amount_minor < 0 {
            return Err(ReconError::ConfigValidation(format!(
                "tolerance.amount_minor must be >= 0, got {}",
                self.tolerance.amount_minor
            )));
        }

        // A proposed outcome must be able to show at least two alternatives
        if self.matching.max_alternatives < 2 {
            return Err(ReconError::ConfigValidation(format!(
                "matching.max_alternatives must be >= 2, got {}",
                self.matching.max_alternatives
            )));
        }

        if self.fees.marker.trim().is_empty() {
            return Err(ReconError::ConfigValidation("fees.marker must not be empty".into()));
        }
        if self.fees.separators.is_empty() || self.fees.separators.iter().any(|s| s.is_empty()) {
            return Err(ReconError::ConfigValidation(
                "fees.separators must be a non-empty list of non-empty strings".into(),
            ));
        }
        let dev = self.fees.rate_deviation;
        if !dev.is_finite() || dev <= 0.0 {
            return Err(ReconError::ConfigValidation(format!(
                "fees.rate_deviation must be a positive number, got {dev}"
            )));
        }

        let mut seen = HashSet::new();
        for marker in &self.cards {
            if marker.pattern.trim().is_empty() {
                return Err(ReconError::ConfigValidation("card marker pattern must not be empty".into()));
            }
            if marker.card_label.trim().is_empty() {
                return Err(ReconError::ConfigValidation(format!(
                    "card marker '{}': card_label must not be empty",
                    marker.pattern
                )));
            }
            if !seen.insert(marker.pattern.as_str()) {
                return Err(ReconError::ConfigValidation(format!(
                    "duplicate card marker pattern '{}'",
                    marker.pattern
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = ReconConfig::from_toml("").unwrap();
        assert_eq!(config.tolerance.amount_minor, 1);
        assert_eq!(config.tolerance.date_window_days, 2);
        assert_eq!(config.matching.max_alternatives, 3);
        assert_eq!(config.fees.marker, DEFAULT_FEE_MARKER);
        assert!(config.cards.is_empty());
    }

    #[test]
    fn parses_card_markers() {
        let toml = r#"
[tolerance]
date_window_days = 3

[[cards]]
pattern = "卡號 1234"
card_label = "taishin-gogo"

[[cards]]
pattern = "卡號 5678"
card_label = "taishin-richart"
"#;
        let config = ReconConfig::from_toml(toml).unwrap();
        assert_eq!(config.tolerance.date_window_days, 3);
        assert_eq!(config.tolerance.amount_minor, 1);
        assert_eq!(config.cards.len(), 2);
        assert_eq!(config.cards[1].card_label, "taishin-richart");
    }

    #[test]
    fn rejects_single_alternative() {
        let err = ReconConfig::from_toml("[matching]\nmax_alternatives = 1\n").unwrap_err();
        assert!(matches!(err, ReconError::ConfigValidation(_)));
    }

    #[test]
    fn rejects_duplicate_marker() {
        let toml = r#"
[[cards]]
pattern = "A"
card_label = "x"
[[cards]]
pattern = "A"
card_label = "y"
"#;
        let err = ReconConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("duplicate card marker"));
    }

    #[test]
    fn rejects_bad_toml() {
        let err = ReconConfig::from_toml("tolerance = [").unwrap_err();
        assert!(matches!(err, ReconError::ConfigParse(_)));
    }
}
