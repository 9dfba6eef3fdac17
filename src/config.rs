use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables for one pipeline instance.
///
/// The defaults are empirical; none of them has a derivation and they should
/// be re-checked on new datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Combined confidence at or above this commits without escalation.
    pub escalation_threshold: f64,
    pub layout_weight: f64,
    pub text_weight: f64,
    /// Pages with fewer lines than this lose layout weight proportionally.
    pub dense_line_count: usize,
    /// Page-relative center displacement that counts as "no overlap".
    pub layout_max_distance: f64,
    /// Normalized Levenshtein similarity at which two lines count as equal.
    pub line_match_threshold: f64,
    pub order_penalty_weight: f64,
    pub min_slot_similarity: f64,
    pub continuation_confidence: f64,
    pub slot_only_weight: f64,
    /// Other candidate types at or above this confidence also route the
    /// page to their steps.
    pub secondary_step_confidence: f64,
    pub max_concurrent_documents: usize,
    pub fallback: FallbackPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: 0.4,
            layout_weight: 0.4,
            text_weight: 0.6,
            dense_line_count: 8,
            layout_max_distance: 0.25,
            line_match_threshold: 0.8,
            order_penalty_weight: 0.1,
            min_slot_similarity: 0.3,
            continuation_confidence: 0.7,
            slot_only_weight: 0.5,
            secondary_step_confidence: 0.2,
            max_concurrent_documents: 4,
            fallback: FallbackPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit_fields = [
            ("escalation_threshold", self.escalation_threshold),
            ("layout_weight", self.layout_weight),
            ("text_weight", self.text_weight),
            ("line_match_threshold", self.line_match_threshold),
            ("order_penalty_weight", self.order_penalty_weight),
            ("min_slot_similarity", self.min_slot_similarity),
            ("continuation_confidence", self.continuation_confidence),
            ("slot_only_weight", self.slot_only_weight),
            ("secondary_step_confidence", self.secondary_step_confidence),
        ];
        for (field, value) in unit_fields {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfUnitRange { field, value });
            }
        }

        let sum = self.layout_weight + self.text_weight;
        if (sum - 1.0).abs() > 1e-9 {
            return Err(ConfigError::WeightSum(sum));
        }
        if self.layout_max_distance <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "layout_max_distance",
            });
        }
        if self.dense_line_count == 0 {
            return Err(ConfigError::NotPositive {
                field: "dense_line_count",
            });
        }
        if self.max_concurrent_documents == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_concurrent_documents",
            });
        }
        self.fallback.validate()
    }
}

/// Timeout and retry policy for the external classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackPolicy {
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 20_000,
            max_retries: 3,
            initial_backoff_ms: 200,
            backoff_factor: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl FallbackPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let scaled = self.initial_backoff_ms as f64 * self.backoff_factor.powi(retry as i32);
        let capped = scaled.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::NotPositive {
                field: "fallback.timeout_ms",
            });
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigError::NotPositive {
                field: "fallback.backoff_factor",
            });
        }
        Ok(())
    }
}
