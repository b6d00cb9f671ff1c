use crate::error::{CorrError, Result};
use serde::{Deserialize, Serialize};

/// Chunking, retention and significance settings for one correlation job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Columns of the first matrix processed per chunk.
    pub batch_size: usize,
    /// Pairs kept per anchor by absolute correlation.
    pub limit: usize,
    /// Pairs kept per anchor among positive and, separately, negative correlations.
    pub limit_per_sign: usize,
    /// Only pairs with a q-value strictly below this are retained.
    pub max_q_value: f64,
    /// Pairs with fewer jointly valid observations are not computed.
    pub min_samples: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            limit: 100,
            limit_per_sign: 50,
            max_q_value: 0.05,
            min_samples: 10,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CorrError::InvalidThresholds(
                "batch_size must be greater than 0".into(),
            ));
        }
        if self.max_q_value.is_nan() || self.max_q_value < 0.0 {
            return Err(CorrError::InvalidThresholds(format!(
                "max_q_value must be a non-negative number, got {}",
                self.max_q_value
            )));
        }
        Ok(())
    }
}
