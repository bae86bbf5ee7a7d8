//! Classification pipeline: normalization, inference and threat refinement

mod inference;
mod normalizer;
mod threat;

pub use inference::{compute_checksum, OnnxOracle};
pub use normalizer::{CategoryEncoder, FeatureNormalizer, FieldEncoding, FittedField, Standardizer};
pub use threat::{ThreatClassifier, ThreatRule, DEFAULT_RULES};

use crate::error::Result;
use crate::models::{NormalizedVector, Verdict};

/// Predictor consumed by the monitoring loop
///
/// Implementations are treated as stateless: the same vector always yields
/// the same verdict while the loaded parameters are unchanged.
pub trait ClassificationOracle: Send + Sync {
    /// Classify one normalized record; fails with `NotFitted` when no model
    /// parameters are loaded
    fn predict(&self, features: &NormalizedVector) -> Result<Verdict>;

    /// Whether trained parameters are available
    fn is_loaded(&self) -> bool {
        true
    }
}
