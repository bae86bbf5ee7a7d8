//! ONNX inference using tract
//!
//! Runs a binary intrusion classifier exported to ONNX. The model takes one
//! normalized feature row `[1, feature_count]` and returns either the two
//! class probabilities `[p_normal, p_attack]` or a single attack probability.

use super::ClassificationOracle;
use crate::error::{IdsError, Result};
use crate::models::{NormalizedVector, Verdict};
use anyhow::Context;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::RwLock;
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::{debug, info, warn};

/// Maximum inference latency before warning
const MAX_INFERENCE_MS: u128 = 5;

const COMPONENT: &str = "classification oracle";

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

struct LoadedModel {
    plan: TractModel,
    num_features: usize,
    version: String,
}

/// ONNX-based classification oracle
pub struct OnnxOracle {
    model: RwLock<Option<LoadedModel>>,
}

impl OnnxOracle {
    /// Create an oracle with no model; every prediction fails with `NotFitted`
    pub fn unloaded() -> Self {
        Self {
            model: RwLock::new(None),
        }
    }

    /// Create an oracle from model bytes
    pub fn new(model_bytes: &[u8], num_features: usize) -> anyhow::Result<Self> {
        let oracle = Self::unloaded();
        oracle.load(model_bytes, num_features, &compute_checksum(model_bytes))?;
        Ok(oracle)
    }

    /// Load a model file, verifying its SHA-256 checksum when one is given
    pub fn from_file(
        path: &Path,
        num_features: usize,
        expected_checksum: Option<&str>,
    ) -> anyhow::Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read model file {:?}", path))?;

        let checksum = compute_checksum(&bytes);
        if let Some(expected) = expected_checksum {
            if !checksum.eq_ignore_ascii_case(expected) {
                anyhow::bail!("Checksum mismatch: expected {}, got {}", expected, checksum);
            }
        }

        let oracle = Self::unloaded();
        oracle.load(&bytes, num_features, &checksum)?;
        info!(path = %path.display(), checksum = %checksum, "Classification model loaded");
        Ok(oracle)
    }

    /// Replace the current model
    pub fn load(&self, model_bytes: &[u8], num_features: usize, version: &str) -> anyhow::Result<()> {
        let plan = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(model_bytes))
            .context("Failed to parse ONNX model")?
            .with_input_fact(0, f32::fact([1, num_features]).into())
            .context("Failed to set input shape")?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()
            .context("Failed to create runnable model")?;

        let mut model = self
            .model
            .write()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        *model = Some(LoadedModel {
            plan,
            num_features,
            version: version.to_string(),
        });
        debug!(version = %version, num_features, "Model updated");
        Ok(())
    }

    /// Version label of the loaded model (its checksum prefix), if any
    pub fn model_version(&self) -> Option<String> {
        self.model
            .read()
            .ok()
            .and_then(|m| m.as_ref().map(|m| m.version.chars().take(12).collect()))
    }
}

impl ClassificationOracle for OnnxOracle {
    fn predict(&self, features: &NormalizedVector) -> Result<Verdict> {
        let start = Instant::now();

        let guard = self
            .model
            .read()
            .map_err(|e| IdsError::Inference(format!("Lock poisoned: {}", e)))?;
        let model = guard.as_ref().ok_or(IdsError::NotFitted(COMPONENT))?;

        if features.len() != model.num_features {
            return Err(IdsError::Schema(format!(
                "model expects {} features, got {}",
                model.num_features,
                features.len()
            )));
        }

        let input: Tensor =
            tract_ndarray::Array2::from_shape_vec((1, model.num_features), features.as_slice().to_vec())
                .map_err(|e| IdsError::Inference(e.to_string()))?
                .into();

        let result = model
            .plan
            .run(tvec!(input.into()))
            .map_err(|e| IdsError::Inference(e.to_string()))?;
        let output = result
            .first()
            .ok_or_else(|| IdsError::Inference("No output from model".to_string()))?;
        let values: Vec<f32> = output
            .to_array_view::<f32>()
            .map_err(|e| IdsError::Inference(e.to_string()))?
            .iter()
            .copied()
            .collect();

        let elapsed = start.elapsed();
        if elapsed.as_millis() > MAX_INFERENCE_MS {
            warn!(elapsed_ms = elapsed.as_millis(), "Inference exceeded {}ms target", MAX_INFERENCE_MS);
        }

        verdict_from_output(&values)
    }

    fn is_loaded(&self) -> bool {
        self.model.read().map(|m| m.is_some()).unwrap_or(false)
    }
}

/// Interpret raw model output as class probabilities
fn verdict_from_output(values: &[f32]) -> Result<Verdict> {
    match values {
        [attack] => Ok(Verdict::from_probabilities(1.0 - *attack as f64, *attack as f64)),
        [normal, attack, ..] => Ok(Verdict::from_probabilities(*normal as f64, *attack as f64)),
        [] => Err(IdsError::Inference("Model produced an empty output".to_string())),
    }
}

/// Compute SHA256 checksum of data
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Prediction;
    use tempfile::TempDir;

    #[test]
    fn test_unloaded_oracle_is_not_fitted() {
        let oracle = OnnxOracle::unloaded();
        assert!(!oracle.is_loaded());
        assert!(oracle.model_version().is_none());

        let err = oracle.predict(&NormalizedVector::new(vec![0.0; 28])).unwrap_err();
        assert!(matches!(err, IdsError::NotFitted(_)));
    }

    #[test]
    fn test_invalid_model_bytes() {
        assert!(OnnxOracle::new(b"definitely not onnx", 28).is_err());
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"weights").unwrap();

        let err = OnnxOracle::from_file(&path, 28, Some("00ff")).err().unwrap();
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[test]
    fn test_missing_model_file() {
        let dir = TempDir::new().unwrap();
        assert!(OnnxOracle::from_file(&dir.path().join("absent.onnx"), 28, None).is_err());
    }

    #[test]
    fn test_compute_checksum() {
        assert_eq!(
            compute_checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verdict_from_two_class_output() {
        let verdict = verdict_from_output(&[0.1, 0.9]).unwrap();
        assert_eq!(verdict.prediction, Prediction::Attack);
        assert!((verdict.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_verdict_from_single_probability() {
        let verdict = verdict_from_output(&[0.25]).unwrap();
        assert_eq!(verdict.prediction, Prediction::Normal);
        assert!((verdict.probabilities.attack - 0.25).abs() < 1e-6);
        assert!(verdict_from_output(&[]).is_err());
    }
}
