//! Feature normalization for ML inference
//!
//! Fits categorical vocabularies and standardization parameters from a
//! labeled reference dataset, then maps raw traffic records into the fixed
//! numeric layout the classification model was trained on.

use crate::error::{IdsError, Result};
use crate::models::{is_categorical, NormalizedVector, TrafficRecord, FEATURE_COLUMNS};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

const COMPONENT: &str = "feature normalizer";

/// Dense integer codes for one categorical field, in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct CategoryEncoder {
    classes: Vec<String>,
    index: HashMap<String, usize>,
}

impl CategoryEncoder {
    fn observe(&mut self, value: &str) {
        if !self.index.contains_key(value) {
            self.index.insert(value.to_string(), self.classes.len());
            self.classes.push(value.to_string());
        }
    }

    /// Code for `value`; unseen values fall back to the first-inserted class
    pub fn encode(&self, value: &str) -> usize {
        self.index.get(value).copied().unwrap_or(0)
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

impl From<Vec<String>> for CategoryEncoder {
    fn from(values: Vec<String>) -> Self {
        let mut encoder = CategoryEncoder::default();
        for v in &values {
            encoder.observe(v);
        }
        encoder
    }
}

impl From<CategoryEncoder> for Vec<String> {
    fn from(encoder: CategoryEncoder) -> Self {
        encoder.classes
    }
}

/// Mean / standard deviation pair for one numeric field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub mean: f64,
    pub std: f64,
}

impl Standardizer {
    fn fit(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self { mean: 0.0, std: 1.0 };
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = var.sqrt();
        Self {
            mean,
            // Constant columns would divide by zero
            std: if std > 0.0 { std } else { 1.0 },
        }
    }

    pub fn scale(&self, value: f64) -> f64 {
        (value - self.mean) / self.std
    }
}

/// How one output slot is produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldEncoding {
    Categorical(CategoryEncoder),
    Numeric(Standardizer),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedField {
    pub name: String,
    pub encoding: FieldEncoding,
}

/// Prepares raw traffic records for the classification oracle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureNormalizer {
    fields: Option<Vec<FittedField>>,
}

impl FeatureNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fit encoders and scalers on a labeled reference dataset. Replaces any
    /// previously fitted parameters.
    pub fn fit(&mut self, reference: &[TrafficRecord]) -> Result<()> {
        if reference.is_empty() {
            return Err(IdsError::Schema("reference dataset is empty".to_string()));
        }

        for (row, record) in reference.iter().enumerate() {
            if let Some(missing) = FEATURE_COLUMNS.iter().find(|f| !record.contains(f)) {
                return Err(IdsError::Schema(format!(
                    "reference row {} is missing required field '{}'",
                    row, missing
                )));
            }
        }

        let mut fields = Vec::with_capacity(FEATURE_COLUMNS.len());
        for name in FEATURE_COLUMNS {
            let encoding = if is_categorical(name) {
                let mut encoder = CategoryEncoder::default();
                for record in reference {
                    encoder.observe(&record.text(name));
                }
                FieldEncoding::Categorical(encoder)
            } else {
                let values = reference
                    .iter()
                    .enumerate()
                    .map(|(row, record)| numeric_value(record, name, row))
                    .collect::<Result<Vec<f64>>>()?;
                FieldEncoding::Numeric(Standardizer::fit(&values))
            };
            fields.push(FittedField {
                name: name.to_string(),
                encoding,
            });
        }

        self.fields = Some(fields);
        info!(samples = reference.len(), features = FEATURE_COLUMNS.len(), "Feature normalizer fitted");
        Ok(())
    }

    pub fn fit_transform(&mut self, reference: &[TrafficRecord]) -> Result<Vec<NormalizedVector>> {
        self.fit(reference)?;
        reference.iter().map(|r| self.transform(r)).collect()
    }

    /// Map a raw record into the fitted layout. Absent fields count as 0 and
    /// the label field is ignored.
    pub fn transform(&self, record: &TrafficRecord) -> Result<NormalizedVector> {
        let fields = self.fields.as_ref().ok_or(IdsError::NotFitted(COMPONENT))?;

        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            let value = match &field.encoding {
                FieldEncoding::Categorical(encoder) => {
                    let raw = match record.get(&field.name) {
                        Some(v) => v.to_string(),
                        None => "0".to_string(),
                    };
                    encoder.encode(&raw) as f64
                }
                FieldEncoding::Numeric(scaler) => {
                    let raw = match record.get(&field.name) {
                        Some(v) => v.as_f64().ok_or_else(|| {
                            IdsError::Schema(format!(
                                "field '{}' holds non-numeric value '{}'",
                                field.name, v
                            ))
                        })?,
                        None => 0.0,
                    };
                    scaler.scale(raw)
                }
            };
            values.push(value as f32);
        }

        Ok(NormalizedVector::new(values))
    }

    pub fn is_fitted(&self) -> bool {
        self.fields.is_some()
    }

    /// Output slot names in order; empty before fitting
    pub fn feature_names(&self) -> Vec<&str> {
        self.fields
            .iter()
            .flatten()
            .map(|f| f.name.as_str())
            .collect()
    }

    pub fn feature_count(&self) -> usize {
        self.fields.as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn encoder(&self, field: &str) -> Option<&CategoryEncoder> {
        self.fields.iter().flatten().find_map(|f| match &f.encoding {
            FieldEncoding::Categorical(e) if f.name == field => Some(e),
            _ => None,
        })
    }

    /// Persist the fitted parameters as JSON
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if !self.is_fitted() {
            anyhow::bail!("Refusing to save an unfitted normalizer");
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let json = serde_json::to_vec_pretty(self).context("Failed to serialize normalizer")?;

        // Write atomically using temp file
        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
        file.write_all(&json).context("Failed to write normalizer")?;
        file.sync_all().context("Failed to sync normalizer file")?;

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        debug!(path = %path.display(), "Normalizer saved");
        Ok(())
    }

    /// Load parameters previously written by [`FeatureNormalizer::save`]
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read(path).with_context(|| format!("Failed to read normalizer {:?}", path))?;
        let normalizer: FeatureNormalizer =
            serde_json::from_slice(&data).context("Failed to deserialize normalizer")?;
        if !normalizer.is_fitted() {
            anyhow::bail!("Normalizer file {:?} holds no fitted parameters", path);
        }
        info!(path = %path.display(), features = normalizer.feature_count(), "Loaded normalizer");
        Ok(normalizer)
    }
}

fn numeric_value(record: &TrafficRecord, name: &str, row: usize) -> Result<f64> {
    let value = record.get(name).ok_or_else(|| IdsError::missing_field(name))?;
    value.as_f64().ok_or_else(|| {
        IdsError::Schema(format!(
            "reference row {} has non-numeric value '{}' for field '{}'",
            row, value, name
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureValue, LABEL_COLUMN};
    use tempfile::TempDir;

    fn full_record(protocol: &str, service: &str, flag: &str, base: f64) -> TrafficRecord {
        let mut record = TrafficRecord::new();
        for (i, name) in FEATURE_COLUMNS.iter().enumerate() {
            let value: FeatureValue = match *name {
                "protocol_type" => protocol.into(),
                "service" => service.into(),
                "flag" => flag.into(),
                _ => (base + i as f64).into(),
            };
            record.insert(name, value);
        }
        record.with(LABEL_COLUMN, "normal")
    }

    fn reference() -> Vec<TrafficRecord> {
        vec![
            full_record("tcp", "http", "SF", 0.0),
            full_record("udp", "domain_u", "SF", 10.0),
            full_record("tcp", "ftp", "REJ", 20.0),
        ]
    }

    fn fitted() -> FeatureNormalizer {
        let mut normalizer = FeatureNormalizer::new();
        normalizer.fit(&reference()).unwrap();
        normalizer
    }

    fn slot(normalizer: &FeatureNormalizer, name: &str) -> usize {
        normalizer
            .feature_names()
            .iter()
            .position(|n| *n == name)
            .unwrap()
    }

    #[test]
    fn test_transform_before_fit() {
        let normalizer = FeatureNormalizer::new();
        let err = normalizer.transform(&reference()[0]).unwrap_err();
        assert!(matches!(err, IdsError::NotFitted(_)));
    }

    #[test]
    fn test_fit_rejects_missing_field() {
        let mut broken = reference();
        broken[1] = TrafficRecord::new().with("duration", 1.0);
        let err = FeatureNormalizer::new().fit(&broken).unwrap_err();
        assert!(matches!(err, IdsError::Schema(_)));
    }

    #[test]
    fn test_fit_rejects_empty_reference() {
        let err = FeatureNormalizer::new().fit(&[]).unwrap_err();
        assert!(matches!(err, IdsError::Schema(_)));
    }

    #[test]
    fn test_layout_is_schema_order_without_label() {
        let normalizer = fitted();
        assert_eq!(normalizer.feature_count(), FEATURE_COLUMNS.len());
        assert_eq!(normalizer.feature_names(), FEATURE_COLUMNS.to_vec());

        let vector = normalizer.transform(&reference()[0]).unwrap();
        assert_eq!(vector.len(), FEATURE_COLUMNS.len());
    }

    #[test]
    fn test_categorical_codes_follow_first_seen_order() {
        let normalizer = fitted();
        let services = normalizer.encoder("service").unwrap();
        assert_eq!(services.classes(), ["http", "domain_u", "ftp"]);

        let vector = normalizer.transform(&reference()[2]).unwrap();
        assert_eq!(vector.as_slice()[slot(&normalizer, "service")], 2.0);
        assert_eq!(vector.as_slice()[slot(&normalizer, "flag")], 1.0);
    }

    #[test]
    fn test_unseen_category_maps_to_first_code() {
        let normalizer = fitted();
        let record = full_record("icmp", "telnet", "S0", 5.0);

        let first = normalizer.transform(&record).unwrap();
        let second = normalizer.transform(&record).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_slice()[slot(&normalizer, "protocol_type")], 0.0);
        assert_eq!(first.as_slice()[slot(&normalizer, "service")], 0.0);
    }

    #[test]
    fn test_numeric_standardization() {
        let normalizer = fitted();
        // duration column holds 0, 10, 20: mean 10, population std sqrt(200/3)
        let vector = normalizer.transform(&reference()[2]).unwrap();
        let expected = (20.0 - 10.0) / (200.0f64 / 3.0).sqrt();
        let got = vector.as_slice()[slot(&normalizer, "duration")] as f64;
        assert!((got - expected).abs() < 1e-5, "got {}", got);

        let mean_record = full_record("tcp", "http", "SF", 10.0);
        let centered = normalizer.transform(&mean_record).unwrap();
        assert!(centered.as_slice()[slot(&normalizer, "src_bytes")].abs() < 1e-6);
    }

    #[test]
    fn test_constant_column_does_not_divide_by_zero() {
        let records = vec![full_record("tcp", "http", "SF", 3.0); 4];
        let mut normalizer = FeatureNormalizer::new();
        normalizer.fit(&records).unwrap();

        let vector = normalizer.transform(&full_record("tcp", "http", "SF", 5.0)).unwrap();
        assert!(vector.as_slice().iter().all(|v| v.is_finite()));
        assert_eq!(vector.as_slice()[slot(&normalizer, "duration")], 2.0);
    }

    #[test]
    fn test_absent_fields_filled_with_zero() {
        let normalizer = fitted();
        let sparse = TrafficRecord::new().with("service", "http");
        let vector = normalizer.transform(&sparse).unwrap();

        assert_eq!(vector.len(), FEATURE_COLUMNS.len());
        let Some(FieldEncoding::Numeric(scaler)) = normalizer
            .fields
            .as_ref()
            .and_then(|f| f.iter().find(|f| f.name == "duration"))
            .map(|f| f.encoding.clone())
        else {
            panic!("duration should be numeric");
        };
        let got = vector.as_slice()[slot(&normalizer, "duration")] as f64;
        assert!((got - scaler.scale(0.0)).abs() < 1e-5);
    }

    #[test]
    fn test_non_numeric_value_is_schema_error() {
        let normalizer = fitted();
        let record = full_record("tcp", "http", "SF", 0.0).with("src_bytes", "lots");
        let err = normalizer.transform(&record).unwrap_err();
        assert!(matches!(err, IdsError::Schema(_)));
    }

    #[test]
    fn test_refit_replaces_parameters() {
        let mut normalizer = fitted();
        normalizer
            .fit(&[full_record("icmp", "ecr_i", "SF", 0.0)])
            .unwrap();
        assert_eq!(normalizer.encoder("service").unwrap().classes(), ["ecr_i"]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model").join("normalizer.json");

        let normalizer = fitted();
        normalizer.save(&path).unwrap();
        let loaded = FeatureNormalizer::load(&path).unwrap();

        assert_eq!(loaded, normalizer);
        let record = full_record("udp", "ftp", "REJ", 7.0);
        assert_eq!(
            loaded.transform(&record).unwrap(),
            normalizer.transform(&record).unwrap()
        );
    }

    #[test]
    fn test_save_unfitted_fails() {
        let dir = TempDir::new().unwrap();
        assert!(FeatureNormalizer::new()
            .save(&dir.path().join("normalizer.json"))
            .is_err());
    }
}
