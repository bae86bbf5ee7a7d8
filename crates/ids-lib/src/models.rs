//! Core data models for the detection pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Fixed 28-field traffic feature schema, in canonical order
pub const FEATURE_COLUMNS: [&str; 28] = [
    "duration",
    "protocol_type",
    "service",
    "flag",
    "src_bytes",
    "dst_bytes",
    "land",
    "wrong_fragment",
    "urgent",
    "hot",
    "num_failed_logins",
    "logged_in",
    "num_compromised",
    "root_shell",
    "su_attempted",
    "num_root",
    "num_file_creations",
    "num_shells",
    "num_access_files",
    "count",
    "srv_count",
    "serror_rate",
    "srv_serror_rate",
    "rerror_rate",
    "srv_rerror_rate",
    "same_srv_rate",
    "diff_srv_rate",
    "srv_diff_host_rate",
];

/// Fields holding categorical strings rather than numbers
pub const CATEGORICAL_COLUMNS: [&str; 3] = ["protocol_type", "service", "flag"];

/// Optional trailing ground-truth field, never used for inference
pub const LABEL_COLUMN: &str = "label";

pub fn is_categorical(field: &str) -> bool {
    CATEGORICAL_COLUMNS.contains(&field)
}

/// A single scalar feature value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Number(f64),
    Text(String),
}

impl FeatureValue {
    /// Numeric view of the value; text is parsed if it looks like a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(v) => Some(*v),
            FeatureValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Number(v) => write!(f, "{}", v),
            FeatureValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Number(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(s: &str) -> Self {
        FeatureValue::Text(s.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(s: String) -> Self {
        FeatureValue::Text(s)
    }
}

/// One observed flow: feature name to scalar value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrafficRecord {
    fields: BTreeMap<String, FeatureValue>,
}

impl TrafficRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<FeatureValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<FeatureValue>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Numeric value of a field, 0 when absent or non-numeric
    pub fn numeric(&self, name: &str) -> f64 {
        self.get(name).and_then(FeatureValue::as_f64).unwrap_or(0.0)
    }

    /// String rendering of a field, empty when absent
    pub fn text(&self, name: &str) -> String {
        self.get(name).map(|v| v.to_string()).unwrap_or_default()
    }

    /// Remove and return the ground-truth label, if any
    pub fn strip_label(&mut self) -> Option<FeatureValue> {
        self.fields.remove(LABEL_COLUMN)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FeatureValue)> {
        self.fields.iter()
    }
}

impl FromIterator<(String, FeatureValue)> for TrafficRecord {
    fn from_iter<I: IntoIterator<Item = (String, FeatureValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Normalized feature vector in fitted schema order
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedVector {
    values: Vec<f32>,
}

impl NormalizedVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.values
    }
}

/// Binary classification outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prediction {
    Normal,
    Attack,
}

impl Prediction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prediction::Normal => "normal",
            Prediction::Attack => "attack",
        }
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Prediction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Prediction::Normal),
            "attack" => Ok(Prediction::Attack),
            other => Err(format!("unknown prediction label '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassProbabilities {
    pub normal: f64,
    pub attack: f64,
}

/// Oracle output for one record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub prediction: Prediction,
    /// Probability of the predicted class
    pub confidence: f64,
    pub probabilities: ClassProbabilities,
}

impl Verdict {
    /// Build a verdict from raw class scores, renormalizing so they sum to 1.
    /// Ties resolve to `Normal`.
    pub fn from_probabilities(normal: f64, attack: f64) -> Self {
        let normal = if normal.is_finite() { normal.max(0.0) } else { 0.0 };
        let attack = if attack.is_finite() { attack.max(0.0) } else { 0.0 };
        let sum = normal + attack;
        let (normal, attack) = if sum > 0.0 {
            (normal / sum, attack / sum)
        } else {
            (0.5, 0.5)
        };

        let prediction = if attack > normal {
            Prediction::Attack
        } else {
            Prediction::Normal
        };
        let confidence = match prediction {
            Prediction::Normal => normal,
            Prediction::Attack => attack,
        };

        Self {
            prediction,
            confidence,
            probabilities: ClassProbabilities { normal, attack },
        }
    }

    pub fn is_attack(&self) -> bool {
        self.prediction == Prediction::Attack
    }
}

/// Refined label for attack verdicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreatCategory {
    DoS,
    DDoS,
    PortScan,
    BruteForce,
    Unknown,
}

impl ThreatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::DoS => "DoS",
            ThreatCategory::DDoS => "DDoS",
            ThreatCategory::PortScan => "PortScan",
            ThreatCategory::BruteForce => "BruteForce",
            ThreatCategory::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted, immutable ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub prediction: Prediction,
    pub confidence: f64,
    pub threat_type: Option<String>,
    pub features: TrafficRecord,
    pub src_bytes: i64,
    pub dst_bytes: i64,
    pub protocol_type: String,
    pub service: String,
    pub flag: String,
}

/// Summary of the most recent attack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatSummary {
    pub timestamp: DateTime<Utc>,
    pub threat_type: Option<String>,
    pub confidence: f64,
    pub protocol: String,
    pub service: String,
}

/// Rollup computed fresh from the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub total_packets: u64,
    pub total_attacks: u64,
    /// Attack percentage in [0, 100], rounded to two decimals
    pub detection_rate: f64,
    pub last_threat: Option<ThreatSummary>,
}

impl DetectionStats {
    pub fn new(total_packets: u64, total_attacks: u64, last_threat: Option<ThreatSummary>) -> Self {
        Self {
            total_packets,
            total_attacks,
            detection_rate: detection_rate(total_packets, total_attacks),
            last_threat,
        }
    }

    /// Attack ratio in [0, 1], 0 for an empty ledger
    pub fn attack_ratio(&self) -> f64 {
        if self.total_packets == 0 {
            0.0
        } else {
            self.total_attacks as f64 / self.total_packets as f64
        }
    }
}

fn detection_rate(total: u64, attacks: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = attacks as f64 / total as f64 * 100.0;
    ((pct * 100.0).round() / 100.0).clamp(0.0, 100.0)
}

/// Count of entries per prediction label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub normal: u64,
    pub attack: u64,
}

impl Distribution {
    pub fn total(&self) -> u64 {
        self.normal + self.attack
    }
}

/// Live risk level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskStatus {
    #[default]
    Safe,
    Warning,
    Danger,
}

impl fmt::Display for RiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskStatus::Safe => write!(f, "SAFE"),
            RiskStatus::Warning => write!(f, "WARNING"),
            RiskStatus::Danger => write!(f, "DANGER"),
        }
    }
}

/// Attack-ratio thresholds separating the risk levels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusThresholds {
    /// Ratios below this are SAFE
    pub safe: f64,
    /// Ratios below this (and at or above `safe`) are WARNING
    pub warning: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            safe: 0.1,
            warning: 0.3,
        }
    }
}

impl StatusThresholds {
    pub fn new(safe: f64, warning: f64) -> Result<Self, String> {
        let thresholds = Self { safe, warning };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.safe) || !(0.0..=1.0).contains(&self.warning) {
            return Err(format!(
                "thresholds must lie in [0, 1], got safe={} warning={}",
                self.safe, self.warning
            ));
        }
        if self.safe > self.warning {
            return Err(format!(
                "safe threshold {} exceeds warning threshold {}",
                self.safe, self.warning
            ));
        }
        Ok(())
    }

    pub fn classify(&self, stats: &DetectionStats) -> RiskStatus {
        if stats.total_packets == 0 {
            return RiskStatus::Safe;
        }
        let ratio = stats.attack_ratio();
        if ratio < self.safe {
            RiskStatus::Safe
        } else if ratio < self.warning {
            RiskStatus::Warning
        } else {
            RiskStatus::Danger
        }
    }
}

/// Ledger rollup plus the derived risk status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_packets: u64,
    pub total_attacks: u64,
    pub detection_rate: f64,
    pub last_threat: Option<ThreatSummary>,
    pub status: RiskStatus,
}

impl AggregateStats {
    pub fn derive(stats: DetectionStats, thresholds: &StatusThresholds) -> Self {
        let status = thresholds.classify(&stats);
        Self {
            total_packets: stats.total_packets,
            total_attacks: stats.total_attacks,
            detection_rate: stats.detection_rate,
            last_threat: stats.last_threat,
            status,
        }
    }
}
