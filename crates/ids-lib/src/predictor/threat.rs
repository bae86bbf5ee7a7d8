//! Heuristic threat-type refinement for attack verdicts
//!
//! Rules run over raw (unnormalized) feature values, in order, and the first
//! matching rule decides the category.

use crate::models::{ThreatCategory, TrafficRecord};

/// One entry of the rule chain
#[derive(Clone, Copy)]
pub struct ThreatRule {
    pub name: &'static str,
    pub matches: fn(&TrafficRecord) -> bool,
    pub category: ThreatCategory,
}

impl std::fmt::Debug for ThreatRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreatRule")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish()
    }
}

/// High connection count in a very short window
fn is_flood(r: &TrafficRecord) -> bool {
    r.numeric("count") > 200.0 && r.numeric("duration") < 1.0
}

fn is_distributed_flood(r: &TrafficRecord) -> bool {
    is_flood(r) && r.numeric("srv_diff_host_rate") > 0.5
}

fn is_port_scan(r: &TrafficRecord) -> bool {
    r.numeric("diff_srv_rate") > 0.5 && r.numeric("serror_rate") > 0.5
}

fn is_brute_force(r: &TrafficRecord) -> bool {
    r.numeric("num_failed_logins") > 0.0
}

/// Default rule chain; order matters
pub const DEFAULT_RULES: [ThreatRule; 4] = [
    ThreatRule {
        name: "distributed_flood",
        matches: is_distributed_flood,
        category: ThreatCategory::DDoS,
    },
    ThreatRule {
        name: "flood",
        matches: is_flood,
        category: ThreatCategory::DoS,
    },
    ThreatRule {
        name: "port_scan",
        matches: is_port_scan,
        category: ThreatCategory::PortScan,
    },
    ThreatRule {
        name: "failed_logins",
        matches: is_brute_force,
        category: ThreatCategory::BruteForce,
    },
];

/// Refines an attack verdict into a named threat category
#[derive(Debug, Clone)]
pub struct ThreatClassifier {
    rules: Vec<ThreatRule>,
}

impl Default for ThreatClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreatClassifier {
    pub fn new() -> Self {
        Self::with_rules(DEFAULT_RULES.to_vec())
    }

    pub fn with_rules(rules: Vec<ThreatRule>) -> Self {
        Self { rules }
    }

    pub fn classify(&self, record: &TrafficRecord) -> ThreatCategory {
        self.classify_with_rule(record).0
    }

    /// Category plus the name of the rule that fired (`None` for the fallback)
    pub fn classify_with_rule(&self, record: &TrafficRecord) -> (ThreatCategory, Option<&'static str>) {
        self.rules
            .iter()
            .find(|rule| (rule.matches)(record))
            .map(|rule| (rule.category, Some(rule.name)))
            .unwrap_or((ThreatCategory::Unknown, None))
    }

    pub fn rules(&self) -> &[ThreatRule] {
        &self.rules
    }
}
