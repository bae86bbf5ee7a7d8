//! Streaming network intrusion detection
//!
//! This crate provides the core functionality for:
//! - Tailing an append-only source of traffic records
//! - Feature normalization and binary attack classification
//! - Rule-based threat categorization of attack verdicts
//! - A persistent detection ledger with aggregate statistics
//! - A supervised background monitoring loop
//! - Health checks and observability

pub mod error;
pub mod health;
pub mod ledger;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod predictor;
pub mod stream;

pub use error::{IdsError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use ledger::{DetectionLedger, DEFAULT_RECENT_LIMIT};
pub use models::*;
pub use monitor::{ControlAction, MonitorConfig, MonitoringSupervisor, MonitoringSupervisorBuilder};
pub use observability::{IdsMetrics, StructuredLogger};
