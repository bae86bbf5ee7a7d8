//! Prometheus metrics and named log events for the detection pipeline

use crate::models::{AggregateStats, Prediction, ThreatCategory};
use prometheus::{
    register_gauge, register_gauge_vec, register_histogram, register_int_counter,
    register_int_counter_vec, register_int_gauge, Encoder, Gauge, GaugeVec, Histogram, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

static GLOBAL_METRICS: OnceLock<IdsMetricsInner> = OnceLock::new();

struct IdsMetricsInner {
    records_processed: IntCounter,
    attacks_detected: IntCounterVec,
    record_errors: IntCounterVec,
    tick_errors: IntCounter,
    tick_latency_seconds: Histogram,
    inference_latency_seconds: Histogram,
    stream_position: IntGauge,
    detection_rate_percent: Gauge,
    monitoring_active: IntGauge,
    model_version_info: GaugeVec,
}

impl IdsMetricsInner {
    fn new() -> Self {
        Self {
            records_processed: register_int_counter!(
                "ids_records_processed_total",
                "Records classified and written to the ledger"
            )
            .expect("Failed to register records_processed"),

            attacks_detected: register_int_counter_vec!(
                "ids_attacks_detected_total",
                "Attack verdicts by threat category",
                &["threat_type"]
            )
            .expect("Failed to register attacks_detected"),

            record_errors: register_int_counter_vec!(
                "ids_record_errors_total",
                "Records skipped because of a per-record fault",
                &["kind"]
            )
            .expect("Failed to register record_errors"),

            tick_errors: register_int_counter!(
                "ids_tick_errors_total",
                "Monitoring ticks aborted by a stream or ledger fault"
            )
            .expect("Failed to register tick_errors"),

            tick_latency_seconds: register_histogram!(
                "ids_tick_latency_seconds",
                "Time spent processing one monitoring tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            inference_latency_seconds: register_histogram!(
                "ids_inference_latency_seconds",
                "Time spent normalizing and classifying one record",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register inference_latency_seconds"),

            stream_position: register_int_gauge!(
                "ids_stream_position",
                "Number of source records consumed by the cursor"
            )
            .expect("Failed to register stream_position"),

            detection_rate_percent: register_gauge!(
                "ids_detection_rate_percent",
                "Share of ledger entries classified as attacks"
            )
            .expect("Failed to register detection_rate_percent"),

            monitoring_active: register_int_gauge!(
                "ids_monitoring_active",
                "1 while the monitoring loop is running"
            )
            .expect("Failed to register monitoring_active"),

            model_version_info: register_gauge_vec!(
                "ids_model_version_info",
                "Information about the loaded classification model",
                &["version"]
            )
            .expect("Failed to register model_version_info"),
        }
    }
}

/// Handle to the process-wide metrics; clones share the same collectors
#[derive(Clone)]
pub struct IdsMetrics {
    _private: (),
}

impl Default for IdsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl IdsMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(IdsMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &IdsMetricsInner {
        GLOBAL_METRICS.get_or_init(IdsMetricsInner::new)
    }

    pub fn record_verdict(&self, prediction: Prediction, threat: Option<ThreatCategory>) {
        let inner = self.inner();
        inner.records_processed.inc();
        if prediction == Prediction::Attack {
            let label = threat.unwrap_or(ThreatCategory::Unknown);
            inner.attacks_detected.with_label_values(&[label.as_str()]).inc();
        }
    }

    /// Count a skipped record; `kind` is a short fault label
    pub fn inc_record_errors(&self, kind: &str) {
        self.inner().record_errors.with_label_values(&[kind]).inc();
    }

    pub fn inc_tick_errors(&self) {
        self.inner().tick_errors.inc();
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn observe_inference_latency(&self, duration_secs: f64) {
        self.inner().inference_latency_seconds.observe(duration_secs);
    }

    pub fn set_stream_position(&self, position: u64) {
        self.inner().stream_position.set(position as i64);
    }

    pub fn set_stats(&self, stats: &AggregateStats) {
        self.inner().detection_rate_percent.set(stats.detection_rate);
    }

    pub fn set_monitoring_active(&self, active: bool) {
        self.inner().monitoring_active.set(i64::from(active));
    }

    pub fn set_model_version(&self, version: &str) {
        let info = &self.inner().model_version_info;
        info.reset();
        info.with_label_values(&[version]).set(1.0);
    }
}

/// Render every registered metric in the Prometheus text format
pub fn encode_metrics() -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

/// Named log events with consistent fields
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Normal verdicts go to debug; attacks are logged at warn
    pub fn log_detection(
        &self,
        entry_id: i64,
        prediction: Prediction,
        confidence: f64,
        threat: Option<ThreatCategory>,
        rule: Option<&str>,
        protocol: &str,
        service: &str,
    ) {
        match prediction {
            Prediction::Attack => {
                let threat_type = threat.unwrap_or(ThreatCategory::Unknown);
                warn!(
                    event = "attack_detected",
                    instance = %self.instance,
                    entry_id,
                    threat_type = %threat_type,
                    rule = rule.unwrap_or("none"),
                    confidence,
                    protocol = %protocol,
                    service = %service,
                    "Attack detected"
                );
            }
            Prediction::Normal => {
                debug!(
                    event = "detection_recorded",
                    instance = %self.instance,
                    entry_id,
                    confidence,
                    protocol = %protocol,
                    service = %service,
                    "Normal traffic recorded"
                );
            }
        }
    }

    pub fn log_monitor_started(&self, source: &str, position: u64) {
        info!(
            event = "monitor_started",
            instance = %self.instance,
            source = %source,
            position,
            "Monitoring started"
        );
    }

    pub fn log_monitor_stopped(&self, acknowledged: bool) {
        if acknowledged {
            info!(
                event = "monitor_stopped",
                instance = %self.instance,
                "Monitoring stopped"
            );
        } else {
            warn!(
                event = "monitor_stopped",
                instance = %self.instance,
                acknowledged = false,
                "Monitoring worker did not stop in time; it will exit at its next check"
            );
        }
    }

    pub fn log_startup(&self, version: &str, model_version: &str) {
        info!(
            event = "agent_started",
            instance = %self.instance,
            agent_version = %version,
            model_version = %model_version,
            "Intrusion detection agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Intrusion detection agent shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        let metrics = IdsMetrics::new();
        metrics.record_verdict(Prediction::Attack, Some(ThreatCategory::PortScan));
        metrics.record_verdict(Prediction::Normal, None);
        metrics.inc_record_errors("schema");
        metrics.observe_inference_latency(0.001);
        metrics.set_stream_position(13);
        metrics.set_model_version("ba7816bf8f01");

        let text = String::from_utf8(encode_metrics().unwrap()).unwrap();
        assert!(text.contains("ids_records_processed_total"));
        assert!(text.contains("threat_type=\"PortScan\""));
        assert!(text.contains("ids_model_version_info{version=\"ba7816bf8f01\"} 1"));
    }

    #[test]
    fn test_handles_share_collectors() {
        let a = IdsMetrics::new();
        let b = a.clone();
        let before = a.inner().tick_errors.get();
        b.inc_tick_errors();
        assert!(a.inner().tick_errors.get() > before);
    }

    #[test]
    fn test_structured_logger() {
        let logger = StructuredLogger::new("sensor-1");
        assert_eq!(logger.instance(), "sensor-1");
        logger.log_detection(1, Prediction::Attack, 0.9, None, None, "tcp", "http");
    }
}
