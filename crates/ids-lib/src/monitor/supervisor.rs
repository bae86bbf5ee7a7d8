//! Background monitoring loop and its start/stop control surface

use crate::error::{IdsError, Result};
use crate::health::{components, HealthRegistry};
use crate::ledger::DetectionLedger;
use crate::models::{AggregateStats, StatusThresholds, ThreatCategory, TrafficRecord, Verdict};
use crate::observability::{IdsMetrics, StructuredLogger};
use crate::predictor::{ClassificationOracle, FeatureNormalizer, ThreatClassifier};
use crate::stream::{RecordSource, StreamCursor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_INSTANCE: &str = "ids-agent";

/// Configuration for the monitoring loop
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Pause between ticks (default: 3 seconds)
    pub poll_interval: Duration,
    /// Upper bound `stop()` waits for the worker (default: 5 seconds)
    pub stop_timeout: Duration,
    pub thresholds: StatusThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(5),
            thresholds: StatusThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Running,
}

/// Operator command accepted by the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Stop,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlAction {
    type Err = IdsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(ControlAction::Start),
            "stop" => Ok(ControlAction::Stop),
            other => Err(IdsError::InvalidAction(other.to_string())),
        }
    }
}

/// Result of classifying and storing one record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub entry_id: i64,
    pub verdict: Verdict,
    pub threat: Option<ThreatCategory>,
}

#[derive(Debug, Default)]
struct TickSummary {
    processed: usize,
    attacks: usize,
    skipped: usize,
    abandoned: usize,
}

struct Worker {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Everything readers and the worker exchange, guarded by one lock
struct Shared {
    state: MonitorState,
    stats: AggregateStats,
    position: u64,
    /// Bumped on every start; commits from older workers are dropped
    generation: u64,
    worker: Option<Worker>,
}

struct Inner {
    source: Arc<dyn RecordSource>,
    normalizer: Arc<FeatureNormalizer>,
    oracle: Arc<dyn ClassificationOracle>,
    ledger: DetectionLedger,
    classifier: ThreatClassifier,
    config: MonitorConfig,
    health: Option<HealthRegistry>,
    metrics: Option<IdsMetrics>,
    logger: StructuredLogger,
    shared: Mutex<Shared>,
}

/// Owns the background detection loop and the cached live statistics.
///
/// Cheap to clone; all clones control the same loop.
#[derive(Clone)]
pub struct MonitoringSupervisor {
    inner: Arc<Inner>,
}

impl MonitoringSupervisor {
    pub fn new(
        source: Arc<dyn RecordSource>,
        normalizer: Arc<FeatureNormalizer>,
        oracle: Arc<dyn ClassificationOracle>,
        ledger: DetectionLedger,
        config: MonitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: initial_state(&ledger, &config.thresholds),
                source,
                normalizer,
                oracle,
                ledger,
                classifier: ThreatClassifier::new(),
                config,
                health: None,
                metrics: None,
                logger: StructuredLogger::new(DEFAULT_INSTANCE),
            }),
        }
    }

    /// Launch the background loop. Returns `false` (and does nothing) when
    /// it is already running. Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut shared = self.inner.shared.lock();
        if shared.state == MonitorState::Running {
            debug!("Monitoring already running");
            return false;
        }

        shared.generation += 1;
        let generation = shared.generation;
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_worker(Arc::clone(&self.inner), generation, shutdown_rx));
        shared.worker = Some(Worker { shutdown, handle });
        shared.state = MonitorState::Running;
        drop(shared);

        if let Some(metrics) = &self.inner.metrics {
            metrics.set_monitoring_active(true);
        }
        info!(generation, source = %self.inner.source.id(), "Monitoring start requested");
        true
    }

    /// Signal the loop to stop and wait up to `stop_timeout` for it to finish
    /// the record in hand; the rest of its batch is dropped. Returns `false`
    /// when it was not running.
    pub async fn stop(&self) -> bool {
        let worker = {
            let mut shared = self.inner.shared.lock();
            if shared.state == MonitorState::Stopped {
                debug!("Monitoring already stopped");
                return false;
            }
            shared.state = MonitorState::Stopped;
            shared.worker.take()
        };

        if let Some(metrics) = &self.inner.metrics {
            metrics.set_monitoring_active(false);
        }

        let acknowledged = match worker {
            Some(Worker { shutdown, handle }) => {
                // The worker may already be gone
                let _ = shutdown.send(());
                match tokio::time::timeout(self.inner.config.stop_timeout, handle).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        error!(error = %e, "Monitoring worker terminated abnormally");
                        true
                    }
                    Err(_) => false,
                }
            }
            None => true,
        };

        self.inner.logger.log_monitor_stopped(acknowledged);
        true
    }

    pub async fn apply(&self, action: ControlAction) -> bool {
        match action {
            ControlAction::Start => self.start(),
            ControlAction::Stop => self.stop().await,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.shared.lock().state == MonitorState::Running
    }

    pub fn state(&self) -> MonitorState {
        self.inner.shared.lock().state
    }

    /// Snapshot of the statistics committed by the last completed tick
    pub fn stats(&self) -> AggregateStats {
        self.inner.shared.lock().stats.clone()
    }

    /// Records consumed by the current (or last) run's cursor
    pub fn stream_position(&self) -> u64 {
        self.inner.shared.lock().position
    }

    /// Recompute statistics from the ledger and replace the cached snapshot
    pub fn refresh_stats(&self) -> Result<AggregateStats> {
        let stats = self.inner.compute_stats()?;
        self.inner.shared.lock().stats = stats.clone();
        Ok(stats)
    }

    /// Classify one raw record and append the verdict to the ledger
    pub fn process_record(&self, record: TrafficRecord) -> Result<RecordOutcome> {
        self.inner.process_record(record)
    }

    pub fn ledger(&self) -> &DetectionLedger {
        &self.inner.ledger
    }

    pub fn oracle_loaded(&self) -> bool {
        self.inner.oracle.is_loaded()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }
}

impl Inner {
    fn compute_stats(&self) -> Result<AggregateStats> {
        let stats = self.ledger.statistics()?;
        Ok(AggregateStats::derive(stats, &self.config.thresholds))
    }

    fn process_record(&self, mut record: TrafficRecord) -> Result<RecordOutcome> {
        record.strip_label();

        let started = Instant::now();
        let features = self.normalizer.transform(&record)?;
        let verdict = self.oracle.predict(&features)?;
        if let Some(metrics) = &self.metrics {
            metrics.observe_inference_latency(started.elapsed().as_secs_f64());
        }

        let (threat, rule) = if verdict.is_attack() {
            let (category, rule) = self.classifier.classify_with_rule(&record);
            (Some(category), rule)
        } else {
            (None, None)
        };

        let entry_id = self.ledger.insert(&verdict, &record, threat)?;

        if let Some(metrics) = &self.metrics {
            metrics.record_verdict(verdict.prediction, threat);
        }
        self.logger.log_detection(
            entry_id,
            verdict.prediction,
            verdict.confidence,
            threat,
            rule,
            &record.text("protocol_type"),
            &record.text("service"),
        );

        Ok(RecordOutcome {
            entry_id,
            verdict,
            threat,
        })
    }

    /// Whether `generation` is still the running loop
    fn is_current(&self, generation: u64) -> bool {
        let shared = self.shared.lock();
        shared.state == MonitorState::Running && shared.generation == generation
    }

    /// Run synchronous pipeline work (normalizer, model, SQLite) on the
    /// blocking pool so the worker task never stalls the runtime
    async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }

    async fn tick(
        self: &Arc<Self>,
        cursor: &mut StreamCursor,
        generation: u64,
    ) -> Result<TickSummary> {
        let records = cursor.poll().await?;
        if records.is_empty() {
            return Ok(TickSummary::default());
        }

        let first = cursor.position() - records.len() as u64;
        self.run_blocking(move |inner| Ok(inner.process_batch(generation, first, records)))
            .await
    }

    /// Classify a batch in order. Per-record faults skip only that record;
    /// the rest of the batch is abandoned once the run is stopped or replaced.
    fn process_batch(
        &self,
        generation: u64,
        first: u64,
        records: Vec<TrafficRecord>,
    ) -> TickSummary {
        let mut summary = TickSummary::default();
        let total = records.len();

        for (offset, record) in records.into_iter().enumerate() {
            if !self.is_current(generation) {
                summary.abandoned = total - offset;
                debug!(generation, abandoned = summary.abandoned, "Run stopped mid-batch");
                break;
            }

            match self.process_record(record) {
                Ok(outcome) => {
                    summary.processed += 1;
                    if outcome.verdict.is_attack() {
                        summary.attacks += 1;
                    }
                }
                Err(e) => {
                    summary.skipped += 1;
                    warn!(error = %e, record = first + offset as u64, "Skipping record");
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_record_errors(e.record_fault_kind().unwrap_or("other"));
                    }
                }
            }
        }

        summary
    }

    /// Store a tick's results unless a newer run has started since
    fn commit(&self, generation: u64, position: u64, stats: Option<AggregateStats>) -> bool {
        let mut shared = self.shared.lock();
        if shared.generation != generation {
            return false;
        }
        shared.position = position;
        if let Some(stats) = stats {
            shared.stats = stats;
        }
        true
    }

    async fn report(&self, component: &str, fault: Option<&IdsError>, degraded: &mut bool) {
        let Some(health) = &self.health else {
            return;
        };
        match fault {
            Some(e) => {
                health.set_degraded(component, e.to_string()).await;
                *degraded = true;
            }
            None if *degraded => {
                health.set_healthy(component).await;
                *degraded = false;
            }
            None => {}
        }
    }
}

async fn run_worker(inner: Arc<Inner>, generation: u64, mut shutdown: broadcast::Receiver<()>) {
    let mut cursor = StreamCursor::new(Arc::clone(&inner.source));
    let mut stream_degraded = false;
    let mut ledger_degraded = false;

    if let Err(e) = cursor.initialize().await {
        warn!(error = %e, "Failed to initialize stream cursor, retrying on next tick");
        inner.report(components::STREAM, Some(&e), &mut stream_degraded).await;
    }
    inner.commit(generation, cursor.position(), None);
    inner.logger.log_monitor_started(cursor.source_id(), cursor.position());

    loop {
        match shutdown.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }

        let started = Instant::now();
        match inner.tick(&mut cursor, generation).await {
            Ok(summary) => {
                if summary.processed + summary.skipped > 0 {
                    info!(
                        processed = summary.processed,
                        attacks = summary.attacks,
                        skipped = summary.skipped,
                        abandoned = summary.abandoned,
                        position = cursor.position(),
                        "Processed new records"
                    );
                }
                inner.report(components::STREAM, None, &mut stream_degraded).await;
            }
            Err(e) => {
                warn!(error = %e, position = cursor.position(), "Monitoring tick failed");
                if let Some(metrics) = &inner.metrics {
                    metrics.inc_tick_errors();
                }
                inner.report(components::STREAM, Some(&e), &mut stream_degraded).await;
            }
        }

        let stats = match inner.run_blocking(Inner::compute_stats).await {
            Ok(stats) => {
                inner.report(components::LEDGER, None, &mut ledger_degraded).await;
                Some(stats)
            }
            Err(e) => {
                warn!(error = %e, "Failed to refresh detection statistics");
                inner.report(components::LEDGER, Some(&e), &mut ledger_degraded).await;
                None
            }
        };

        if let Some(metrics) = &inner.metrics {
            metrics.observe_tick_latency(started.elapsed().as_secs_f64());
            metrics.set_stream_position(cursor.position());
            if let Some(stats) = &stats {
                metrics.set_stats(stats);
            }
        }
        if !inner.commit(generation, cursor.position(), stats) {
            debug!(generation, "Superseded by a newer run, exiting");
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
            _ = shutdown.recv() => break,
        }
    }

    debug!(generation, position = cursor.position(), "Monitoring worker exited");
}

/// Builder for a [`MonitoringSupervisor`]
pub struct MonitoringSupervisorBuilder {
    source: Option<Arc<dyn RecordSource>>,
    normalizer: Option<Arc<FeatureNormalizer>>,
    oracle: Option<Arc<dyn ClassificationOracle>>,
    ledger: Option<DetectionLedger>,
    classifier: ThreatClassifier,
    config: MonitorConfig,
    health: Option<HealthRegistry>,
    metrics: Option<IdsMetrics>,
    logger: Option<StructuredLogger>,
}

impl Default for MonitoringSupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitoringSupervisorBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            normalizer: None,
            oracle: None,
            ledger: None,
            classifier: ThreatClassifier::new(),
            config: MonitorConfig::default(),
            health: None,
            metrics: None,
            logger: None,
        }
    }

    pub fn source(mut self, source: Arc<dyn RecordSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<FeatureNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn oracle(mut self, oracle: Arc<dyn ClassificationOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn ledger(mut self, ledger: DetectionLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn classifier(mut self, classifier: ThreatClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    pub fn thresholds(mut self, thresholds: StatusThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn metrics(mut self, metrics: IdsMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> anyhow::Result<MonitoringSupervisor> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Record source is required"))?;
        let normalizer = self
            .normalizer
            .ok_or_else(|| anyhow::anyhow!("Feature normalizer is required"))?;
        let oracle = self
            .oracle
            .ok_or_else(|| anyhow::anyhow!("Classification oracle is required"))?;
        let ledger = self
            .ledger
            .ok_or_else(|| anyhow::anyhow!("Detection ledger is required"))?;
        self.config
            .thresholds
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid status thresholds: {}", e))?;

        Ok(MonitoringSupervisor {
            inner: Arc::new(Inner {
                shared: initial_state(&ledger, &self.config.thresholds),
                source,
                normalizer,
                oracle,
                ledger,
                classifier: self.classifier,
                config: self.config,
                health: self.health,
                metrics: self.metrics,
                logger: self
                    .logger
                    .unwrap_or_else(|| StructuredLogger::new(DEFAULT_INSTANCE)),
            }),
        })
    }
}

/// Stopped state seeded with the ledger's current statistics
fn initial_state(ledger: &DetectionLedger, thresholds: &StatusThresholds) -> Mutex<Shared> {
    let stats = match ledger.statistics() {
        Ok(stats) => AggregateStats::derive(stats, thresholds),
        Err(e) => {
            warn!(error = %e, "Failed to load initial statistics from ledger");
            AggregateStats::default()
        }
    };

    Mutex::new(Shared {
        state: MonitorState::Stopped,
        stats,
        position: 0,
        generation: 0,
        worker: None,
    })
}
