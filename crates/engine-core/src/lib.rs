//! Core engine for the autonomous quality-management control plane.
//!
//! This crate provides the trace-ingestion and evaluation pipeline, the
//! threshold monitor, the improvement-cycle orchestrator, and the durable
//! audit log, composed into a [`QualityEngine`] of cancellable task loops.

use common::{Error, Result};
use engine_config::EngineConfig;
use observability::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod abtest;
pub mod audit;
pub mod batch;
pub mod cooldown;
pub mod delta;
pub mod evaluator;
pub mod feedback;
pub mod ingest;
pub mod meta;
pub mod monitor;
pub mod orchestrator;
pub mod patterns;
pub mod predict;
pub mod trends;

use abtest::{AbTestResult, AbTestRunner, Experiment};
use audit::{AuditLog, AuditStore, AuditSummary, ChangeRecord, FileStore, KvStore, RollbackResult};
use batch::{BatchProcessor, PipelineCounters, RollingAggregates};
use cooldown::CooldownClock;
use delta::DeltaAnalyzer;
use feedback::FeedbackCollector;
use ingest::{TraceIngestor, TraceQueue};
use meta::MetaLearner;
use monitor::{Alert, ThresholdMonitor, TriggerRequest};
use orchestrator::{admit_manual_trigger, ImprovementOrchestrator, TriggerOutcome};
use patterns::PatternIndex;

/// Interval of the periodic backend health check.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Capacity of the trigger channel between monitor/adapter and orchestrator.
const TRIGGER_BUFFER: usize = 16;

/// Capacity of the exemplar channel between batch processor and indexer.
const EXEMPLAR_BUFFER: usize = 64;

/// The composed engine: every service plus the task loops driving them.
pub struct QualityEngine {
    config: EngineConfig,
    client: Client,
    queue: Arc<TraceQueue>,
    aggregates: RollingAggregates,
    monitor: Arc<ThresholdMonitor>,
    orchestrator: Arc<ImprovementOrchestrator>,
    patterns: Arc<PatternIndex>,
    meta: Arc<MetaLearner>,
    abtest: Arc<AbTestRunner>,
    audit: AuditLog,
    cooldown: Arc<CooldownClock>,
    trigger_tx: mpsc::Sender<TriggerRequest>,
    trigger_rx: Option<mpsc::Receiver<TriggerRequest>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    active: Arc<AtomicBool>,
    started_at: chrono::DateTime<chrono::Utc>,
    tasks: Vec<JoinHandle<()>>,
}

impl QualityEngine {
    /// Build every service from configuration. Nothing runs until
    /// [`start`](Self::start).
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let client = Client::from_config(&config.observability)?;

        let store: Box<dyn AuditStore> = match &config.audit.kv_url {
            Some(url) => Box::new(KvStore::connect(url).await?),
            None => Box::new(FileStore::new(config.audit.path.clone())),
        };
        let audit = AuditLog::open(store, config.audit.mem_size).await?;

        let cooldown = Arc::new(CooldownClock::new(
            Duration::from_secs(config.orchestrator.cooldown_secs),
            Duration::from_secs(config.orchestrator.retry_cooldown_secs),
        ));

        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_BUFFER);
        let monitor = Arc::new(ThresholdMonitor::new(
            config.monitor.clone(),
            cooldown.clone(),
            trigger_tx.clone(),
        ));

        let queue = Arc::new(TraceQueue::new(
            config.pipeline.trace_chan_capacity,
            Duration::from_millis(config.pipeline.backpressure_ms),
        ));
        let aggregates = RollingAggregates::new(config.pipeline.window_size);

        let patterns = Arc::new(PatternIndex::new(client.clone(), config.patterns.clone()));
        let feedback = Arc::new(FeedbackCollector::new(
            client.clone(),
            config.feedback.clone(),
        ));
        let meta = Arc::new(MetaLearner::new());
        let abtest = Arc::new(AbTestRunner::new(client.clone()));

        let delta = DeltaAnalyzer::new(client.clone(), config.delta.clone(), Vec::new());
        let orchestrator = Arc::new(ImprovementOrchestrator::new(
            delta,
            patterns.clone(),
            feedback,
            meta.clone(),
            aggregates.clone(),
            audit.clone(),
            cooldown.clone(),
            config.orchestrator.clone(),
            config.monitor.low,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            client,
            queue,
            aggregates,
            monitor,
            orchestrator,
            patterns,
            meta,
            abtest,
            audit,
            cooldown,
            trigger_tx,
            trigger_rx: Some(trigger_rx),
            shutdown_tx,
            shutdown_rx,
            active: Arc::new(AtomicBool::new(false)),
            started_at: chrono::Utc::now(),
            tasks: Vec::new(),
        })
    }

    /// A cloneable handle for the HTTP adapter.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            aggregates: self.aggregates.clone(),
            audit: self.audit.clone(),
            cooldown: self.cooldown.clone(),
            monitor: self.monitor.clone(),
            queue: self.queue.clone(),
            abtest: self.abtest.clone(),
            trigger_tx: self.trigger_tx.clone(),
            active: self.active.clone(),
            started_at: self.started_at,
            thresholds: self.config.monitor.clone(),
        }
    }

    /// Known strategies with their observed effectiveness.
    pub fn strategies(&self) -> Vec<meta::Strategy> {
        self.meta.strategies()
    }

    /// Spawn all long-running loops.
    pub async fn start(&mut self) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(Error::Validation("engine already started".to_string()));
        }
        info!("starting quality engine");

        let (exemplar_tx, exemplar_rx) = mpsc::channel(EXEMPLAR_BUFFER);

        // Trace ingestion
        let ingestor = TraceIngestor::new(
            self.client.clone(),
            self.queue.clone(),
            self.config.pipeline.clone(),
            Vec::new(),
        );
        let shutdown = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            ingestor.run(shutdown).await;
        }));

        // Batch processing
        let processor = BatchProcessor::new(
            self.queue.clone(),
            self.aggregates.clone(),
            self.monitor.clone(),
            self.config.pipeline.batch_size,
            self.config.patterns.index_threshold,
        )
        .with_exemplar_channel(exemplar_tx);
        let shutdown = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            processor.run(shutdown).await;
        }));

        // Pattern indexing of high-quality exemplars
        let patterns = self.patterns.clone();
        let shutdown = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            exemplar_loop(patterns, exemplar_rx, shutdown).await;
        }));

        // Orchestration
        let trigger_rx = self
            .trigger_rx
            .take()
            .ok_or_else(|| Error::Internal("trigger receiver already taken".to_string()))?;
        let orchestrator = self.orchestrator.clone();
        let shutdown = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            orchestrator.run(trigger_rx, shutdown).await;
        }));

        // Periodic health check
        let client = self.client.clone();
        let audit = self.audit.clone();
        let monitor = self.monitor.clone();
        let shutdown = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            health_loop(client, audit, monitor, shutdown).await;
        }));

        info!("quality engine started ({} loops)", self.tasks.len());
        Ok(())
    }

    /// Signal shutdown and wait for every loop to exit, bounded by the
    /// orchestrator drain deadline plus a small margin.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down quality engine");
        let _ = self.shutdown_tx.send(true);

        let deadline = Duration::from_secs(self.config.orchestrator.drain_deadline_secs + 5);
        for task in self.tasks.drain(..) {
            match tokio::time::timeout(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("engine task ended with panic: {}", e),
                Err(_) => warn!("engine task did not stop within {:?}", deadline),
            }
        }

        info!("quality engine stopped");
        Ok(())
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn aggregates(&self) -> &RollingAggregates {
        &self.aggregates
    }
}

async fn exemplar_loop(
    patterns: Arc<PatternIndex>,
    mut rx: mpsc::Receiver<evaluator::QualityMetric>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            metric = rx.recv() => {
                match metric {
                    Some(metric) => {
                        if let Err(e) = patterns.maybe_index(&metric).await {
                            warn!("exemplar indexing failed for {}: {}", metric.run_id, e);
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

/// Periodic backend liveness probe. Also propagates audit degradation to
/// the monitor so no further cycles are requested while read-only.
async fn health_loop(
    client: Client,
    audit: AuditLog,
    monitor: Arc<ThresholdMonitor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                if audit.is_degraded() && monitor.is_armed() {
                    warn!("audit log degraded, disarming improvement triggers");
                    monitor.set_armed(false);
                }
                match client.get_workspace_stats().await {
                    Ok(stats) => debug!(
                        "backend healthy: {} sessions, {} runs",
                        stats.tracer_session_count, stats.total_runs
                    ),
                    Err(e) => warn!("backend health check failed: {}", e),
                }
            }
        }
    }
}

/// Cloneable read/control surface consumed by the HTTP adapter.
#[derive(Clone)]
pub struct EngineHandle {
    aggregates: RollingAggregates,
    audit: AuditLog,
    cooldown: Arc<CooldownClock>,
    monitor: Arc<ThresholdMonitor>,
    queue: Arc<TraceQueue>,
    abtest: Arc<AbTestRunner>,
    trigger_tx: mpsc::Sender<TriggerRequest>,
    active: Arc<AtomicBool>,
    started_at: chrono::DateTime<chrono::Utc>,
    thresholds: engine_config::MonitorConfig,
}

/// System overview served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub monitoring_active: bool,
    pub degraded: bool,
    pub current_quality: f64,
    pub thresholds: engine_config::MonitorConfig,
    pub cooldown_remaining_secs: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub traces_dropped: u64,
    pub counters: PipelineCounters,
    pub recent_alerts: Vec<Alert>,
    pub uptime_secs: i64,
}

impl EngineHandle {
    pub async fn status(&self) -> EngineStatus {
        let snapshot = self.aggregates.snapshot();
        EngineStatus {
            monitoring_active: self.active.load(Ordering::Relaxed),
            degraded: self.audit.is_degraded(),
            current_quality: snapshot.avg_quality,
            thresholds: self.thresholds.clone(),
            cooldown_remaining_secs: self.cooldown.remaining().as_secs(),
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            traces_dropped: self.queue.dropped(),
            counters: snapshot.counters,
            recent_alerts: self.monitor.recent_alerts(10),
            uptime_secs: (chrono::Utc::now() - self.started_at).num_seconds(),
        }
    }

    /// Recent change records plus the full-history summary.
    pub async fn history(&self, limit: usize) -> (Vec<ChangeRecord>, AuditSummary) {
        let recent = self.audit.recent(limit).await;
        let summary = self.audit.summary().await;
        (recent, summary)
    }

    /// The rolling overall quality (EMA).
    pub fn current_quality(&self) -> f64 {
        self.aggregates.current_quality()
    }

    /// Trend report over the retained metrics and daily series.
    pub fn trends(&self) -> trends::TrendReport {
        let snapshot = self.aggregates.snapshot();
        let metrics = self.aggregates.recent_metrics();
        trends::report(&metrics, &snapshot.daily, self.thresholds.low)
    }

    /// Running A/B experiments.
    pub fn ab_experiments(&self) -> Vec<Experiment> {
        self.abtest.experiments()
    }

    /// Create an A/B experiment over two prompt variants.
    pub async fn create_ab_experiment(
        &self,
        name: &str,
        variant_a: serde_json::Value,
        variant_b: serde_json::Value,
        traffic_split: f64,
    ) -> Result<Experiment> {
        self.abtest
            .create_experiment(name, variant_a, variant_b, traffic_split)
            .await
    }

    /// Record one observed result for an experiment arm.
    pub async fn record_ab_result(
        &self,
        experiment_id: &str,
        variant: &str,
        quality_score: f64,
    ) -> Result<()> {
        self.abtest
            .record_result(experiment_id, variant, quality_score)
            .await
    }

    /// Evaluate an experiment's collected results.
    pub async fn evaluate_ab_experiment(&self, experiment_id: &str) -> Result<AbTestResult> {
        self.abtest.evaluate(experiment_id).await
    }

    /// Enqueue a manual optimization trigger.
    pub fn trigger(&self, reason: &str, override_cooldown: bool) -> Result<TriggerOutcome> {
        if self.audit.is_degraded() {
            return Err(Error::Degraded(
                "audit log is read-only, triggers refused".to_string(),
            ));
        }
        admit_manual_trigger(&self.cooldown, &self.trigger_tx, reason, override_cooldown)
    }

    pub async fn rollback(&self, target_cycle_id: Option<String>) -> Result<RollbackResult> {
        self.audit.rollback(target_cycle_id).await
    }

    pub async fn clear_history(&self) -> Result<usize> {
        self.audit.clear_history().await
    }

    pub fn cooldown_remaining(&self) -> Duration {
        self.cooldown.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.observability.api_key = "test-key".to_string();
        config.observability.organization_id = "test-org".to_string();
        config.observability.base_url = "http://127.0.0.1:1".to_string();
        config.observability.max_retries = 0;
        config.audit.path = dir.path().join("history.json");
        config
    }

    #[tokio::test]
    async fn test_engine_starts_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = QualityEngine::new(test_config(&dir)).await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.handle().status().await.monitoring_active);

        engine.shutdown().await.unwrap();
        assert!(!engine.handle().status().await.monitoring_active);
    }

    #[tokio::test]
    async fn test_engine_rejects_double_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = QualityEngine::new(test_config(&dir)).await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reflects_quality_and_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let engine = QualityEngine::new(test_config(&dir)).await.unwrap();
        let handle = engine.handle();

        let status = handle.status().await;
        assert_eq!(status.current_quality, 0.0);
        assert_eq!(status.cooldown_remaining_secs, 0);
        assert!(!status.degraded);
        assert_eq!(status.queue_capacity, 200);
    }

    #[tokio::test]
    async fn test_handle_trigger_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let engine = QualityEngine::new(test_config(&dir)).await.unwrap();
        let handle = engine.handle();

        let outcome = handle.trigger("operator request", false).unwrap();
        assert!(outcome.success);

        let (recent, summary) = handle.history(10).await;
        assert!(recent.is_empty());
        assert_eq!(summary.total, 0);
    }
}
