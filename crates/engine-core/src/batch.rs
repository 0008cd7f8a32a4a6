//! Batch processing of queued traces into rolling quality aggregates.
//!
//! The processor is the only writer of the aggregates; monitors, analyzers,
//! and the predictor read brief snapshot copies. The mutex is held only for
//! in-memory bookkeeping, never across an await point.

use crate::evaluator::{QualityEvaluator, QualityMetric};
use crate::ingest::TraceQueue;
use crate::monitor::ThresholdMonitor;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Smoothing factor for the overall quality EMA, applied per batch.
const EMA_ALPHA: f64 = 0.2;

/// Days of per-day aggregates retained for trend analysis.
const DAILY_RETENTION_DAYS: i64 = 30;

/// Hours of individual metrics retained in memory.
const METRIC_RETENTION_HOURS: i64 = 24;

/// Fixed-size window of recent quality scores.
#[derive(Debug, Clone)]
struct RingWindow {
    scores: VecDeque<f64>,
    capacity: usize,
}

impl RingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            scores: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, score: f64) {
        if self.scores.len() == self.capacity {
            self.scores.pop_front();
        }
        self.scores.push_back(score);
    }

    fn mean(&self) -> f64 {
        if self.scores.is_empty() {
            0.0
        } else {
            self.scores.iter().sum::<f64>() / self.scores.len() as f64
        }
    }
}

/// Pipeline counters, exposed on the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineCounters {
    pub traces_processed: u64,
    pub quality_checks: u64,
    pub optimizations_triggered: u64,
    pub improvements_deployed: u64,
    pub shape_errors: u64,
}

#[derive(Debug)]
struct AggregateState {
    ema_quality: f64,
    ema_primed: bool,
    per_model: HashMap<String, RingWindow>,
    per_provider: HashMap<String, RingWindow>,
    per_day: BTreeMap<NaiveDate, (f64, u64)>,
    recent_metrics: VecDeque<(DateTime<Utc>, QualityMetric)>,
    counters: PipelineCounters,
    window_size: usize,
}

/// Read-only copy of the aggregate state at one instant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatesSnapshot {
    pub avg_quality: f64,
    pub per_model: HashMap<String, f64>,
    pub per_provider: HashMap<String, f64>,
    /// Daily mean quality, oldest first
    pub daily: Vec<(NaiveDate, f64)>,
    pub counters: PipelineCounters,
}

/// Shared handle over the rolling aggregates.
#[derive(Clone)]
pub struct RollingAggregates {
    state: Arc<parking_lot::Mutex<AggregateState>>,
}

impl RollingAggregates {
    pub fn new(window_size: usize) -> Self {
        Self {
            state: Arc::new(parking_lot::Mutex::new(AggregateState {
                ema_quality: 0.0,
                ema_primed: false,
                per_model: HashMap::new(),
                per_provider: HashMap::new(),
                per_day: BTreeMap::new(),
                recent_metrics: VecDeque::new(),
                counters: PipelineCounters::default(),
                window_size,
            })),
        }
    }

    /// Fold one batch of metrics into the aggregates.
    pub fn record_batch(&self, metrics: &[QualityMetric]) {
        if metrics.is_empty() {
            return;
        }
        let batch_mean =
            metrics.iter().map(|m| m.quality_score).sum::<f64>() / metrics.len() as f64;
        let now = Utc::now();

        let mut state = self.state.lock();
        if state.ema_primed {
            state.ema_quality = EMA_ALPHA * batch_mean + (1.0 - EMA_ALPHA) * state.ema_quality;
        } else {
            state.ema_quality = batch_mean;
            state.ema_primed = true;
        }

        let window_size = state.window_size;
        for metric in metrics {
            state
                .per_model
                .entry(metric.model.clone())
                .or_insert_with(|| RingWindow::new(window_size))
                .push(metric.quality_score);
            state
                .per_provider
                .entry(metric.provider.clone())
                .or_insert_with(|| RingWindow::new(window_size))
                .push(metric.quality_score);

            let day = metric
                .timestamp
                .parse::<DateTime<Utc>>()
                .map(|t| t.date_naive())
                .unwrap_or_else(|_| now.date_naive());
            let entry = state.per_day.entry(day).or_insert((0.0, 0));
            entry.0 += metric.quality_score;
            entry.1 += 1;

            state.recent_metrics.push_back((now, metric.clone()));
        }

        state.counters.traces_processed += metrics.len() as u64;
        state.counters.quality_checks += 1;

        // Prune expired windows
        let day_cutoff = (now - ChronoDuration::days(DAILY_RETENTION_DAYS)).date_naive();
        state.per_day.retain(|day, _| *day >= day_cutoff);
        let metric_cutoff = now - ChronoDuration::hours(METRIC_RETENTION_HOURS);
        while let Some((seen, _)) = state.recent_metrics.front() {
            if *seen < metric_cutoff {
                state.recent_metrics.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_shape_error(&self) {
        self.state.lock().counters.shape_errors += 1;
    }

    pub fn record_optimization_triggered(&self) {
        self.state.lock().counters.optimizations_triggered += 1;
    }

    pub fn record_improvements_deployed(&self, count: u64) {
        self.state.lock().counters.improvements_deployed += count;
    }

    /// Current overall quality (EMA); 0.0 until the first batch arrives.
    pub fn current_quality(&self) -> f64 {
        self.state.lock().ema_quality
    }

    /// Brief copy of the aggregate state.
    pub fn snapshot(&self) -> AggregatesSnapshot {
        let state = self.state.lock();
        AggregatesSnapshot {
            avg_quality: state.ema_quality,
            per_model: state
                .per_model
                .iter()
                .map(|(model, window)| (model.clone(), window.mean()))
                .collect(),
            per_provider: state
                .per_provider
                .iter()
                .map(|(provider, window)| (provider.clone(), window.mean()))
                .collect(),
            daily: state
                .per_day
                .iter()
                .map(|(day, (sum, count))| (*day, sum / (*count).max(1) as f64))
                .collect(),
            counters: state.counters.clone(),
        }
    }

    /// Metrics observed within the retention window, newest last.
    pub fn recent_metrics(&self) -> Vec<QualityMetric> {
        self.state
            .lock()
            .recent_metrics
            .iter()
            .map(|(_, metric)| metric.clone())
            .collect()
    }
}

/// Drains the trace queue in bounded batches and feeds the monitor.
pub struct BatchProcessor {
    queue: Arc<TraceQueue>,
    aggregates: RollingAggregates,
    monitor: Arc<ThresholdMonitor>,
    batch_size: usize,
    index_threshold: f64,
    exemplar_tx: Option<tokio::sync::mpsc::Sender<QualityMetric>>,
}

impl BatchProcessor {
    pub fn new(
        queue: Arc<TraceQueue>,
        aggregates: RollingAggregates,
        monitor: Arc<ThresholdMonitor>,
        batch_size: usize,
        index_threshold: f64,
    ) -> Self {
        Self {
            queue,
            aggregates,
            monitor,
            batch_size,
            index_threshold,
            exemplar_tx: None,
        }
    }

    /// Route high-quality metrics to the pattern indexer.
    pub fn with_exemplar_channel(mut self, tx: tokio::sync::mpsc::Sender<QualityMetric>) -> Self {
        self.exemplar_tx = Some(tx);
        self
    }

    /// The processing loop: block for the first trace, then drain the rest
    /// of the batch without waiting.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("batch processor shutting down");
                        return;
                    }
                }
                first = self.queue.pop() => {
                    let mut batch = vec![first];
                    batch.extend(self.queue.drain(self.batch_size - 1));
                    self.process_batch(batch).await;
                }
            }
        }
    }

    /// Evaluate a batch in arrival order, update aggregates, and hand the
    /// result to the threshold monitor.
    pub async fn process_batch(&self, batch: Vec<observability::RawRun>) {
        let mut metrics = Vec::with_capacity(batch.len());
        for run in &batch {
            if run.id.is_empty() {
                // A run without an id cannot be attributed; skip and count.
                self.aggregates.record_shape_error();
                warn!("skipping trace without id");
                continue;
            }
            metrics.push(QualityEvaluator::evaluate(run));
        }

        if metrics.is_empty() {
            return;
        }

        self.aggregates.record_batch(&metrics);

        if let Some(tx) = &self.exemplar_tx {
            for metric in &metrics {
                if metric.quality_score >= self.index_threshold {
                    if tx.try_send(metric.clone()).is_err() {
                        debug!("exemplar channel full, skipping {}", metric.run_id);
                    }
                }
            }
        }

        let snapshot = self.aggregates.snapshot();
        self.monitor.evaluate(&snapshot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(model: &str, provider: &str, score: f64) -> QualityMetric {
        QualityMetric {
            run_id: format!("run-{}", uuid::Uuid::new_v4()),
            session_name: "test".to_string(),
            model: model.to_string(),
            provider: provider.to_string(),
            quality_score: score,
            latency_ms: 100,
            token_count: 10,
            cost: 0.0,
            timestamp: Utc::now().to_rfc3339(),
            spectrum: "general".to_string(),
        }
    }

    #[test]
    fn test_first_batch_primes_ema() {
        let aggregates = RollingAggregates::new(500);
        aggregates.record_batch(&[metric("m", "p", 0.8), metric("m", "p", 0.6)]);
        assert!((aggregates.current_quality() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_ema_smooths_subsequent_batches() {
        let aggregates = RollingAggregates::new(500);
        aggregates.record_batch(&[metric("m", "p", 1.0)]);
        aggregates.record_batch(&[metric("m", "p", 0.0)]);
        // 0.2 * 0.0 + 0.8 * 1.0
        assert!((aggregates.current_quality() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_per_model_and_provider_means() {
        let aggregates = RollingAggregates::new(500);
        aggregates.record_batch(&[
            metric("gpt-4o", "openai", 0.9),
            metric("gpt-4o", "openai", 0.7),
            metric("claude-3", "anthropic", 0.5),
        ]);
        let snapshot = aggregates.snapshot();
        assert!((snapshot.per_model["gpt-4o"] - 0.8).abs() < 1e-9);
        assert!((snapshot.per_model["claude-3"] - 0.5).abs() < 1e-9);
        assert!((snapshot.per_provider["openai"] - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_ring_window_evicts_oldest() {
        let mut window = RingWindow::new(3);
        for score in [0.0, 0.0, 0.0, 1.0, 1.0, 1.0] {
            window.push(score);
        }
        assert_eq!(window.mean(), 1.0);
        assert_eq!(window.scores.len(), 3);
    }

    #[test]
    fn test_daily_series_accumulates() {
        let aggregates = RollingAggregates::new(500);
        let mut a = metric("m", "p", 0.8);
        let mut b = metric("m", "p", 0.6);
        let today = Utc::now().to_rfc3339();
        a.timestamp = today.clone();
        b.timestamp = today;
        aggregates.record_batch(&[a, b]);

        let snapshot = aggregates.snapshot();
        assert_eq!(snapshot.daily.len(), 1);
        assert!((snapshot.daily[0].1 - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_counters_track_batches() {
        let aggregates = RollingAggregates::new(500);
        aggregates.record_batch(&[metric("m", "p", 0.8)]);
        aggregates.record_batch(&[metric("m", "p", 0.9)]);
        aggregates.record_shape_error();
        let counters = aggregates.snapshot().counters;
        assert_eq!(counters.traces_processed, 2);
        assert_eq!(counters.quality_checks, 2);
        assert_eq!(counters.shape_errors, 1);
    }
}
