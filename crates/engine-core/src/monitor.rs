//! Multi-tier quality threshold monitoring.
//!
//! Classifies the rolling quality into tiers, emits alerts, and dispatches
//! improvement-cycle triggers through the shared cooldown gate. A quality
//! of exactly 0.0 means "no data yet or all errors" and is deliberately
//! silent to avoid cold-start alert storms.

use crate::batch::AggregatesSnapshot;
use crate::cooldown::CooldownClock;
use chrono::{DateTime, Utc};
use engine_config::MonitorConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Alert severity tiers, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlertLevel::Minimal => "minimal",
            AlertLevel::Low => "low",
            AlertLevel::Medium => "medium",
            AlertLevel::High => "high",
            AlertLevel::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

/// A quality alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub threshold_crossed: f64,
    pub observed: f64,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

/// A request for the orchestrator to run an improvement cycle.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub reason: String,
    pub manual: bool,
    pub override_cooldown: bool,
}

/// How many recent alerts are kept for the status endpoint.
const ALERT_HISTORY: usize = 100;

pub struct ThresholdMonitor {
    config: MonitorConfig,
    cooldown: Arc<CooldownClock>,
    trigger_tx: mpsc::Sender<TriggerRequest>,
    armed: AtomicBool,
    alerts: parking_lot::Mutex<VecDeque<Alert>>,
    last_liveness: parking_lot::Mutex<Option<Instant>>,
}

impl ThresholdMonitor {
    pub fn new(
        config: MonitorConfig,
        cooldown: Arc<CooldownClock>,
        trigger_tx: mpsc::Sender<TriggerRequest>,
    ) -> Self {
        Self {
            config,
            cooldown,
            trigger_tx,
            armed: AtomicBool::new(true),
            alerts: parking_lot::Mutex::new(VecDeque::new()),
            last_liveness: parking_lot::Mutex::new(None),
        }
    }

    /// Disarm trigger dispatch (alerts still emitted). Used when the audit
    /// log degrades to read-only.
    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::Relaxed);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Relaxed)
    }

    /// Classify a quality score into its alert tier.
    pub fn classify(&self, quality: f64) -> AlertLevel {
        if quality < self.config.critical {
            AlertLevel::Critical
        } else if quality < self.config.high {
            AlertLevel::High
        } else if quality < self.config.medium {
            AlertLevel::Medium
        } else if quality < self.config.low {
            AlertLevel::Low
        } else {
            AlertLevel::Minimal
        }
    }

    /// The threshold whose crossing defines the given tier.
    fn threshold_for(&self, level: AlertLevel) -> f64 {
        match level {
            AlertLevel::Critical => self.config.critical,
            AlertLevel::High => self.config.high,
            AlertLevel::Medium => self.config.medium,
            AlertLevel::Low | AlertLevel::Minimal => self.config.low,
        }
    }

    /// Evaluate the latest aggregate snapshot: emit alerts and, for severe
    /// tiers, request an improvement cycle subject to cooldown.
    pub async fn evaluate(&self, snapshot: &AggregatesSnapshot) {
        let quality = snapshot.avg_quality;

        // Cold-start gate: no data (or all errors) must not storm alerts.
        if quality == 0.0 {
            debug!("quality 0.0 (no data yet), suppressing alerts");
            return;
        }

        let level = self.classify(quality);
        match level {
            AlertLevel::Critical | AlertLevel::High => {
                self.emit(level, quality, snapshot);
                if !self.is_armed() {
                    debug!("monitor disarmed, not requesting improvement cycle");
                } else if self.cooldown.ready() {
                    let reason = format!("tier={} observed={:.3}", level, quality);
                    if self
                        .trigger_tx
                        .send(TriggerRequest {
                            reason: reason.clone(),
                            manual: false,
                            override_cooldown: false,
                        })
                        .await
                        .is_ok()
                    {
                        info!("requested improvement cycle: {}", reason);
                    }
                } else {
                    debug!(
                        "cooldown active ({:?} remaining), not requesting cycle",
                        self.cooldown.remaining()
                    );
                }
            }
            AlertLevel::Medium | AlertLevel::Low => {
                self.emit(level, quality, snapshot);
            }
            AlertLevel::Minimal => {
                let due = {
                    let mut last = self.last_liveness.lock();
                    let gap = Duration::from_secs(self.config.liveness_interval_secs);
                    match *last {
                        Some(at) if at.elapsed() < gap => false,
                        _ => {
                            *last = Some(Instant::now());
                            true
                        }
                    }
                };
                if due {
                    self.emit(AlertLevel::Minimal, quality, snapshot);
                }
            }
        }
    }

    fn emit(&self, level: AlertLevel, observed: f64, snapshot: &AggregatesSnapshot) {
        let threshold = self.threshold_for(level);
        let message = match level {
            AlertLevel::Minimal => format!("quality healthy at {:.3}", observed),
            _ => format!(
                "quality {:.3} below {} threshold {:.2}",
                observed, level, threshold
            ),
        };

        let mut metadata = Map::new();
        metadata.insert(
            "traces_processed".to_string(),
            json!(snapshot.counters.traces_processed),
        );
        metadata.insert("models".to_string(), json!(snapshot.per_model.len()));

        let alert = Alert {
            level,
            threshold_crossed: threshold,
            observed,
            message: message.clone(),
            emitted_at: Utc::now(),
            metadata,
        };

        match level {
            AlertLevel::Critical | AlertLevel::High => warn!("{}", message),
            _ => info!("{}", message),
        }

        let mut alerts = self.alerts.lock();
        if alerts.len() == ALERT_HISTORY {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }

    /// Recent alerts, newest last.
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let alerts = self.alerts.lock();
        alerts
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    pub fn thresholds(&self) -> &MonitorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(quality: f64) -> AggregatesSnapshot {
        AggregatesSnapshot {
            avg_quality: quality,
            ..Default::default()
        }
    }

    fn monitor_with_rx(
        cooldown: Arc<CooldownClock>,
    ) -> (ThresholdMonitor, mpsc::Receiver<TriggerRequest>) {
        let (tx, rx) = mpsc::channel(8);
        (
            ThresholdMonitor::new(MonitorConfig::default(), cooldown, tx),
            rx,
        )
    }

    fn ready_clock() -> Arc<CooldownClock> {
        Arc::new(CooldownClock::new(
            Duration::from_secs(3600),
            Duration::from_secs(300),
        ))
    }

    #[test]
    fn test_tier_classification() {
        let (monitor, _rx) = monitor_with_rx(ready_clock());
        assert_eq!(monitor.classify(0.60), AlertLevel::Critical);
        assert_eq!(monitor.classify(0.70), AlertLevel::High);
        assert_eq!(monitor.classify(0.80), AlertLevel::Medium);
        assert_eq!(monitor.classify(0.85), AlertLevel::Low);
        assert_eq!(monitor.classify(0.90), AlertLevel::Minimal);
        assert_eq!(monitor.classify(0.99), AlertLevel::Minimal);
    }

    #[tokio::test]
    async fn test_high_tier_requests_cycle() {
        let (monitor, mut rx) = monitor_with_rx(ready_clock());
        monitor.evaluate(&snapshot(0.75)).await;

        let request = rx.try_recv().unwrap();
        assert!(!request.manual);
        assert!(request.reason.contains("tier=high"));
        assert!(request.reason.contains("0.750"));
    }

    #[tokio::test]
    async fn test_medium_tier_alerts_without_trigger() {
        let (monitor, mut rx) = monitor_with_rx(ready_clock());
        monitor.evaluate(&snapshot(0.82)).await;

        assert!(rx.try_recv().is_err());
        let alerts = monitor.recent_alerts(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Medium);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_trigger() {
        let clock = ready_clock();
        clock.mark_cycle(true);
        let (monitor, mut rx) = monitor_with_rx(clock);

        monitor.evaluate(&snapshot(0.65)).await;
        // Alert emitted, trigger suppressed
        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.recent_alerts(10).len(), 1);
    }

    #[tokio::test]
    async fn test_zero_quality_is_silent() {
        let (monitor, mut rx) = monitor_with_rx(ready_clock());
        monitor.evaluate(&snapshot(0.0)).await;

        assert!(rx.try_recv().is_err());
        assert!(monitor.recent_alerts(10).is_empty());
    }

    #[tokio::test]
    async fn test_disarmed_monitor_still_alerts() {
        let (monitor, mut rx) = monitor_with_rx(ready_clock());
        monitor.set_armed(false);
        monitor.evaluate(&snapshot(0.50)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.recent_alerts(10).len(), 1);
        assert_eq!(monitor.recent_alerts(10)[0].level, AlertLevel::Critical);
    }

    #[tokio::test]
    async fn test_liveness_alert_rate_limited() {
        let (monitor, _rx) = monitor_with_rx(ready_clock());
        monitor.evaluate(&snapshot(0.95)).await;
        monitor.evaluate(&snapshot(0.96)).await;

        // Second healthy evaluation arrives inside the liveness gap
        assert_eq!(monitor.recent_alerts(10).len(), 1);
        assert_eq!(monitor.recent_alerts(10)[0].level, AlertLevel::Minimal);
    }
}
