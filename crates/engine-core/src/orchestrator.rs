//! Improvement-cycle orchestration.
//!
//! On trigger, runs a single cycle composing delta analysis, pattern
//! lookup, meta-learning, feedback review, and forecasting, then commits
//! one `ChangeRecord`. At most one cycle runs at a time; a trigger that
//! arrives mid-cycle is coalesced. Every step is failure-isolated: a step
//! that errors is recorded in the cycle metadata and the remaining steps
//! still run.

use crate::audit::{AuditLog, ChangeRecord, ChangeType, Improvement, Severity};
use crate::batch::RollingAggregates;
use crate::cooldown::CooldownClock;
use crate::delta::DeltaAnalyzer;
use crate::feedback::FeedbackCollector;
use crate::meta::{MetaLearner, StrategyContext};
use crate::monitor::TriggerRequest;
use crate::patterns::{PatternIndex, PatternQuery};
use crate::predict::Predictor;
use common::{CycleId, Error, Result};
use engine_config::OrchestratorConfig;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Severity cutoff: regressions deeper than this are high severity.
const HIGH_SEVERITY_DELTA: f64 = 0.10;

pub struct ImprovementOrchestrator {
    delta: DeltaAnalyzer,
    patterns: Arc<PatternIndex>,
    feedback: Arc<FeedbackCollector>,
    meta: Arc<MetaLearner>,
    aggregates: RollingAggregates,
    audit: AuditLog,
    cooldown: Arc<CooldownClock>,
    config: OrchestratorConfig,
    /// Quality target used by the forecast intervention flag
    target_quality: f64,
    cycle_lock: Mutex<()>,
}

impl ImprovementOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        delta: DeltaAnalyzer,
        patterns: Arc<PatternIndex>,
        feedback: Arc<FeedbackCollector>,
        meta: Arc<MetaLearner>,
        aggregates: RollingAggregates,
        audit: AuditLog,
        cooldown: Arc<CooldownClock>,
        config: OrchestratorConfig,
        target_quality: f64,
    ) -> Self {
        Self {
            delta,
            patterns,
            feedback,
            meta,
            aggregates,
            audit,
            cooldown,
            config,
            target_quality,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Whether a cycle is currently in flight.
    pub fn cycle_in_progress(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    /// The trigger-consuming loop. On shutdown, drains any in-flight cycle
    /// up to the configured deadline.
    pub async fn run(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<TriggerRequest>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let deadline = Duration::from_secs(self.config.drain_deadline_secs);
                        if tokio::time::timeout(deadline, self.cycle_lock.lock()).await.is_err() {
                            warn!("in-flight cycle did not drain within {:?}", deadline);
                        }
                        debug!("orchestrator shutting down");
                        return;
                    }
                }
                request = trigger_rx.recv() => {
                    match request {
                        Some(request) => self.handle_trigger(request).await,
                        None => return,
                    }
                }
            }
        }
    }

    /// Admit or reject one trigger, then run the cycle single-flight.
    pub async fn handle_trigger(&self, request: TriggerRequest) {
        if self.audit.is_degraded() {
            warn!("audit log degraded, refusing trigger: {}", request.reason);
            return;
        }

        if !self.cooldown.ready() {
            if request.manual && request.override_cooldown {
                // The bypass itself is an audited change.
                let mut record =
                    ChangeRecord::new(ChangeType::ManualTrigger, request.reason.clone());
                record
                    .metadata
                    .insert("cooldown_overridden".to_string(), json!(true));
                record.metadata.insert(
                    "cooldown_remaining_secs".to_string(),
                    json!(self.cooldown.remaining().as_secs()),
                );
                if let Err(e) = self.audit.append(record).await {
                    error!("failed to audit cooldown override: {}", e);
                    return;
                }
                info!("cooldown overridden by manual trigger: {}", request.reason);
            } else {
                debug!(
                    "cooldown active ({:?} remaining), dropping trigger: {}",
                    self.cooldown.remaining(),
                    request.reason
                );
                return;
            }
        }

        let Ok(_guard) = self.cycle_lock.try_lock() else {
            info!("cycle already in progress, trigger coalesced: {}", request.reason);
            return;
        };

        self.aggregates.record_optimization_triggered();
        match self.run_cycle(&request.reason).await {
            Ok(record) => {
                self.cooldown
                    .mark_cycle(record.change_type == ChangeType::OptimizationCycle);
                self.aggregates
                    .record_improvements_deployed(record.improvements_identified.len() as u64);
                info!(
                    "cycle {} committed: {} improvements, success={}",
                    record.cycle_id,
                    record.improvements_identified.len(),
                    record.success
                );
            }
            Err(e) => {
                // The cycle could not even be recorded; keep the short
                // cooldown so a retry is possible soon.
                self.cooldown.mark_cycle(false);
                error!("improvement cycle failed to commit: {}", e);
            }
        }
    }

    /// One end-to-end improvement cycle.
    async fn run_cycle(&self, reason: &str) -> Result<ChangeRecord> {
        let cycle_id = CycleId::new();
        let started = std::time::Instant::now();
        info!("starting improvement cycle {} ({})", cycle_id, reason);

        let current_quality = self.aggregates.current_quality();
        let mut components_executed: Vec<String> = Vec::new();
        let mut improvements: Vec<Improvement> = Vec::new();
        let mut errors: Map<String, Value> = Map::new();
        let mut learning_applied = false;

        // 1. Delta / regression analysis
        let delta = match self.delta.check().await {
            Ok(delta) => {
                components_executed.push("delta_analysis".to_string());
                Some(delta)
            }
            Err(e) => {
                warn!("delta analysis failed: {}", e);
                errors.insert("delta_analysis".to_string(), json!(e.to_string()));
                None
            }
        };

        if let Some(delta) = &delta {
            if delta.regression_detected {
                let severity = if delta.quality_delta.abs() > HIGH_SEVERITY_DELTA {
                    Severity::High
                } else {
                    Severity::Medium
                };
                improvements.push(Improvement {
                    kind: "regression_detected".to_string(),
                    component: "inference_pipeline".to_string(),
                    severity: Some(severity),
                    before: Some(json!(delta.baseline_quality)),
                    after: Some(json!(delta.current_quality)),
                    reason: delta.root_cause.clone(),
                    impact: Some(format!(
                        "quality delta {:+.3} across {} models, {} spectrums",
                        delta.quality_delta,
                        delta.affected_models.len(),
                        delta.affected_spectrums.len()
                    )),
                });
            }
        }

        let context = StrategyContext {
            model: delta
                .as_ref()
                .and_then(|d| d.affected_models.iter().next().cloned()),
            spectrum: delta
                .as_ref()
                .and_then(|d| d.affected_spectrums.iter().next().cloned()),
            quality_score: delta
                .as_ref()
                .map(|d| d.current_quality)
                .filter(|q| *q > 0.0)
                .unwrap_or(current_quality),
        };

        // 2. Pattern lookup
        let query = PatternQuery {
            model: context.model.clone(),
            spectrum: context.spectrum.clone(),
            quality_score: context.quality_score,
        };
        match self.patterns.search(&query).await {
            Ok(matches) => {
                components_executed.push("pattern_matching".to_string());
                if !matches.is_empty() {
                    learning_applied = true;
                    debug!("{} similar exemplars found", matches.len());
                }
            }
            Err(e) => {
                warn!("pattern lookup failed: {}", e);
                errors.insert("pattern_matching".to_string(), json!(e.to_string()));
            }
        }

        // 3. Meta-learning strategy selection
        let strategies = self.meta.rank(&context);
        components_executed.push("meta_learning".to_string());
        if !strategies.is_empty() {
            let names: Vec<&str> = strategies.iter().take(2).map(|s| s.name.as_str()).collect();
            improvements.push(Improvement {
                kind: "optimal_strategies_identified".to_string(),
                component: "meta_learner".to_string(),
                severity: Some(Severity::Low),
                before: None,
                after: None,
                reason: Some(names.join(", ")),
                impact: Some(format!(
                    "top strategy effectiveness {:.2}",
                    strategies[0].effectiveness_score
                )),
            });
        }

        // 4. Feedback integration
        match self.feedback.recent().await {
            Ok(corrections) => {
                components_executed.push("feedback_integration".to_string());
                if !corrections.is_empty() {
                    learning_applied = true;
                    debug!("{} recent corrections considered", corrections.len());
                }
            }
            Err(e) => {
                warn!("feedback review failed: {}", e);
                errors.insert("feedback_integration".to_string(), json!(e.to_string()));
            }
        }

        // 5. Predictive quality assessment
        let snapshot = self.aggregates.snapshot();
        let forecast = Predictor::forecast(&snapshot.daily, self.target_quality);
        components_executed.push("quality_prediction".to_string());
        if forecast.needs_intervention {
            improvements.push(Improvement {
                kind: "predicted_degradation".to_string(),
                component: "quality_forecast".to_string(),
                severity: Some(Severity::Medium),
                before: None,
                after: None,
                reason: Some(format!(
                    "7-day projection {:.3} below target {:.2}",
                    forecast.predicted_quality_7d, self.target_quality
                )),
                impact: Some(format!("confidence {:.2}", forecast.confidence)),
            });
        }

        // Commit
        let all_failed = components_executed.is_empty();
        let mut record = if all_failed {
            let mut record = ChangeRecord::new(ChangeType::OptimizationFailure, reason);
            record.success = false;
            record.error = Some(
                errors
                    .iter()
                    .map(|(step, err)| format!("{}: {}", step, err))
                    .collect::<Vec<_>>()
                    .join("; "),
            );
            record
        } else {
            let mut record = ChangeRecord::new(ChangeType::OptimizationCycle, reason);
            record.success = !improvements.is_empty();
            record
        };
        record.cycle_id = cycle_id.0.clone();
        record.quality_score_before = Some(current_quality);
        record.components_executed = components_executed;
        record.improvements_identified = improvements;
        record
            .metadata
            .insert("learning_applied".to_string(), json!(learning_applied));
        record.metadata.insert(
            "cycle_duration_ms".to_string(),
            json!(started.elapsed().as_millis() as u64),
        );
        if !errors.is_empty() {
            record.metadata.insert("errors".to_string(), Value::Object(errors));
        }

        let record = self.audit.append(record).await?;

        // Close the meta-learning loop: the strategies this cycle applied
        // get the cycle's outcome as their observed effectiveness.
        if record.change_type == ChangeType::OptimizationCycle {
            let effectiveness = if record.success {
                (0.5 + 0.1 * record.improvements_identified.len() as f64).min(1.0)
            } else {
                0.0
            };
            for strategy in strategies.iter().take(2) {
                self.meta
                    .record_outcome(&strategy.name, context.clone(), effectiveness);
            }
        }

        Ok(record)
    }
}

/// Outcome returned to the HTTP adapter for a manual trigger request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TriggerOutcome {
    pub success: bool,
    pub reason: String,
}

/// Gate a manual trigger against the cooldown before enqueueing it.
pub fn admit_manual_trigger(
    cooldown: &CooldownClock,
    trigger_tx: &mpsc::Sender<TriggerRequest>,
    reason: &str,
    override_cooldown: bool,
) -> Result<TriggerOutcome> {
    if !cooldown.ready() && !override_cooldown {
        let remaining = cooldown.remaining();
        return Ok(TriggerOutcome {
            success: false,
            reason: format!("Cooldown active, {}s remaining", remaining.as_secs()),
        });
    }

    trigger_tx
        .try_send(TriggerRequest {
            reason: reason.to_string(),
            manual: true,
            override_cooldown,
        })
        .map_err(|_| Error::Internal("trigger queue full or closed".to_string()))?;

    Ok(TriggerOutcome {
        success: true,
        reason: format!("Optimization queued: {}", reason),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_manual_trigger_blocked_by_cooldown() {
        let cooldown = CooldownClock::new(Duration::from_secs(3600), Duration::from_secs(300));
        cooldown.mark_cycle(true);
        let (tx, mut rx) = mpsc::channel(4);

        let outcome = admit_manual_trigger(&cooldown, &tx, "manual retry", false).unwrap();
        assert!(!outcome.success);
        assert!(outcome.reason.starts_with("Cooldown active"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_manual_trigger_override_enqueues() {
        let cooldown = CooldownClock::new(Duration::from_secs(3600), Duration::from_secs(300));
        cooldown.mark_cycle(true);
        let (tx, mut rx) = mpsc::channel(4);

        let outcome = admit_manual_trigger(&cooldown, &tx, "forced", true).unwrap();
        assert!(outcome.success);
        let request = rx.try_recv().unwrap();
        assert!(request.manual);
        assert!(request.override_cooldown);
    }

    #[test]
    fn test_manual_trigger_when_ready() {
        let cooldown = CooldownClock::new(Duration::from_secs(3600), Duration::from_secs(300));
        let (tx, mut rx) = mpsc::channel(4);

        let outcome = admit_manual_trigger(&cooldown, &tx, "routine", false).unwrap();
        assert!(outcome.success);
        assert!(rx.try_recv().is_ok());
    }
}
