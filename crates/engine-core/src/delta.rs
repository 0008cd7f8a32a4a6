//! Baseline-versus-current regression detection and attribution.

use crate::evaluator::{QualityEvaluator, QualityMetric};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use engine_config::DeltaConfig;
use observability::{Client, RunFilters};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;
use uuid::Uuid;

/// Result of one baseline/current comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaAnalysis {
    pub analysis_id: String,
    pub baseline_quality: f64,
    pub current_quality: f64,
    pub quality_delta: f64,
    pub regression_detected: bool,
    pub confidence: f64,
    pub affected_models: BTreeSet<String>,
    pub affected_spectrums: BTreeSet<String>,
    pub root_cause: Option<String>,
    pub baseline_window: (DateTime<Utc>, DateTime<Utc>),
    pub current_window: (DateTime<Utc>, DateTime<Utc>),
}

impl DeltaAnalysis {
    fn insufficient(
        baseline_window: (DateTime<Utc>, DateTime<Utc>),
        current_window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Self {
        Self {
            analysis_id: Uuid::new_v4().to_string(),
            baseline_quality: 0.0,
            current_quality: 0.0,
            quality_delta: 0.0,
            regression_detected: false,
            confidence: 0.0,
            affected_models: BTreeSet::new(),
            affected_spectrums: BTreeSet::new(),
            root_cause: Some("insufficient_data".to_string()),
            baseline_window,
            current_window,
        }
    }
}

/// Compares a baseline window against the current window of quality
/// metrics fetched from the backend.
pub struct DeltaAnalyzer {
    client: Client,
    config: DeltaConfig,
    session_names: Vec<String>,
}

impl DeltaAnalyzer {
    pub fn new(client: Client, config: DeltaConfig, session_names: Vec<String>) -> Self {
        Self {
            client,
            config,
            session_names,
        }
    }

    /// Fetch both windows and compare them.
    pub async fn check(&self) -> common::Result<DeltaAnalysis> {
        let now = Utc::now();
        let baseline_window = (
            now - ChronoDuration::days(self.config.baseline_start_days),
            now - ChronoDuration::days(self.config.baseline_end_days),
        );
        let current_window = (now - ChronoDuration::days(self.config.baseline_end_days), now);

        let (baseline, current) = futures::future::try_join(
            self.fetch_window(baseline_window),
            self.fetch_window(current_window),
        )
        .await?;

        debug!(
            "delta windows fetched: baseline={} current={}",
            baseline.len(),
            current.len()
        );

        Ok(self.compare(&baseline, &current, baseline_window, current_window))
    }

    async fn fetch_window(
        &self,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> common::Result<Vec<QualityMetric>> {
        let filters = RunFilters {
            session_names: self.session_names.clone(),
            start_time: Some(window.0),
            end_time: Some(window.1),
            limit: Some(500),
            include_feedback: true,
        };
        let runs = self.client.list_runs(&filters).await?;
        // Backends have been observed to ignore time filters on some
        // endpoints; keep only runs that actually fall inside the window.
        Ok(runs
            .iter()
            .filter(|run| {
                run.start_time
                    .map(|t| t >= window.0 && t < window.1)
                    .unwrap_or(false)
            })
            .map(QualityEvaluator::evaluate)
            .collect())
    }

    /// Pure comparison over two windows of metrics.
    pub fn compare(
        &self,
        baseline: &[QualityMetric],
        current: &[QualityMetric],
        baseline_window: (DateTime<Utc>, DateTime<Utc>),
        current_window: (DateTime<Utc>, DateTime<Utc>),
    ) -> DeltaAnalysis {
        if baseline.is_empty() || current.is_empty() {
            return DeltaAnalysis::insufficient(baseline_window, current_window);
        }

        let baseline_quality = mean_quality(baseline);
        let current_quality = mean_quality(current);
        let quality_delta = current_quality - baseline_quality;
        let regression_detected = quality_delta < -self.config.regression_threshold;

        let affected_models =
            self.affected_groups(baseline, current, |metric| metric.model.clone());
        let affected_spectrums =
            self.affected_groups(baseline, current, |metric| metric.spectrum.clone());

        let root_cause = identify_root_cause(&affected_models, &affected_spectrums);

        let confidence = ((baseline.len() as f64 / 10.0).min(1.0)
            + (current.len() as f64 / 10.0).min(1.0))
            / 2.0;

        DeltaAnalysis {
            analysis_id: Uuid::new_v4().to_string(),
            baseline_quality,
            current_quality,
            quality_delta,
            regression_detected,
            confidence,
            affected_models,
            affected_spectrums,
            root_cause,
            baseline_window,
            current_window,
        }
    }

    /// Groups present in both windows whose mean moved by more than the
    /// group threshold in either direction.
    fn affected_groups<F>(
        &self,
        baseline: &[QualityMetric],
        current: &[QualityMetric],
        key: F,
    ) -> BTreeSet<String>
    where
        F: Fn(&QualityMetric) -> String,
    {
        let baseline_means = group_means(baseline, &key);
        let current_means = group_means(current, &key);

        baseline_means
            .iter()
            .filter_map(|(group, baseline_mean)| {
                let current_mean = current_means.get(group)?;
                if (current_mean - baseline_mean).abs() > self.config.group_threshold {
                    Some(group.clone())
                } else {
                    None
                }
            })
            .collect()
    }
}

fn mean_quality(metrics: &[QualityMetric]) -> f64 {
    metrics.iter().map(|m| m.quality_score).sum::<f64>() / metrics.len() as f64
}

fn group_means<F>(metrics: &[QualityMetric], key: &F) -> HashMap<String, f64>
where
    F: Fn(&QualityMetric) -> String,
{
    let mut sums: HashMap<String, (f64, u64)> = HashMap::new();
    for metric in metrics {
        let entry = sums.entry(key(metric)).or_insert((0.0, 0));
        entry.0 += metric.quality_score;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(group, (sum, count))| (group, sum / count.max(1) as f64))
        .collect()
}

fn identify_root_cause(
    models: &BTreeSet<String>,
    spectrums: &BTreeSet<String>,
) -> Option<String> {
    if models.is_empty() && spectrums.is_empty() {
        return None;
    }
    let joined_models = models.iter().cloned().collect::<Vec<_>>().join(", ");
    let joined_spectrums = spectrums.iter().cloned().collect::<Vec<_>>().join(", ");

    Some(if models.len() > spectrums.len() {
        format!("Model-specific issue affecting {}", joined_models)
    } else if spectrums.len() > models.len() {
        format!("Spectrum-specific issue affecting {}", joined_spectrums)
    } else {
        "System-wide performance degradation".to_string()
    })
}
