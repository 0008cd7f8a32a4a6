//! A/B experiments over prompt variants.
//!
//! Experiments are dataset-backed: the configuration and per-variant
//! results live in a backend dataset, and evaluation runs a Welch-style
//! significance approximation over the collected quality scores. This is
//! the machinery behind the `ab_testing` strategy; cycles identify it,
//! operators drive create/record/evaluate through the HTTP adapter.

use common::{Error, Result};
use dashmap::DashMap;
use observability::{Client, Example};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

/// Per-arm sample size below which no significance is claimed.
const MIN_SAMPLES: usize = 5;

/// p-value below which a result is significant.
const SIGNIFICANCE_LEVEL: f64 = 0.05;

/// A running experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    pub dataset_id: String,
    pub variant_a: Value,
    pub variant_b: Value,
    /// Fraction of traffic routed to variant B
    pub traffic_split: f64,
    pub created_at: String,
}

/// Statistical comparison of the two arms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Significance {
    pub significant: bool,
    pub p_value: f64,
    pub t_statistic: f64,
    pub effect_size: f64,
    pub confidence_interval: (f64, f64),
    pub variant_a_mean: f64,
    pub variant_b_mean: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Evaluation outcome with a deployment recommendation.
#[derive(Debug, Clone, Serialize)]
pub struct AbTestResult {
    pub experiment_id: String,
    pub samples_a: usize,
    pub samples_b: usize,
    pub significance: Significance,
    pub winner: Option<String>,
    pub recommendation: String,
}

pub struct AbTestRunner {
    client: Client,
    experiments: DashMap<String, Experiment>,
}

impl AbTestRunner {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            experiments: DashMap::new(),
        }
    }

    /// Running experiments, for the operator listing.
    pub fn experiments(&self) -> Vec<Experiment> {
        self.experiments
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn experiment(&self, experiment_id: &str) -> Result<Experiment> {
        self.experiments
            .get(experiment_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("experiment {}", experiment_id)))
    }

    /// Create an experiment backed by its own dataset.
    pub async fn create_experiment(
        &self,
        name: &str,
        variant_a: Value,
        variant_b: Value,
        traffic_split: f64,
    ) -> Result<Experiment> {
        if !(0.0..=1.0).contains(&traffic_split) {
            return Err(Error::Validation(format!(
                "traffic_split must be within [0, 1], got {}",
                traffic_split
            )));
        }

        let dataset = self
            .client
            .create_dataset(
                &format!("ab_experiment_{}", name),
                "A/B experiment configuration and results",
            )
            .await?;

        let experiment = Experiment {
            experiment_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            dataset_id: dataset.id,
            variant_a,
            variant_b,
            traffic_split,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let config = Example {
            id: None,
            inputs: Map::from_iter([("kind".to_string(), json!("experiment_config"))]),
            outputs: Map::new(),
            metadata: serde_json::to_value(&experiment)?
                .as_object()
                .cloned()
                .unwrap_or_default(),
        };
        self.client
            .add_examples(&experiment.dataset_id, &[config])
            .await?;

        self.experiments
            .insert(experiment.experiment_id.clone(), experiment.clone());
        info!(
            "created A/B experiment {} ({})",
            experiment.name, experiment.experiment_id
        );
        Ok(experiment)
    }

    /// Record one observed result for a variant arm.
    pub async fn record_result(
        &self,
        experiment_id: &str,
        variant: &str,
        quality_score: f64,
    ) -> Result<()> {
        if variant != "a" && variant != "b" {
            return Err(Error::Validation(format!(
                "variant must be \"a\" or \"b\", got {:?}",
                variant
            )));
        }
        let experiment = self.experiment(experiment_id)?;
        let example = Example {
            id: None,
            inputs: Map::from_iter([
                ("kind".to_string(), json!("variant_result")),
                ("variant".to_string(), json!(variant)),
            ]),
            outputs: Map::from_iter([("quality_score".to_string(), json!(quality_score))]),
            metadata: Map::from_iter([
                ("experiment_id".to_string(), json!(experiment.experiment_id)),
                ("recorded_at".to_string(), json!(chrono::Utc::now().to_rfc3339())),
            ]),
        };
        self.client
            .add_examples(&experiment.dataset_id, &[example])
            .await?;
        Ok(())
    }

    /// Collect both arms and evaluate the experiment.
    pub async fn evaluate(&self, experiment_id: &str) -> Result<AbTestResult> {
        let experiment = self.experiment(experiment_id)?;
        let examples = self
            .client
            .search_examples(&experiment.dataset_id, "variant_result", 500)
            .await?;

        let scores_a = variant_scores(&examples, "a");
        let scores_b = variant_scores(&examples, "b");
        debug!(
            "evaluating experiment {}: {} vs {} samples",
            experiment.experiment_id,
            scores_a.len(),
            scores_b.len()
        );

        let significance = significance(&scores_a, &scores_b);
        let winner = if significance.significant {
            if significance.effect_size > 0.0 {
                Some("b".to_string())
            } else {
                Some("a".to_string())
            }
        } else {
            None
        };
        let recommendation = match &winner {
            Some(variant) => format!(
                "deploy variant {} (effect size {:+.3}, p={:.3})",
                variant, significance.effect_size, significance.p_value
            ),
            None => "keep current configuration; no significant difference".to_string(),
        };

        Ok(AbTestResult {
            experiment_id: experiment.experiment_id.clone(),
            samples_a: scores_a.len(),
            samples_b: scores_b.len(),
            significance,
            winner,
            recommendation,
        })
    }
}

fn variant_scores(examples: &[Example], variant: &str) -> Vec<f64> {
    examples
        .iter()
        .filter(|example| {
            example.inputs.get("variant").and_then(Value::as_str) == Some(variant)
        })
        .filter_map(|example| example.outputs.get("quality_score").and_then(Value::as_f64))
        .collect()
}

/// Welch-style t-test approximation between the two arms.
pub fn significance(a_scores: &[f64], b_scores: &[f64]) -> Significance {
    if a_scores.len() < MIN_SAMPLES || b_scores.len() < MIN_SAMPLES {
        return Significance {
            significant: false,
            p_value: 1.0,
            t_statistic: 0.0,
            effect_size: 0.0,
            confidence_interval: (0.0, 0.0),
            variant_a_mean: mean(a_scores),
            variant_b_mean: mean(b_scores),
            reason: Some("insufficient_sample_size".to_string()),
        };
    }

    let a_mean = mean(a_scores);
    let b_mean = mean(b_scores);
    let a_var = sample_variance(a_scores, a_mean);
    let b_var = sample_variance(b_scores, b_mean);

    let pooled_se = ((a_var / a_scores.len() as f64) + (b_var / b_scores.len() as f64)).sqrt();
    let t_statistic = if pooled_se > 0.0 {
        (b_mean - a_mean) / pooled_se
    } else {
        0.0
    };

    let p_value = if t_statistic.abs() < 3.0 {
        (2.0 * (1.0 - t_statistic.abs() / 3.0)).clamp(0.01, 1.0)
    } else {
        0.01
    };

    let margin = 1.96 * pooled_se;
    let effect_size = b_mean - a_mean;

    Significance {
        significant: p_value < SIGNIFICANCE_LEVEL,
        p_value,
        t_statistic,
        effect_size,
        confidence_interval: (effect_size - margin, effect_size + margin),
        variant_a_mean: a_mean,
        variant_b_mean: b_mean,
        reason: None,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}
