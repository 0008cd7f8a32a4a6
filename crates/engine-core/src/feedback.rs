//! User feedback ingestion and reinforcement pattern extraction.

use common::Result;
use engine_config::FeedbackConfig;
use observability::{Client, Example};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use tracing::debug;

/// A derived reinforcement pattern for the meta-learner. Indicators are
/// closed names, never free text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackPattern {
    pub pattern_id: String,
    pub run_id: String,
    pub feedback_key: String,
    pub score: f64,
    pub has_correction: bool,
    pub success_indicators: Vec<String>,
    pub failure_indicators: Vec<String>,
    /// ISO-8601 timestamp of collection
    pub created_at: String,
}

pub struct FeedbackCollector {
    client: Client,
    config: FeedbackConfig,
    dataset_id: OnceCell<String>,
}

impl FeedbackCollector {
    pub fn new(client: Client, config: FeedbackConfig) -> Self {
        Self {
            client,
            config,
            dataset_id: OnceCell::new(),
        }
    }

    /// Record user feedback with an optional correction payload, derive a
    /// reinforcement pattern, and store it for later cycles.
    pub async fn collect(
        &self,
        run_id: &str,
        key: &str,
        score: f64,
        comment: Option<&str>,
        correction: Option<&Value>,
    ) -> Result<FeedbackPattern> {
        let feedback = self
            .client
            .create_feedback(run_id, key, score, comment, correction)
            .await?;

        let pattern = derive_pattern(&feedback.id, run_id, key, score, correction);
        self.store_pattern(&pattern).await?;
        debug!(
            "collected feedback for {} ({}={:.2}, correction={})",
            run_id, key, score, pattern.has_correction
        );
        Ok(pattern)
    }

    /// Feedback patterns collected within the recent window, newest first.
    pub async fn recent(&self) -> Result<Vec<FeedbackPattern>> {
        let dataset_id = self.ensure_dataset().await?;
        let examples = self
            .client
            .search_examples(&dataset_id, "feedback", 100)
            .await?;

        let cutoff = chrono::Utc::now() - chrono::Duration::days(self.config.recent_days);
        let mut patterns: Vec<FeedbackPattern> = examples
            .iter()
            .filter_map(example_to_pattern)
            .filter(|pattern| {
                pattern
                    .created_at
                    .parse::<chrono::DateTime<chrono::Utc>>()
                    .map(|at| at >= cutoff)
                    .unwrap_or(false)
            })
            .collect();
        patterns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(patterns)
    }

    async fn store_pattern(&self, pattern: &FeedbackPattern) -> Result<()> {
        let dataset_id = self.ensure_dataset().await?;
        let example = Example {
            id: None,
            inputs: Map::from_iter([("run_id".to_string(), json!(pattern.run_id))]),
            outputs: Map::from_iter([("score".to_string(), json!(pattern.score))]),
            metadata: serde_json::to_value(pattern)?
                .as_object()
                .cloned()
                .unwrap_or_default(),
        };
        self.client.add_examples(&dataset_id, &[example]).await?;
        Ok(())
    }

    async fn ensure_dataset(&self) -> Result<String> {
        self.dataset_id
            .get_or_try_init(|| async {
                let existing = self.client.list_datasets().await?;
                if let Some(dataset) = existing
                    .into_iter()
                    .find(|d| d.name == self.config.dataset_name)
                {
                    return Ok(dataset.id);
                }
                let created = self
                    .client
                    .create_dataset(&self.config.dataset_name, "User feedback patterns")
                    .await?;
                Ok(created.id)
            })
            .await
            .cloned()
    }
}

fn derive_pattern(
    feedback_id: &str,
    run_id: &str,
    key: &str,
    score: f64,
    correction: Option<&Value>,
) -> FeedbackPattern {
    FeedbackPattern {
        pattern_id: format!("feedback_{}", feedback_id),
        run_id: run_id.to_string(),
        feedback_key: key.to_string(),
        score,
        has_correction: correction.is_some(),
        success_indicators: success_indicators(key, score, correction),
        failure_indicators: failure_indicators(score, correction),
        created_at: chrono::Utc::now().to_rfc3339(),
    }
}

/// Success indicator names: high score, a user-provided correction (a
/// strong engagement signal), and the feedback type itself.
fn success_indicators(key: &str, score: f64, correction: Option<&Value>) -> Vec<String> {
    let mut indicators = Vec::new();
    if score >= 0.8 {
        indicators.push("high_quality_response".to_string());
    }
    if correction.is_some() {
        indicators.push("user_provided_correction".to_string());
    }
    indicators.push(format!("feedback_type_{}", key));
    indicators
}

/// Failure indicator names: low score, and corrections that mention errors.
fn failure_indicators(score: f64, correction: Option<&Value>) -> Vec<String> {
    let mut indicators = Vec::new();
    if score < 0.5 {
        indicators.push("low_quality_response".to_string());
    }
    if let Some(correction) = correction {
        if correction.to_string().to_lowercase().contains("error") {
            indicators.push("error_in_response".to_string());
        }
    }
    indicators
}

fn example_to_pattern(example: &Example) -> Option<FeedbackPattern> {
    serde_json::from_value(Value::Object(example.metadata.clone())).ok()
}
