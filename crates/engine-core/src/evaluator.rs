//! Quality evaluation of raw runs.
//!
//! Converts a [`RawRun`] into a normalized [`QualityMetric`]. Scoring is
//! deterministic and total: every run gets a score in [0, 1], and a score
//! of exactly 0.0 means the run errored.

use chrono::Utc;
use observability::RawRun;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Feedback weights by type; unknown keys get [`DEFAULT_FEEDBACK_WEIGHT`].
const FEEDBACK_WEIGHTS: [(&str, f64); 4] = [
    ("quality", 0.4),
    ("accuracy", 0.3),
    ("helpfulness", 0.2),
    ("relevance", 0.1),
];

const DEFAULT_FEEDBACK_WEIGHT: f64 = 0.1;

/// Score for a successful run with no other signal.
const BENEFIT_OF_THE_DOUBT: f64 = 0.85;

/// A score of exactly 0.0 is reserved for errored runs, so non-error
/// scores are floored here.
const MIN_NON_ERROR_SCORE: f64 = 0.01;

/// A normalized quality measurement derived from one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetric {
    pub run_id: String,
    pub session_name: String,
    pub model: String,
    pub provider: String,
    pub quality_score: f64,
    pub latency_ms: u64,
    pub token_count: u64,
    pub cost: f64,
    /// ISO-8601 timestamp of the observation
    pub timestamp: String,
    pub spectrum: String,
}

/// Deterministic run scoring and classification.
pub struct QualityEvaluator;

impl QualityEvaluator {
    /// Derive a [`QualityMetric`] from a raw run.
    pub fn evaluate(run: &RawRun) -> QualityMetric {
        let model = run.model().unwrap_or("unknown").to_string();
        let timestamp = run
            .start_time
            .unwrap_or_else(Utc::now)
            .to_rfc3339();

        QualityMetric {
            run_id: run.id.clone(),
            session_name: run.session_name.clone().unwrap_or_default(),
            provider: Self::infer_provider(&model).to_string(),
            quality_score: Self::score(run),
            latency_ms: run.latency_ms(),
            token_count: run.total_tokens.unwrap_or(0),
            cost: run
                .extra_metadata
                .get("cost")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            timestamp,
            spectrum: Self::infer_spectrum(run),
            model,
        }
    }

    /// Compute the quality score, in priority order: error status, feedback
    /// scores, explicit output quality, latency heuristic, benefit of the
    /// doubt.
    pub fn score(run: &RawRun) -> f64 {
        if run.is_error() {
            return 0.0;
        }

        let score = if !run.feedback_scores.is_empty() {
            Self::weighted_feedback(&run.feedback_scores)
        } else if let Some(explicit) = run.explicit_quality() {
            explicit.clamp(0.0, 1.0)
        } else if run.status.as_deref() == Some("success") {
            let latency = run.latency_ms();
            if latency < 2_000 {
                0.95
            } else if latency < 5_000 {
                0.85
            } else {
                0.75
            }
        } else {
            BENEFIT_OF_THE_DOUBT
        };

        score.max(MIN_NON_ERROR_SCORE)
    }

    fn weighted_feedback(scores: &HashMap<String, f64>) -> f64 {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        for (key, score) in scores {
            let weight = FEEDBACK_WEIGHTS
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, w)| *w)
                .unwrap_or(DEFAULT_FEEDBACK_WEIGHT);
            weighted += score * weight;
            total_weight += weight;
        }

        if total_weight > 0.0 {
            (weighted / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Workload category, from explicit metadata when present, otherwise
    /// inferred from the session name.
    pub fn infer_spectrum(run: &RawRun) -> String {
        if let Some(spectrum) = run
            .extra_metadata
            .get("spectrum")
            .and_then(Value::as_str)
        {
            return spectrum.to_string();
        }

        let session = run
            .session_name
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        if session.contains("credit") {
            "credit_analysis".to_string()
        } else if session.contains("customer") {
            "customer_profile".to_string()
        } else if session.contains("transaction") {
            "transaction_history".to_string()
        } else {
            "general".to_string()
        }
    }

    /// Provider inferred from the model name prefix.
    pub fn infer_provider(model: &str) -> &'static str {
        let model = model.to_lowercase();
        if model.contains("gpt") || model.contains("openai") {
            "openai"
        } else if model.contains("claude") {
            "anthropic"
        } else if model.contains("llama") || model.contains("groq") {
            "groq"
        } else if model.contains("gemini") {
            "google"
        } else {
            "unknown"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_from(value: Value) -> RawRun {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_error_run_scores_zero() {
        let run = run_from(json!({
            "id": "a",
            "status": "error",
            "error": "timeout",
            "feedback_scores": { "quality": 0.9 }
        }));
        // Error status dominates even when feedback exists
        assert_eq!(QualityEvaluator::score(&run), 0.0);
    }

    #[test]
    fn test_weighted_feedback_mean() {
        let run = run_from(json!({
            "id": "a",
            "status": "success",
            "feedback_scores": { "quality": 1.0, "accuracy": 0.5 }
        }));
        // (1.0*0.4 + 0.5*0.3) / 0.7
        let expected = (1.0 * 0.4 + 0.5 * 0.3) / 0.7;
        assert!((QualityEvaluator::score(&run) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_feedback_key_gets_default_weight() {
        let run = run_from(json!({
            "id": "a",
            "status": "success",
            "feedback_scores": { "quality": 0.8, "novelty": 0.2 }
        }));
        let expected = (0.8 * 0.4 + 0.2 * 0.1) / 0.5;
        assert!((QualityEvaluator::score(&run) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_quality_used_without_feedback() {
        let run = run_from(json!({
            "id": "a",
            "status": "success",
            "outputs": { "quality_score": 0.42 }
        }));
        assert_eq!(QualityEvaluator::score(&run), 0.42);
    }

    #[test]
    fn test_latency_heuristic_tiers() {
        let fast = run_from(json!({
            "id": "a",
            "status": "success",
            "start_time": "2026-01-01T00:00:00Z",
            "end_time": "2026-01-01T00:00:01Z"
        }));
        let medium = run_from(json!({
            "id": "b",
            "status": "success",
            "start_time": "2026-01-01T00:00:00Z",
            "end_time": "2026-01-01T00:00:03Z"
        }));
        let slow = run_from(json!({
            "id": "c",
            "status": "success",
            "start_time": "2026-01-01T00:00:00Z",
            "end_time": "2026-01-01T00:00:09Z"
        }));
        assert_eq!(QualityEvaluator::score(&fast), 0.95);
        assert_eq!(QualityEvaluator::score(&medium), 0.85);
        assert_eq!(QualityEvaluator::score(&slow), 0.75);
    }

    #[test]
    fn test_unknown_status_gets_benefit_of_the_doubt() {
        let run = run_from(json!({ "id": "a" }));
        assert_eq!(QualityEvaluator::score(&run), 0.85);
    }

    #[test]
    fn test_zero_score_reserved_for_errors() {
        let terrible = run_from(json!({
            "id": "a",
            "status": "success",
            "feedback_scores": { "quality": 0.0, "accuracy": 0.0 }
        }));
        let score = QualityEvaluator::score(&terrible);
        assert!(score > 0.0);
        assert!(score <= 0.01);

        let explicit_zero = run_from(json!({
            "id": "b",
            "status": "success",
            "outputs": { "quality_score": 0.0 }
        }));
        assert!(QualityEvaluator::score(&explicit_zero) > 0.0);
    }

    #[test]
    fn test_score_always_in_range() {
        let out_of_range = run_from(json!({
            "id": "a",
            "status": "success",
            "outputs": { "quality_score": 3.5 }
        }));
        let score = QualityEvaluator::score(&out_of_range);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_spectrum_from_metadata_wins() {
        let run = run_from(json!({
            "id": "a",
            "session_name": "credit-run",
            "extra_metadata": { "spectrum": "custom_flow" }
        }));
        assert_eq!(QualityEvaluator::infer_spectrum(&run), "custom_flow");
    }

    #[test]
    fn test_spectrum_from_session_name() {
        let cases = [
            ("prod-Credit-checks", "credit_analysis"),
            ("CUSTOMER-profile-api", "customer_profile"),
            ("transaction_batch", "transaction_history"),
            ("misc", "general"),
        ];
        for (session, expected) in cases {
            let run = run_from(json!({ "id": "a", "session_name": session }));
            assert_eq!(QualityEvaluator::infer_spectrum(&run), expected);
        }
    }

    #[test]
    fn test_provider_inference() {
        assert_eq!(QualityEvaluator::infer_provider("gpt-4o"), "openai");
        assert_eq!(QualityEvaluator::infer_provider("claude-3-sonnet"), "anthropic");
        assert_eq!(QualityEvaluator::infer_provider("llama-3-70b"), "groq");
        assert_eq!(QualityEvaluator::infer_provider("gemini-pro"), "google");
        assert_eq!(QualityEvaluator::infer_provider("mistral-7b"), "unknown");
    }

    #[test]
    fn test_evaluate_builds_full_metric() {
        let run = run_from(json!({
            "id": "run-1",
            "session_name": "credit-session",
            "status": "success",
            "start_time": "2026-01-01T00:00:00Z",
            "end_time": "2026-01-01T00:00:01Z",
            "total_tokens": 512,
            "extra_metadata": { "model": "gpt-4o", "cost": 0.012 }
        }));
        let metric = QualityEvaluator::evaluate(&run);
        assert_eq!(metric.run_id, "run-1");
        assert_eq!(metric.model, "gpt-4o");
        assert_eq!(metric.provider, "openai");
        assert_eq!(metric.spectrum, "credit_analysis");
        assert_eq!(metric.quality_score, 0.95);
        assert_eq!(metric.latency_ms, 1000);
        assert_eq!(metric.token_count, 512);
        assert_eq!(metric.cost, 0.012);
    }
}
