//! Wire types for the observability backend.
//!
//! Everything here is tolerant to shape drift: unknown fields are ignored,
//! missing fields default, and any genuinely free-form payload stays inside
//! a `metadata` map that core logic never introspects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A single run (trace) as returned by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRun {
    pub id: String,
    pub session_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    /// Aggregated feedback scores keyed by feedback type, each in [0, 1]
    pub feedback_scores: HashMap<String, f64>,
    /// Run outputs; may carry an explicit `quality_score`
    pub outputs: Option<Map<String, Value>>,
    /// Invocation metadata; may carry `model`, `provider`, `spectrum`
    pub extra_metadata: Map<String, Value>,
}

impl RawRun {
    /// Whether the run finished in an error state.
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.status.as_deref() == Some("error")
    }

    /// Wall-clock latency, zero when either endpoint is missing.
    pub fn latency_ms(&self) -> u64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Model name from invocation metadata, if recorded.
    pub fn model(&self) -> Option<&str> {
        self.extra_metadata.get("model").and_then(Value::as_str)
    }

    /// Explicit quality score from run outputs, if present.
    pub fn explicit_quality(&self) -> Option<f64> {
        let outputs = self.outputs.as_ref()?;
        outputs
            .get("quality_score")
            .or_else(|| outputs.get("score"))
            .and_then(Value::as_f64)
    }
}

/// Filters accepted by the runs listing and stats endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunFilters {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub session_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub include_feedback: bool,
}

/// Workspace-level statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceStats {
    pub tenant_id: String,
    pub dataset_count: u64,
    pub tracer_session_count: u64,
    pub repo_count: u64,
    pub annotation_queue_count: u64,
    pub deployment_count: u64,
    pub dashboards_count: u64,
    pub total_runs: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Aggregate run statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    pub total_runs: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

impl Default for RunStats {
    fn default() -> Self {
        // The degraded-backend fallback: no runs observed, nothing failing
        Self {
            total_runs: 0,
            success_rate: 1.0,
            error_rate: 0.0,
            latency_p50_ms: 0.0,
            latency_p99_ms: 0.0,
            total_tokens: 0,
            total_cost: 0.0,
        }
    }
}

/// A dataset handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetRef {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub example_count: u64,
}

/// A dataset example.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Example {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

/// A created feedback entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackRef {
    pub id: String,
    pub run_id: String,
    pub key: String,
    pub score: f64,
}

/// A created bulk export job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkExportRef {
    pub id: String,
}

/// Status of a bulk export job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkExportStatus {
    pub id: String,
    pub status: String,
}

/// A tracer session (project) handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRef {
    pub id: String,
    pub name: String,
}

/// An annotation queue handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationQueueRef {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}
