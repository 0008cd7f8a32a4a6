//! High-quality exemplar indexing and similarity search.
//!
//! Exemplars live in a backend dataset (created on first use) and are
//! deduplicated by a stable hash of the run id. Similarity is a weighted
//! tag match, deterministic for equal inputs: ranking is a stable sort
//! with the pattern id as tie-break.

use crate::evaluator::QualityMetric;
use common::Result;
use dashmap::DashSet;
use engine_config::PatternConfig;
use observability::{Client, Example};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tokio::sync::OnceCell;
use tracing::debug;

/// An indexed exemplar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub quality_score: f64,
    /// Must include `model` and `spectrum` when available
    pub tags: HashMap<String, String>,
    /// ISO-8601 timestamp of indexing
    pub indexed_at: String,
}

/// Query context for similarity search.
#[derive(Debug, Clone, Default)]
pub struct PatternQuery {
    pub model: Option<String>,
    pub spectrum: Option<String>,
    pub quality_score: f64,
}

/// A search hit with its similarity in [0, 1].
#[derive(Debug, Clone, Serialize)]
pub struct PatternMatch {
    pub pattern: Pattern,
    pub similarity: f64,
}

pub struct PatternIndex {
    client: Client,
    config: PatternConfig,
    dataset_id: OnceCell<String>,
    seen: DashSet<String>,
}

impl PatternIndex {
    pub fn new(client: Client, config: PatternConfig) -> Self {
        Self {
            client,
            config,
            dataset_id: OnceCell::new(),
            seen: DashSet::new(),
        }
    }

    /// Stable dedupe id for a run.
    pub fn pattern_id(run_id: &str) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        run_id.hash(&mut hasher);
        format!("pattern_{:016x}", hasher.finish())
    }

    /// Index a metric as an exemplar when it clears the quality bar.
    /// Returns the indexed pattern, or `None` when skipped (below bar or
    /// already indexed).
    pub async fn maybe_index(&self, metric: &QualityMetric) -> Result<Option<Pattern>> {
        if metric.quality_score < self.config.index_threshold {
            return Ok(None);
        }

        let pattern_id = Self::pattern_id(&metric.run_id);
        if !self.seen.insert(pattern_id.clone()) {
            debug!("pattern {} already indexed, skipping", pattern_id);
            return Ok(None);
        }

        let mut tags = HashMap::new();
        tags.insert("model".to_string(), metric.model.clone());
        tags.insert("spectrum".to_string(), metric.spectrum.clone());
        tags.insert("provider".to_string(), metric.provider.clone());

        let pattern = Pattern {
            pattern_id: pattern_id.clone(),
            inputs: Map::from_iter([
                ("run_id".to_string(), json!(metric.run_id)),
                ("session_name".to_string(), json!(metric.session_name)),
            ]),
            outputs: Map::from_iter([("quality_score".to_string(), json!(metric.quality_score))]),
            quality_score: metric.quality_score,
            tags,
            indexed_at: chrono::Utc::now().to_rfc3339(),
        };

        let dataset_id = self.ensure_dataset().await?;
        let example = Example {
            id: None,
            inputs: pattern.inputs.clone(),
            outputs: pattern.outputs.clone(),
            metadata: pattern_metadata(&pattern),
        };
        self.client.add_examples(&dataset_id, &[example]).await?;

        debug!(
            "indexed exemplar {} (model={}, spectrum={}, q={:.3})",
            pattern.pattern_id, metric.model, metric.spectrum, metric.quality_score
        );
        Ok(Some(pattern))
    }

    /// Find the most similar indexed exemplars for a query context.
    pub async fn search(&self, query: &PatternQuery) -> Result<Vec<PatternMatch>> {
        let dataset_id = self.ensure_dataset().await?;
        let search_query = query_text(query);
        let examples = self
            .client
            .search_examples(&dataset_id, &search_query, 50)
            .await?;

        let mut matches: Vec<PatternMatch> = examples
            .iter()
            .filter_map(example_to_pattern)
            .map(|pattern| {
                let similarity = similarity(query, &pattern);
                PatternMatch {
                    pattern,
                    similarity,
                }
            })
            .filter(|hit| hit.similarity >= self.config.min_similarity)
            .collect();

        // Deterministic ranking: similarity descending, pattern id as tie-break
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pattern.pattern_id.cmp(&b.pattern.pattern_id))
        });
        matches.truncate(self.config.top_k);
        Ok(matches)
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
                    .create_dataset(
                        &self.config.dataset_name,
                        "High-quality interaction exemplars",
                    )
                    .await?;
                Ok(created.id)
            })
            .await
            .cloned()
    }
}

/// Weighted tag similarity: 0.3 for a model match, 0.4 for a spectrum
/// match, and 0.3 scaled by quality proximity, normalized to [0, 1] over
/// the matched weights. A mismatched tag drops out of both sides, so an
/// exemplar is scored on how well its matching facets agree and ranked
/// below exemplars that match on more facets.
pub fn similarity(query: &PatternQuery, pattern: &Pattern) -> f64 {
    let mut matched = 0.0;
    let mut weight = 0.3;

    if let (Some(model), Some(tag)) = (query.model.as_deref(), pattern.tags.get("model")) {
        if model == tag {
            matched += 0.3;
            weight += 0.3;
        }
    }
    if let (Some(spectrum), Some(tag)) = (query.spectrum.as_deref(), pattern.tags.get("spectrum"))
    {
        if spectrum == tag {
            matched += 0.4;
            weight += 0.4;
        }
    }
    matched += (1.0 - (query.quality_score - pattern.quality_score).abs()) * 0.3;
    (matched / weight).clamp(0.0, 1.0)
}

fn query_text(query: &PatternQuery) -> String {
    let mut parts = Vec::new();
    if let Some(model) = &query.model {
        parts.push(format!("model:{}", model));
    }
    if let Some(spectrum) = &query.spectrum {
        parts.push(format!("spectrum:{}", spectrum));
    }
    if parts.is_empty() {
        parts.push("quality".to_string());
    }
    parts.join(" ")
}

fn pattern_metadata(pattern: &Pattern) -> Map<String, Value> {
    Map::from_iter([
        ("pattern_id".to_string(), json!(pattern.pattern_id)),
        ("quality_score".to_string(), json!(pattern.quality_score)),
        ("tags".to_string(), json!(pattern.tags)),
        ("indexed_at".to_string(), json!(pattern.indexed_at)),
    ])
}

fn example_to_pattern(example: &Example) -> Option<Pattern> {
    let metadata = &example.metadata;
    let pattern_id = metadata.get("pattern_id")?.as_str()?.to_string();
    let quality_score = metadata.get("quality_score")?.as_f64()?;
    let tags: HashMap<String, String> = metadata
        .get("tags")
        .and_then(|tags| serde_json::from_value(tags.clone()).ok())
        .unwrap_or_default();
    let indexed_at = metadata
        .get("indexed_at")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(Pattern {
        pattern_id,
        inputs: example.inputs.clone(),
        outputs: example.outputs.clone(),
        quality_score,
        tags,
        indexed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(model: &str, spectrum: &str, quality: f64) -> Pattern {
        let mut tags = HashMap::new();
        tags.insert("model".to_string(), model.to_string());
        tags.insert("spectrum".to_string(), spectrum.to_string());
        Pattern {
            pattern_id: PatternIndex::pattern_id(&format!("{}-{}-{}", model, spectrum, quality)),
            inputs: Map::new(),
            outputs: Map::new(),
            quality_score: quality,
            tags,
            indexed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_pattern_id_is_stable() {
        assert_eq!(
            PatternIndex::pattern_id("run-42"),
            PatternIndex::pattern_id("run-42")
        );
        assert_ne!(
            PatternIndex::pattern_id("run-42"),
            PatternIndex::pattern_id("run-43")
        );
    }

    #[test]
    fn test_full_match_similarity() {
        let query = PatternQuery {
            model: Some("gpt-4o".to_string()),
            spectrum: Some("credit_analysis".to_string()),
            quality_score: 0.96,
        };
        let exemplar = pattern("gpt-4o", "credit_analysis", 0.96);
        assert!((similarity(&query, &exemplar) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_same_model_ranks_same_spectrum_higher() {
        // Seed case: {model=A, spectrum=X, q=0.96} vs {model=A, spectrum=Y, q=0.95}
        let query = PatternQuery {
            model: Some("A".to_string()),
            spectrum: Some("X".to_string()),
            quality_score: 0.92,
        };
        let same_spectrum = pattern("A", "X", 0.96);
        let other_spectrum = pattern("A", "Y", 0.95);

        let sim_same = similarity(&query, &same_spectrum);
        let sim_other = similarity(&query, &other_spectrum);
        assert!(sim_same > sim_other);
        assert!(sim_same > 0.85);
        assert!(sim_other > 0.85);
    }

    #[test]
    fn test_quality_distance_lowers_similarity() {
        let query = PatternQuery {
            model: Some("A".to_string()),
            spectrum: Some("X".to_string()),
            quality_score: 0.2,
        };
        let exemplar = pattern("A", "X", 0.99);
        let sim = similarity(&query, &exemplar);
        assert!(sim < 0.95);
        assert!(sim > 0.7);
    }

    #[test]
    fn test_example_pattern_roundtrip() {
        let exemplar = pattern("gpt-4o", "general", 0.97);
        let example = Example {
            id: None,
            inputs: exemplar.inputs.clone(),
            outputs: exemplar.outputs.clone(),
            metadata: pattern_metadata(&exemplar),
        };
        let parsed = example_to_pattern(&example).unwrap();
        assert_eq!(parsed.pattern_id, exemplar.pattern_id);
        assert_eq!(parsed.quality_score, exemplar.quality_score);
        assert_eq!(parsed.tags, exemplar.tags);
    }

    #[test]
    fn test_example_without_metadata_is_skipped() {
        let example = Example::default();
        assert!(example_to_pattern(&example).is_none());
    }
}
