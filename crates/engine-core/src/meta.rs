//! Meta-learning over optimization strategies.
//!
//! Ranks the known strategies by how effective they have been in contexts
//! similar to the current one. With no recorded history every strategy
//! starts at a neutral effectiveness so ranking is defined from the first
//! cycle.

use serde::{Deserialize, Serialize};

/// The closed set of optimization strategies.
pub const STRATEGY_NAMES: [&str; 6] = [
    "delta_analysis",
    "ab_testing",
    "pattern_reinforcement",
    "meta_learning",
    "adversarial_testing",
    "multi_objective",
];

/// Strategies below this contextual similarity are not considered.
const MIN_SIMILARITY: f64 = 0.5;

/// How many ranked strategies a query returns.
const TOP_K: usize = 3;

/// Neutral starting effectiveness for an unobserved strategy.
const SEED_EFFECTIVENESS: f64 = 0.5;

/// The context a strategy was (or would be) applied in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyContext {
    pub model: Option<String>,
    pub spectrum: Option<String>,
    pub quality_score: f64,
}

/// A strategy with its observed effectiveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    pub context: StrategyContext,
    pub effectiveness_score: f64,
    pub sample_size: u64,
    pub confidence: f64,
}

/// A ranked recommendation.
#[derive(Debug, Clone, Serialize)]
pub struct RankedStrategy {
    pub name: String,
    pub effectiveness_score: f64,
    pub similarity: f64,
    /// effectiveness x similarity, the ranking key
    pub score: f64,
}

pub struct MetaLearner {
    history: parking_lot::RwLock<Vec<Strategy>>,
}

impl MetaLearner {
    pub fn new() -> Self {
        let seeded = STRATEGY_NAMES
            .iter()
            .map(|name| Strategy {
                name: (*name).to_string(),
                context: StrategyContext::default(),
                effectiveness_score: SEED_EFFECTIVENESS,
                sample_size: 0,
                confidence: 0.0,
            })
            .collect();
        Self {
            history: parking_lot::RwLock::new(seeded),
        }
    }

    /// Rank strategies for a context: keep those with similarity >= 0.5,
    /// order by effectiveness x similarity, return the top 3.
    pub fn rank(&self, context: &StrategyContext) -> Vec<RankedStrategy> {
        let history = self.history.read();
        let mut ranked: Vec<RankedStrategy> = history
            .iter()
            .map(|strategy| {
                let similarity = context_similarity(context, &strategy.context);
                RankedStrategy {
                    name: strategy.name.clone(),
                    effectiveness_score: strategy.effectiveness_score,
                    similarity,
                    score: strategy.effectiveness_score * similarity,
                }
            })
            .filter(|ranked| ranked.similarity >= MIN_SIMILARITY)
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        ranked.truncate(TOP_K);
        ranked
    }

    /// Record the outcome of applying a strategy in a context. The
    /// effectiveness of the matching entry becomes a running mean; an
    /// unknown strategy name is ignored.
    pub fn record_outcome(&self, name: &str, context: StrategyContext, effectiveness: f64) {
        let effectiveness = effectiveness.clamp(0.0, 1.0);
        let mut history = self.history.write();
        if let Some(strategy) = history.iter_mut().find(|s| s.name == name) {
            let n = strategy.sample_size as f64;
            strategy.effectiveness_score =
                (strategy.effectiveness_score * n + effectiveness) / (n + 1.0);
            strategy.sample_size += 1;
            strategy.confidence = (strategy.sample_size as f64 / 10.0).min(1.0);
            strategy.context = context;
        }
    }

    /// All known strategies (for status reporting).
    pub fn strategies(&self) -> Vec<Strategy> {
        self.history.read().clone()
    }
}

impl Default for MetaLearner {
    fn default() -> Self {
        Self::new()
    }
}

/// Context similarity: 0.3 for a model match, 0.4 for a spectrum match,
/// 0.3 scaled by quality proximity. An absent field on either side is a
/// wildcard match, so fresh seeded strategies are reachable from any
/// context; two different concrete values never match.
pub fn context_similarity(a: &StrategyContext, b: &StrategyContext) -> f64 {
    let mut score = 0.0;
    if field_matches(&a.model, &b.model) {
        score += 0.3;
    }
    if field_matches(&a.spectrum, &b.spectrum) {
        score += 0.4;
    }
    score += (1.0 - (a.quality_score - b.quality_score).abs()) * 0.3;
    score.clamp(0.0, 1.0)
}

fn field_matches(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(model: &str, spectrum: &str, quality: f64) -> StrategyContext {
        StrategyContext {
            model: Some(model.to_string()),
            spectrum: Some(spectrum.to_string()),
            quality_score: quality,
        }
    }

    #[test]
    fn test_identical_contexts_are_fully_similar() {
        let a = context("gpt-4o", "general", 0.9);
        assert!((context_similarity(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mismatched_context_similarity() {
        let a = context("gpt-4o", "general", 0.9);
        let b = context("claude-3", "credit_analysis", 0.9);
        // Only the quality term survives
        assert!((context_similarity(&a, &b) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_rank_returns_top_three() {
        let learner = MetaLearner::new();
        let ranked = learner.rank(&StrategyContext::default());
        assert_eq!(ranked.len(), 3);
        // Seeded strategies tie on score; ordering falls back to name
        assert_eq!(ranked[0].name, "ab_testing");
    }

    #[test]
    fn test_recorded_outcomes_change_ranking() {
        let learner = MetaLearner::new();
        let ctx = StrategyContext::default();
        learner.record_outcome("pattern_reinforcement", ctx.clone(), 1.0);
        learner.record_outcome("pattern_reinforcement", ctx.clone(), 0.9);

        let ranked = learner.rank(&ctx);
        assert_eq!(ranked[0].name, "pattern_reinforcement");
        assert!(ranked[0].effectiveness_score > 0.6);
    }

    #[test]
    fn test_effectiveness_is_running_mean() {
        let learner = MetaLearner::new();
        let ctx = StrategyContext::default();
        learner.record_outcome("ab_testing", ctx.clone(), 1.0);
        let strategy = learner
            .strategies()
            .into_iter()
            .find(|s| s.name == "ab_testing")
            .unwrap();
        // (0.5 * 0 + 1.0) / 1 with zero prior samples
        assert_eq!(strategy.effectiveness_score, 1.0);
        assert_eq!(strategy.sample_size, 1);
        assert!((strategy.confidence - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_strategy_name_is_ignored() {
        let learner = MetaLearner::new();
        learner.record_outcome("made_up", StrategyContext::default(), 1.0);
        assert_eq!(learner.strategies().len(), STRATEGY_NAMES.len());
    }

    #[test]
    fn test_dissimilar_contexts_are_filtered() {
        let learner = MetaLearner::new();
        let ctx = StrategyContext::default();
        // Push one strategy into a distant context
        learner.record_outcome(
            "multi_objective",
            context("other-model", "other-spectrum", 0.1),
            0.9,
        );

        let query = context("gpt-4o", "general", 0.95);
        let ranked = learner.rank(&query);
        // multi_objective now sits at similarity 0.3*(1-0.85) < 0.5 and is
        // excluded; wildcard-context seeds remain eligible.
        assert!(ranked.iter().all(|r| r.name != "multi_objective"));
        assert_eq!(ranked.len(), 3);
    }
}
