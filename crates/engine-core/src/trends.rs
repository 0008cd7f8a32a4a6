//! Performance trend analysis and degradation-risk assessment.
//!
//! Builds quality, latency, and cost trends from the rolling aggregates
//! and combines them with the forecast into a risk assessment with named
//! factors and operator recommendations.

use crate::evaluator::QualityMetric;
use crate::predict::{classify_slope, ols_slope, Forecast, Trend};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Quality-trend labels use a coarser stability band than forecasting.
const TREND_STABLE_BAND: f64 = 0.01;

/// Quality trend over the daily series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityTrend {
    pub trend: Trend,
    pub slope_per_day: f64,
    pub confidence: f64,
    pub current_quality: f64,
    pub data_points: usize,
}

/// Latency distribution over the retained metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub sample_size: usize,
}

/// Cost accumulation over the retained metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostStats {
    pub total_cost: f64,
    pub avg_cost_per_run: f64,
    pub cost_per_token: f64,
    pub sample_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Minimal,
    Low,
    Medium,
    High,
}

/// Degradation risk with named factors; factor names are a closed set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub risk_factors: Vec<String>,
    pub needs_immediate_action: bool,
    pub recommendations: Vec<String>,
}

/// Full trend report served to operators.
#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub quality: QualityTrend,
    pub latency: LatencyStats,
    pub cost: CostStats,
    pub forecast: Forecast,
    pub risk: RiskAssessment,
}

/// Quality trend over the daily series (oldest first).
pub fn quality_trend(daily: &[(NaiveDate, f64)]) -> QualityTrend {
    if daily.len() < 2 {
        return QualityTrend {
            trend: Trend::InsufficientData,
            slope_per_day: 0.0,
            confidence: 0.0,
            current_quality: daily.last().map(|(_, q)| *q).unwrap_or(0.0),
            data_points: daily.len(),
        };
    }

    let slope = ols_slope(daily);
    QualityTrend {
        trend: classify_slope(slope, TREND_STABLE_BAND),
        slope_per_day: slope,
        confidence: (daily.len() as f64 / 10.0).min(1.0),
        current_quality: daily[daily.len() - 1].1,
        data_points: daily.len(),
    }
}

/// Latency distribution, ignoring zero (unmeasured) latencies.
pub fn latency_stats(metrics: &[QualityMetric]) -> LatencyStats {
    let latencies: Vec<u64> = metrics
        .iter()
        .map(|m| m.latency_ms)
        .filter(|l| *l > 0)
        .collect();
    if latencies.is_empty() {
        return LatencyStats::default();
    }
    LatencyStats {
        avg_latency_ms: latencies.iter().sum::<u64>() as f64 / latencies.len() as f64,
        min_latency_ms: *latencies.iter().min().unwrap_or(&0),
        max_latency_ms: *latencies.iter().max().unwrap_or(&0),
        sample_size: latencies.len(),
    }
}

/// Cost accumulation, ignoring runs without cost data.
pub fn cost_stats(metrics: &[QualityMetric]) -> CostStats {
    let costs: Vec<f64> = metrics.iter().map(|m| m.cost).filter(|c| *c > 0.0).collect();
    let total_cost: f64 = costs.iter().sum();
    let total_tokens: u64 = metrics.iter().map(|m| m.token_count).sum();

    CostStats {
        total_cost,
        avg_cost_per_run: if costs.is_empty() {
            0.0
        } else {
            total_cost / costs.len() as f64
        },
        cost_per_token: if total_tokens > 0 {
            total_cost / total_tokens as f64
        } else {
            0.0
        },
        sample_size: costs.len(),
    }
}

/// Additive risk scoring: each observed factor contributes a fixed weight,
/// and the sum maps onto the risk tiers.
pub fn assess_risk(quality: &QualityTrend, forecast: &Forecast, target: f64) -> RiskAssessment {
    let mut risk_factors = Vec::new();
    let mut risk_score = 0.0;

    if quality.trend == Trend::Declining {
        risk_factors.push("declining_quality_trend".to_string());
        risk_score += 0.3;
    }
    if quality.confidence < 0.5 {
        risk_factors.push("insufficient_data_confidence".to_string());
        risk_score += 0.2;
    }
    if forecast.needs_intervention {
        risk_factors.push("predicted_quality_degradation".to_string());
        risk_score += 0.4;
    }
    if quality.current_quality > 0.0 && quality.current_quality < target {
        risk_factors.push("current_quality_below_threshold".to_string());
        risk_score += 0.3;
    }

    let risk_level = if risk_score >= 0.7 {
        RiskLevel::High
    } else if risk_score >= 0.4 {
        RiskLevel::Medium
    } else if risk_score >= 0.2 {
        RiskLevel::Low
    } else {
        RiskLevel::Minimal
    };

    RiskAssessment {
        risk_level,
        risk_score,
        needs_immediate_action: risk_score >= 0.7,
        recommendations: recommendations_for(&risk_factors),
        risk_factors,
    }
}

fn recommendations_for(risk_factors: &[String]) -> Vec<String> {
    let mut recommendations = Vec::new();
    for factor in risk_factors {
        match factor.as_str() {
            "declining_quality_trend" => {
                recommendations.push("Trigger immediate optimization cycle".to_string());
                recommendations.push("Analyze recent prompt changes".to_string());
            }
            "insufficient_data_confidence" => {
                recommendations.push("Increase monitoring frequency".to_string());
                recommendations.push("Collect more quality feedback".to_string());
            }
            "predicted_quality_degradation" => {
                recommendations.push("Schedule proactive optimization".to_string());
                recommendations.push("Review model performance patterns".to_string());
            }
            "current_quality_below_threshold" => {
                recommendations.push("Execute emergency optimization".to_string());
                recommendations.push("Implement quality safeguards".to_string());
            }
            _ => {}
        }
    }
    recommendations
}

/// Build the full report for a window of metrics and its daily series.
pub fn report(
    metrics: &[QualityMetric],
    daily: &[(NaiveDate, f64)],
    target: f64,
) -> TrendReport {
    let quality = quality_trend(daily);
    let forecast = crate::predict::Predictor::forecast(daily, target);
    let risk = assess_risk(&quality, &forecast, target);
    TrendReport {
        quality,
        latency: latency_stats(metrics),
        cost: cost_stats(metrics),
        forecast,
        risk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn series(values: &[f64]) -> Vec<(NaiveDate, f64)> {
        let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + chrono::Duration::days(i as i64), *v))
            .collect()
    }

    fn metric(latency_ms: u64, cost: f64, tokens: u64) -> QualityMetric {
        QualityMetric {
            run_id: uuid::Uuid::new_v4().to_string(),
            session_name: "test".to_string(),
            model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            quality_score: 0.9,
            latency_ms,
            token_count: tokens,
            cost,
            timestamp: Utc::now().to_rfc3339(),
            spectrum: "general".to_string(),
        }
    }

    #[test]
    fn test_quality_trend_labels() {
        let declining: Vec<f64> = (0..10).map(|i| 0.95 - 0.02 * i as f64).collect();
        assert_eq!(quality_trend(&series(&declining)).trend, Trend::Declining);

        let stable = quality_trend(&series(&[0.9; 10]));
        assert_eq!(stable.trend, Trend::Stable);
        assert_eq!(stable.current_quality, 0.9);

        assert_eq!(
            quality_trend(&series(&[0.9])).trend,
            Trend::InsufficientData
        );
    }

    #[test]
    fn test_latency_stats_ignore_unmeasured() {
        let metrics = vec![metric(100, 0.0, 10), metric(0, 0.0, 10), metric(300, 0.0, 10)];
        let stats = latency_stats(&metrics);
        assert_eq!(stats.sample_size, 2);
        assert_eq!(stats.avg_latency_ms, 200.0);
        assert_eq!(stats.min_latency_ms, 100);
        assert_eq!(stats.max_latency_ms, 300);
    }

    #[test]
    fn test_cost_stats() {
        let metrics = vec![metric(100, 0.02, 100), metric(100, 0.04, 300), metric(100, 0.0, 100)];
        let stats = cost_stats(&metrics);
        assert_eq!(stats.sample_size, 2);
        assert!((stats.total_cost - 0.06).abs() < 1e-9);
        assert!((stats.avg_cost_per_run - 0.03).abs() < 1e-9);
        assert!((stats.cost_per_token - 0.06 / 500.0).abs() < 1e-12);
    }

    #[test]
    fn test_risk_accumulates_factors() {
        // Declining, low-confidence, predicted degradation, below target
        let declining: Vec<f64> = (0..4).map(|i| 0.92 - 0.05 * i as f64).collect();
        let daily = series(&declining);
        let quality = quality_trend(&daily);
        let forecast = crate::predict::Predictor::forecast(&daily, 0.90);
        let risk = assess_risk(&quality, &forecast, 0.90);

        assert_eq!(risk.risk_level, RiskLevel::High);
        assert!(risk.needs_immediate_action);
        for factor in [
            "declining_quality_trend",
            "insufficient_data_confidence",
            "predicted_quality_degradation",
            "current_quality_below_threshold",
        ] {
            assert!(
                risk.risk_factors.iter().any(|f| f == factor),
                "missing {}",
                factor
            );
        }
        assert!(risk
            .recommendations
            .contains(&"Execute emergency optimization".to_string()));
    }

    #[test]
    fn test_healthy_system_is_minimal_risk() {
        let daily = series(&[0.95; 14]);
        let quality = quality_trend(&daily);
        let forecast = crate::predict::Predictor::forecast(&daily, 0.90);
        let risk = assess_risk(&quality, &forecast, 0.90);

        assert_eq!(risk.risk_level, RiskLevel::Minimal);
        assert!(risk.risk_factors.is_empty());
        assert!(risk.recommendations.is_empty());
    }

    #[test]
    fn test_report_composes_sections() {
        let daily = series(&[0.9, 0.9, 0.9]);
        let metrics = vec![metric(150, 0.01, 50)];
        let report = report(&metrics, &daily, 0.90);
        assert_eq!(report.latency.sample_size, 1);
        assert_eq!(report.quality.data_points, 3);
        assert_eq!(report.forecast.data_points, 3);
    }
}
