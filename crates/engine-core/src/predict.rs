//! Quality forecasting from the daily rolling series.
//!
//! Fits an ordinary-least-squares slope over (day index, mean quality)
//! and projects 7 and 30 days ahead, clamped into [0, 1].

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Slope magnitudes below this count as stable.
const STABLE_SLOPE: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
    InsufficientData,
}

/// A quality forecast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forecast {
    pub trend: Trend,
    pub slope_per_day: f64,
    pub predicted_quality_7d: f64,
    pub predicted_quality_30d: f64,
    pub needs_intervention: bool,
    pub confidence: f64,
    pub data_points: usize,
}

impl Forecast {
    fn insufficient() -> Self {
        Self {
            trend: Trend::InsufficientData,
            slope_per_day: 0.0,
            predicted_quality_7d: 0.0,
            predicted_quality_30d: 0.0,
            needs_intervention: false,
            confidence: 0.0,
            data_points: 0,
        }
    }
}

pub struct Predictor;

impl Predictor {
    /// Forecast from a daily series (oldest first, as produced by the
    /// rolling aggregates). `target` is the quality the 7-day projection
    /// must stay above to avoid intervention.
    pub fn forecast(daily: &[(NaiveDate, f64)], target: f64) -> Forecast {
        if daily.len() < 2 {
            let mut forecast = Forecast::insufficient();
            forecast.data_points = daily.len();
            return forecast;
        }

        let slope = ols_slope(daily);
        let last = daily[daily.len() - 1].1;

        let predicted_7d = (last + 7.0 * slope).clamp(0.0, 1.0);
        let predicted_30d = (last + 30.0 * slope).clamp(0.0, 1.0);

        let trend = classify_slope(slope, STABLE_SLOPE);

        Forecast {
            trend,
            slope_per_day: slope,
            predicted_quality_7d: predicted_7d,
            predicted_quality_30d: predicted_30d,
            needs_intervention: predicted_7d < target,
            confidence: (daily.len() as f64 / 10.0).min(1.0),
            data_points: daily.len(),
        }
    }
}

/// Slope direction with a configurable stability band.
pub(crate) fn classify_slope(slope: f64, stable_band: f64) -> Trend {
    if slope > stable_band {
        Trend::Improving
    } else if slope < -stable_band {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

/// OLS slope over (index, quality) pairs.
pub(crate) fn ols_slope(daily: &[(NaiveDate, f64)]) -> f64 {
    let n = daily.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = daily.iter().map(|(_, q)| q).sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, (_, quality)) in daily.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (quality - mean_y);
        denominator += dx * dx;
    }

    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}
