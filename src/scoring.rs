// Consensus and confidence scoring over same-instant readings
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::models::{unit_interval, ConfidenceScore, OracleReading};
use crate::stats;

/// Tunable weights and breakpoints for confidence scoring.
///
/// The defaults are the calibrated production values; deployments may
/// recalibrate them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub consensus_weight: f64,
    pub quality_weight: f64,
    pub reliability_weight: f64,
    /// Consensus credited to a lone reading
    pub single_source_consensus: f64,
    pub default_reliability: f64,
    pub self_confidence_weight: f64,
    pub freshness_weight: f64,
    pub completeness_weight: f64,
    /// Source count that earns full completeness credit
    pub full_completeness_sources: usize,
    /// Relative distance from the median counted as agreement
    pub agreement_tolerance: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            consensus_weight: 0.4,
            quality_weight: 0.3,
            reliability_weight: 0.3,
            single_source_consensus: 0.5,
            default_reliability: 0.7,
            self_confidence_weight: 0.5,
            freshness_weight: 0.3,
            completeness_weight: 0.2,
            full_completeness_sources: 5,
            agreement_tolerance: 0.10,
        }
    }
}

pub struct ConfidenceScorer {
    policy: ScoringPolicy,
}

impl ConfidenceScorer {
    pub fn new() -> Self {
        Self {
            policy: ScoringPolicy::default(),
        }
    }

    pub fn with_policy(policy: ScoringPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    pub fn score(&self, readings: &[OracleReading], historical_reliability: Option<f64>) -> ConfidenceScore {
        self.score_at(readings, historical_reliability, Utc::now())
    }

    pub fn score_at(
        &self,
        readings: &[OracleReading],
        historical_reliability: Option<f64>,
        now: DateTime<Utc>,
    ) -> ConfidenceScore {
        if readings.is_empty() {
            return ConfidenceScore::empty("No readings available; confidence is zero");
        }

        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();
        let median = stats::median(&values);

        let consensus = self.consensus_score(&values);
        let quality = self.quality_score(readings, now);
        let reliability = historical_reliability
            .filter(|r| r.is_finite())
            .unwrap_or(self.policy.default_reliability)
            .clamp(0.0, 1.0);

        let raw = self.policy.consensus_weight * consensus
            + self.policy.quality_weight * quality
            + self.policy.reliability_weight * reliability;
        let overall = (raw.clamp(0.0, 1.0) * 1000.0).round() / 1000.0;

        let agreeing: Vec<&OracleReading> = readings
            .iter()
            .filter(|r| stats::relative_deviation(r.value, median) <= self.policy.agreement_tolerance)
            .collect();
        let agreement_rate = agreeing.len() as f64 / readings.len() as f64 * 100.0;

        let consensus_value = weighted_value(&agreeing).unwrap_or(median);
        let explanation = explain(overall, consensus, readings.len());

        debug!(
            "Scored {} readings: overall {:.3} (consensus {:.3}, quality {:.3}, reliability {:.3})",
            readings.len(),
            overall,
            consensus,
            quality,
            reliability
        );

        ConfidenceScore {
            overall_confidence: overall,
            consensus_score: consensus,
            quality_score: quality,
            reliability_score: reliability,
            consensus_value: Some(consensus_value),
            reading_count: readings.len(),
            agreement_rate,
            explanation,
            timestamp: now,
        }
    }

    /// Agreement between sources, from the coefficient of variation
    pub fn consensus_score(&self, values: &[f64]) -> f64 {
        match values.len() {
            0 => 0.0,
            1 => self.policy.single_source_consensus,
            _ => {
                let mean = stats::mean(values);
                let std_dev = stats::variance(values, mean).sqrt();
                let cv = if mean.abs() < f64::EPSILON {
                    if std_dev < f64::EPSILON {
                        0.0
                    } else {
                        f64::INFINITY
                    }
                } else {
                    std_dev / mean.abs()
                };
                consensus_from_cv(cv)
            }
        }
    }

    fn quality_score(&self, readings: &[OracleReading], now: DateTime<Utc>) -> f64 {
        let avg_confidence =
            readings.iter().map(|r| unit_interval(r.confidence)).sum::<f64>() / readings.len() as f64;

        let oldest = readings.iter().map(|r| r.timestamp).min().unwrap_or(now);
        let freshness = freshness_score((now - oldest).num_milliseconds());

        let completeness =
            (readings.len() as f64 / self.policy.full_completeness_sources.max(1) as f64).min(1.0);

        self.policy.self_confidence_weight * avg_confidence
            + self.policy.freshness_weight * freshness
            + self.policy.completeness_weight * completeness
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new()
    }
}

/// Piecewise-linear, continuous and non-increasing in `cv`
pub fn consensus_from_cv(cv: f64) -> f64 {
    if cv.is_nan() {
        return 0.0;
    }
    if cv < 0.05 {
        1.0 - (cv / 0.05) * 0.05
    } else if cv < 0.15 {
        0.95 - ((cv - 0.05) / 0.10) * 0.15
    } else if cv < 0.30 {
        0.8 - ((cv - 0.15) / 0.15) * 0.3
    } else {
        (0.5 - (cv - 0.30)).max(0.0)
    }
}

pub fn freshness_score(age_ms: i64) -> f64 {
    const MINUTE_MS: i64 = 60_000;
    let age_ms = age_ms.max(0);
    if age_ms < MINUTE_MS {
        1.0
    } else if age_ms < 5 * MINUTE_MS {
        0.9
    } else if age_ms < 15 * MINUTE_MS {
        0.7
    } else if age_ms < 60 * MINUTE_MS {
        0.5
    } else {
        0.3
    }
}

pub fn confidence_tier(confidence: f64) -> &'static str {
    if confidence >= 0.9 {
        "Excellent"
    } else if confidence >= 0.8 {
        "High"
    } else if confidence >= 0.7 {
        "Good"
    } else if confidence >= 0.6 {
        "Moderate"
    } else if confidence >= 0.5 {
        "Fair"
    } else {
        "Low"
    }
}

/// Exponentially weighted mean of past confidences, oldest first, with the
/// newest weighted highest.
pub fn aggregate_over_time(scores: &[f64], decay_factor: f64) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let decay = decay_factor.clamp(f64::EPSILON, 1.0);

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    let mut weight = 1.0;
    for score in scores.iter().rev() {
        weighted_sum += score * weight;
        total_weight += weight;
        weight *= decay;
    }
    Some((weighted_sum / total_weight).clamp(0.0, 1.0))
}

fn weighted_value(readings: &[&OracleReading]) -> Option<f64> {
    let total_weight: f64 = readings.iter().map(|r| unit_interval(r.confidence)).sum();
    if total_weight <= 0.0 {
        return None;
    }
    Some(readings.iter().map(|r| r.value * unit_interval(r.confidence)).sum::<f64>() / total_weight)
}

fn explain(overall: f64, consensus: f64, count: usize) -> String {
    let mut factors = Vec::new();
    if count == 1 {
        factors.push("single data source limits consensus".to_string());
    } else if consensus >= 0.9 {
        factors.push(format!("strong consensus across {} data sources", count));
    } else if consensus < 0.5 {
        factors.push(format!("weak consensus across {} data sources", count));
    } else {
        factors.push(format!("moderate agreement across {} data sources", count));
    }
    if count >= 5 {
        factors.push("broad source coverage".to_string());
    } else if count > 1 && count < 3 {
        factors.push("limited number of sources".to_string());
    }

    format!(
        "{} confidence ({:.3}): {}",
        confidence_tier(overall),
        overall,
        factors.join("; ")
    )
}
