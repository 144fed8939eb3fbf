// Provider performance tracking and anomaly detection
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::config::QualityConfig;
use crate::lock;
use crate::models::{
    ema, AnomalyKind, DataAnomaly, FeedPerformanceMetrics, OracleReading, QualityRating, Severity,
};
use crate::stats;

/// Outlier detection needs at least this many historical samples
pub const MIN_HISTORY_SAMPLES: usize = 10;

const DEFAULT_RELIABILITY_SMOOTHING: f64 = 0.1;

pub struct DataQualityTracker {
    config: QualityConfig,
    smoothing: f64,
    metrics: Mutex<HashMap<String, FeedPerformanceMetrics>>,
    anomalies: Mutex<VecDeque<DataAnomaly>>,
}

impl DataQualityTracker {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            smoothing: DEFAULT_RELIABILITY_SMOOTHING,
            metrics: Mutex::new(HashMap::new()),
            anomalies: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_reliability_smoothing(mut self, smoothing: f64) -> Self {
        self.smoothing = smoothing.clamp(f64::EPSILON, 1.0);
        self
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn record_success(&self, provider_id: &str, response_time_ms: f64) -> FeedPerformanceMetrics {
        let mut metrics = lock(&self.metrics);
        let entry = metrics
            .entry(provider_id.to_string())
            .or_insert_with(|| FeedPerformanceMetrics::new(provider_id));

        entry.total_requests += 1;
        let n = entry.total_requests as f64;
        entry.avg_response_time_ms = (entry.avg_response_time_ms * (n - 1.0) + response_time_ms.max(0.0)) / n;
        entry.reliability = ema(entry.reliability, true, self.smoothing);
        refresh(entry);

        debug!(
            "{}: success in {:.0}ms (success rate {:.1}%, {:?})",
            provider_id,
            response_time_ms,
            entry.success_rate * 100.0,
            entry.quality
        );
        entry.clone()
    }

    /// Records a failed request and returns the resulting `missing_data` anomaly
    pub fn record_failure(&self, provider_id: &str, error: &str) -> DataAnomaly {
        let (failure_ratio, failed, total) = {
            let mut metrics = lock(&self.metrics);
            let entry = metrics
                .entry(provider_id.to_string())
                .or_insert_with(|| FeedPerformanceMetrics::new(provider_id));

            entry.total_requests += 1;
            entry.failed_requests += 1;
            entry.reliability = ema(entry.reliability, false, self.smoothing);
            refresh(entry);
            (entry.failure_rate(), entry.failed_requests, entry.total_requests)
        };

        let severity = if failure_ratio > 0.5 {
            Severity::Critical
        } else if failure_ratio > 0.2 {
            Severity::High
        } else if failure_ratio > 0.1 {
            Severity::Medium
        } else {
            Severity::Low
        };

        warn!("{}: request failed ({}/{} failed): {}", provider_id, failed, total, error);

        let anomaly = DataAnomaly::new(
            AnomalyKind::MissingData,
            severity,
            provider_id,
            format!(
                "Request failed: {} ({:.1}% failure rate)",
                error,
                failure_ratio * 100.0
            ),
        );
        self.push_anomaly(anomaly.clone());
        anomaly
    }

    /// Z-score outlier check of `value` against `history` (oldest first).
    /// Returns `None` when there are fewer than ten samples or no variance.
    pub fn detect_anomaly(
        &self,
        provider_id: &str,
        value: f64,
        history: &[f64],
        threshold_std_devs: f64,
    ) -> Option<DataAnomaly> {
        if history.len() < MIN_HISTORY_SAMPLES {
            debug!(
                "{}: insufficient history for outlier detection ({} samples)",
                provider_id,
                history.len()
            );
            return None;
        }

        let mean = stats::mean(history);
        let std_dev = stats::variance(history, mean).sqrt();
        if std_dev < f64::EPSILON {
            debug!("{}: zero variance in history, skipping outlier detection", provider_id);
            return None;
        }

        if !value.is_finite() {
            warn!("{}: ignoring non-finite value in outlier detection", provider_id);
            return None;
        }
        let z_score = (value - mean).abs() / std_dev;
        if !z_score.is_finite() || z_score <= threshold_std_devs {
            return None;
        }

        let severity = if z_score > 5.0 {
            Severity::Critical
        } else if z_score > 4.0 {
            Severity::High
        } else if z_score > 3.0 {
            Severity::Medium
        } else {
            Severity::Low
        };

        let anomaly = DataAnomaly::new(
            AnomalyKind::Outlier,
            severity,
            provider_id,
            format!("Value {:.4} is {:.2} standard deviations from mean {:.4}", value, z_score, mean),
        )
        .with_values(value, mean);
        self.push_anomaly(anomaly.clone());
        Some(anomaly)
    }

    pub fn check_staleness(
        &self,
        provider_id: &str,
        last_update: DateTime<Utc>,
        max_staleness: Duration,
    ) -> Option<DataAnomaly> {
        self.check_staleness_at(provider_id, last_update, max_staleness, Utc::now())
    }

    pub fn check_staleness_at(
        &self,
        provider_id: &str,
        last_update: DateTime<Utc>,
        max_staleness: Duration,
        now: DateTime<Utc>,
    ) -> Option<DataAnomaly> {
        let age_ms = (now - last_update).num_milliseconds();
        let max_ms = max_staleness.num_milliseconds();
        if max_ms <= 0 || age_ms <= max_ms {
            return None;
        }

        let ratio = age_ms as f64 / max_ms as f64;
        let severity = if ratio >= 3.0 {
            Severity::Critical
        } else if ratio >= 2.0 {
            Severity::High
        } else if ratio >= 1.5 {
            Severity::Medium
        } else {
            Severity::Low
        };

        let anomaly = DataAnomaly::new(
            AnomalyKind::StaleData,
            severity,
            provider_id,
            format!("Data is {}s old (max {}s)", age_ms / 1000, max_ms / 1000),
        )
        .with_values(age_ms as f64, max_ms as f64);
        self.push_anomaly(anomaly.clone());
        Some(anomaly)
    }

    /// Flags `provider_id` when any of `values` deviates from their mean by
    /// more than `max_variation` (relative).
    pub fn check_consistency(
        &self,
        provider_id: &str,
        values: &[f64],
        max_variation: f64,
    ) -> Option<DataAnomaly> {
        if values.len() < 2 {
            return None;
        }

        let mean = stats::mean(values);
        let (worst, deviation) = values
            .iter()
            .map(|v| (*v, stats::relative_deviation(*v, mean)))
            .fold((mean, 0.0_f64), |acc, cur| if cur.1 > acc.1 { cur } else { acc });

        if deviation <= max_variation {
            return None;
        }

        let anomaly = DataAnomaly::new(
            AnomalyKind::InconsistentData,
            inconsistency_severity(deviation, max_variation),
            provider_id,
            format!(
                "Values deviate up to {:.1}% from mean {:.4} (max {:.1}%)",
                deviation * 100.0,
                mean,
                max_variation * 100.0
            ),
        )
        .with_values(worst, mean);
        self.push_anomaly(anomaly.clone());
        Some(anomaly)
    }

    /// Attributes inconsistency to each provider whose reading deviates from
    /// the batch median by more than `max_variation`.
    pub fn check_reading_consistency(
        &self,
        readings: &[OracleReading],
        max_variation: f64,
    ) -> Vec<DataAnomaly> {
        if readings.len() < 2 {
            return Vec::new();
        }

        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();
        let median = stats::median(&values);

        let mut found = Vec::new();
        for reading in readings {
            let deviation = stats::relative_deviation(reading.value, median);
            if deviation <= max_variation {
                continue;
            }
            let anomaly = DataAnomaly::new(
                AnomalyKind::InconsistentData,
                inconsistency_severity(deviation, max_variation),
                &reading.provider_id,
                format!(
                    "Reading {:.4} deviates {:.1}% from peer median {:.4}",
                    reading.value,
                    deviation * 100.0,
                    median
                ),
            )
            .with_values(reading.value, median);
            self.push_anomaly(anomaly.clone());
            found.push(anomaly);
        }
        found
    }

    /// Enforces the anomaly history cap, returning how many were dropped
    pub fn cleanup(&self) -> usize {
        let mut anomalies = lock(&self.anomalies);
        let excess = anomalies.len().saturating_sub(self.config.max_anomaly_history);
        anomalies.truncate(self.config.max_anomaly_history);
        excess
    }

    pub fn metrics(&self, provider_id: &str) -> Option<FeedPerformanceMetrics> {
        lock(&self.metrics).get(provider_id).cloned()
    }

    pub fn all_metrics(&self) -> Vec<FeedPerformanceMetrics> {
        let mut all: Vec<_> = lock(&self.metrics).values().cloned().collect();
        all.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        all
    }

    pub fn reliability(&self, provider_id: &str) -> Option<f64> {
        lock(&self.metrics).get(provider_id).map(|m| m.reliability)
    }

    pub fn average_reliability(&self) -> Option<f64> {
        let metrics = lock(&self.metrics);
        if metrics.is_empty() {
            return None;
        }
        Some(metrics.values().map(|m| m.reliability).sum::<f64>() / metrics.len() as f64)
    }

    /// Most recent first
    pub fn recent_anomalies(&self, limit: usize) -> Vec<DataAnomaly> {
        lock(&self.anomalies).iter().take(limit).cloned().collect()
    }

    pub fn anomalies_for(&self, provider_id: &str) -> Vec<DataAnomaly> {
        lock(&self.anomalies)
            .iter()
            .filter(|a| a.provider_id == provider_id)
            .cloned()
            .collect()
    }

    pub fn anomaly_count(&self) -> usize {
        lock(&self.anomalies).len()
    }

    /// Clears metrics for one provider, or everything when `None`
    pub fn reset(&self, provider_id: Option<&str>) {
        match provider_id {
            Some(id) => {
                lock(&self.metrics).remove(id);
                lock(&self.anomalies).retain(|a| a.provider_id != id);
            }
            None => {
                lock(&self.metrics).clear();
                lock(&self.anomalies).clear();
            }
        }
    }

    /// Metrics for an external store to persist across restarts
    pub fn snapshot(&self) -> Vec<FeedPerformanceMetrics> {
        self.all_metrics()
    }

    pub fn restore(&self, snapshot: Vec<FeedPerformanceMetrics>) {
        let mut metrics = lock(&self.metrics);
        for mut entry in snapshot {
            entry.reliability = entry.reliability.clamp(0.0, 1.0);
            entry.failed_requests = entry.failed_requests.min(entry.total_requests);
            refresh(&mut entry);
            metrics.insert(entry.provider_id.clone(), entry);
        }
    }

    fn push_anomaly(&self, anomaly: DataAnomaly) {
        let mut anomalies = lock(&self.anomalies);
        anomalies.push_front(anomaly);
        anomalies.truncate(self.config.max_anomaly_history);
    }
}

impl Default for DataQualityTracker {
    fn default() -> Self {
        Self::new(QualityConfig::default())
    }
}

pub fn rate_quality(success_rate: f64, avg_response_time_ms: f64) -> QualityRating {
    if success_rate >= 0.99 && avg_response_time_ms < 1_000.0 {
        QualityRating::Excellent
    } else if success_rate >= 0.95 && avg_response_time_ms < 3_000.0 {
        QualityRating::Good
    } else if success_rate >= 0.90 && avg_response_time_ms < 5_000.0 {
        QualityRating::Fair
    } else {
        QualityRating::Poor
    }
}

fn refresh(entry: &mut FeedPerformanceMetrics) {
    entry.success_rate = if entry.total_requests == 0 {
        1.0
    } else {
        (entry.total_requests - entry.failed_requests) as f64 / entry.total_requests as f64
    };
    entry.quality = rate_quality(entry.success_rate, entry.avg_response_time_ms);
    entry.last_update = Utc::now();
}

fn inconsistency_severity(deviation: f64, max_variation: f64) -> Severity {
    let excess = deviation / max_variation;
    if excess >= 3.0 {
        Severity::Critical
    } else if excess >= 2.0 {
        Severity::High
    } else if excess >= 1.5 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady_history() -> Vec<f64> {
        vec![100.0, 101.0, 99.0, 100.5, 99.5, 100.0, 101.0, 99.0, 100.5, 99.5]
    }

    #[test]
    fn test_running_average_response_time() {
        let tracker = DataQualityTracker::default();
        tracker.record_success("p1", 100.0);
        tracker.record_success("p1", 200.0);
        let metrics = tracker.record_success("p1", 300.0);

        assert_eq!(metrics.total_requests, 3);
        assert!((metrics.avg_response_time_ms - 200.0).abs() < 1e-9);
        assert_eq!(metrics.quality, QualityRating::Excellent);

        // Failures count toward n without contributing a sample
        let tracker = DataQualityTracker::default();
        tracker.record_failure("p1", "timeout");
        let metrics = tracker.record_success("p1", 100.0);
        assert_eq!(metrics.total_requests, 2);
        assert!((metrics.avg_response_time_ms - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_severity_follows_ratio() {
        let tracker = DataQualityTracker::default();
        for _ in 0..9 {
            tracker.record_success("p1", 50.0);
        }
        // 1 of 10 failed: 10% is not above 10%
        assert_eq!(tracker.record_failure("p1", "timeout").severity, Severity::Low);
        // 2 of 11
        assert_eq!(tracker.record_failure("p1", "timeout").severity, Severity::Medium);
        // 3 of 12 = 25%
        assert_eq!(tracker.record_failure("p1", "timeout").severity, Severity::High);

        let tracker = DataQualityTracker::default();
        let anomaly = tracker.record_failure("p2", "refused");
        assert_eq!(anomaly.kind, AnomalyKind::MissingData);
        assert_eq!(anomaly.severity, Severity::Critical);
    }

    #[test]
    fn test_quality_rating_bands() {
        assert_eq!(rate_quality(0.995, 500.0), QualityRating::Excellent);
        assert_eq!(rate_quality(0.995, 1_500.0), QualityRating::Good);
        assert_eq!(rate_quality(0.96, 500.0), QualityRating::Good);
        assert_eq!(rate_quality(0.92, 4_000.0), QualityRating::Fair);
        assert_eq!(rate_quality(0.92, 6_000.0), QualityRating::Poor);
        assert_eq!(rate_quality(0.5, 10.0), QualityRating::Poor);
    }

    #[test]
    fn test_reliability_converges_within_bounds() {
        let tracker = DataQualityTracker::default();
        for _ in 0..100 {
            tracker.record_failure("p1", "down");
            let r = tracker.reliability("p1").unwrap();
            assert!((0.0..=1.0).contains(&r));
        }
        assert!(tracker.reliability("p1").unwrap() < 0.001);

        for _ in 0..100 {
            tracker.record_success("p1", 10.0);
            let r = tracker.reliability("p1").unwrap();
            assert!((0.0..=1.0).contains(&r));
        }
        assert!(tracker.reliability("p1").unwrap() > 0.999);
    }

    #[test]
    fn test_outlier_requires_minimum_history() {
        let tracker = DataQualityTracker::default();
        let short = &steady_history()[..9];
        assert!(tracker.detect_anomaly("p1", 1_000_000.0, short, 3.0).is_none());
        assert_eq!(tracker.anomaly_count(), 0);
    }

    #[test]
    fn test_outlier_severity() {
        let tracker = DataQualityTracker::default();
        let history = steady_history();
        let std_dev = stats::std_dev(&history);
        let mean = stats::mean(&history);

        assert!(tracker.detect_anomaly("p1", mean + 2.0 * std_dev, &history, 3.0).is_none());

        let medium = tracker.detect_anomaly("p1", mean + 3.5 * std_dev, &history, 3.0).unwrap();
        assert_eq!(medium.severity, Severity::Medium);
        assert_eq!(medium.kind, AnomalyKind::Outlier);

        let high = tracker.detect_anomaly("p1", mean - 4.5 * std_dev, &history, 3.0).unwrap();
        assert_eq!(high.severity, Severity::High);

        let critical = tracker.detect_anomaly("p1", mean + 50.0 * std_dev, &history, 3.0).unwrap();
        assert_eq!(critical.severity, Severity::Critical);
        assert_eq!(critical.expected_value, Some(mean));
    }

    #[test]
    fn test_outlier_below_default_threshold_is_low() {
        let tracker = DataQualityTracker::default();
        let history = steady_history();
        let std_dev = stats::std_dev(&history);
        let mean = stats::mean(&history);
        let anomaly = tracker.detect_anomaly("p1", mean + 2.5 * std_dev, &history, 2.0).unwrap();
        assert_eq!(anomaly.severity, Severity::Low);
    }

    #[test]
    fn test_non_finite_value_is_not_an_outlier() {
        let tracker = DataQualityTracker::default();
        let history = steady_history();
        assert!(tracker.detect_anomaly("p1", f64::NAN, &history, 3.0).is_none());
        assert!(tracker.detect_anomaly("p1", f64::INFINITY, &history, 3.0).is_none());
        assert_eq!(tracker.anomaly_count(), 0);
    }

    #[test]
    fn test_staleness_bands() {
        let tracker = DataQualityTracker::default();
        let now = Utc::now();
        let max = Duration::seconds(60);

        assert!(tracker.check_staleness_at("p1", now - Duration::seconds(30), max, now).is_none());
        let cases = [
            (70, Severity::Low),
            (100, Severity::Medium),
            (150, Severity::High),
            (200, Severity::Critical),
        ];
        for (age, expected) in cases {
            let anomaly = tracker
                .check_staleness_at("p1", now - Duration::seconds(age), max, now)
                .unwrap();
            assert_eq!(anomaly.kind, AnomalyKind::StaleData);
            assert_eq!(anomaly.severity, expected, "age {}s", age);
        }
    }

    #[test]
    fn test_consistency_within_tolerance() {
        let tracker = DataQualityTracker::default();
        assert!(tracker.check_consistency("p1", &[100.0, 102.0, 98.0], 0.15).is_none());
        assert!(tracker.check_consistency("p1", &[100.0], 0.15).is_none());
    }

    #[test]
    fn test_consistency_flags_divergent_values() {
        let tracker = DataQualityTracker::default();
        let anomaly = tracker.check_consistency("p3", &[500.0, 100.0, 102.0], 0.15).unwrap();
        assert_eq!(anomaly.kind, AnomalyKind::InconsistentData);
        assert_eq!(anomaly.provider_id, "p3");
        assert_eq!(anomaly.observed_value, Some(500.0));
        assert!(anomaly.severity >= Severity::High);
    }

    #[test]
    fn test_reading_consistency_blames_outlier_only() {
        let tracker = DataQualityTracker::default();
        let readings = vec![
            OracleReading::new("p1", 100.0),
            OracleReading::new("p2", 102.0),
            OracleReading::new("p3", 500.0),
        ];
        let anomalies = tracker.check_reading_consistency(&readings, 0.15);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].provider_id, "p3");
        assert!(anomalies[0].severity >= Severity::High);
        // 500 vs median 102 is a 390% deviation
        assert!(anomalies[0].description.contains("390"));
    }

    #[test]
    fn test_anomaly_history_is_bounded_and_newest_first() {
        let config = QualityConfig {
            max_anomaly_history: 5,
            ..Default::default()
        };
        let tracker = DataQualityTracker::new(config);
        for i in 0..8 {
            tracker.record_failure(&format!("p{}", i), "down");
        }
        assert_eq!(tracker.anomaly_count(), 5);
        assert_eq!(tracker.cleanup(), 0);

        let recent = tracker.recent_anomalies(2);
        assert_eq!(recent[0].provider_id, "p7");
        assert_eq!(recent[1].provider_id, "p6");
    }

    #[test]
    fn test_snapshot_restore_roundtrip_preserves_reliability() {
        let tracker = DataQualityTracker::default();
        tracker.record_success("p1", 100.0);
        tracker.record_failure("p1", "down");
        let snapshot = tracker.snapshot();

        let restored = DataQualityTracker::default();
        restored.restore(snapshot);
        let metrics = restored.metrics("p1").unwrap();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(restored.reliability("p1"), tracker.reliability("p1"));
    }

    #[test]
    fn test_reset_single_provider() {
        let tracker = DataQualityTracker::default();
        tracker.record_failure("p1", "down");
        tracker.record_failure("p2", "down");
        tracker.reset(Some("p1"));
        assert!(tracker.metrics("p1").is_none());
        assert!(tracker.anomalies_for("p1").is_empty());
        assert_eq!(tracker.anomalies_for("p2").len(), 1);
    }
}
