// One monitoring round: fetch, track quality, score, alert
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::alerts::AlertSystem;
use crate::config::OracleConfig;
use crate::connection::ConnectionManager;
use crate::error::{OracleError, Result};
use crate::lock;
use crate::models::{Alert, ConfidenceScore, ConnectionStatus, DataAnomaly, OracleReading};
use crate::provider::DataProvider;
use crate::quality::DataQualityTracker;
use crate::scoring::{aggregate_over_time, ConfidenceScorer};

/// Decay applied to past round confidences when deriving reliability
const CONFIDENCE_DECAY: f64 = 0.95;

#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub score: ConfidenceScore,
    pub readings: Vec<OracleReading>,
    pub anomalies: Vec<DataAnomaly>,
    pub alerts: Vec<Alert>,
    /// (endpoint id, error) for every provider that did not answer
    pub failures: Vec<(String, String)>,
    pub connection: ConnectionStatus,
}

pub struct OracleMonitor {
    connections: Arc<ConnectionManager>,
    tracker: Arc<DataQualityTracker>,
    alerts: Arc<AlertSystem>,
    scorer: ConfidenceScorer,
    max_staleness: Duration,
    max_variation: f64,
    outlier_threshold: f64,
    history_limit: usize,
    values: Mutex<HashMap<String, VecDeque<f64>>>,
    confidences: Mutex<VecDeque<f64>>,
}

impl OracleMonitor {
    pub fn new(config: &OracleConfig, provider: Arc<dyn DataProvider>) -> Result<Self> {
        let tracker = Arc::new(
            DataQualityTracker::new(config.quality.clone())
                .with_reliability_smoothing(config.connection.reliability_smoothing),
        );
        let alerts = Arc::new(AlertSystem::new(config.alerts.clone()));
        let connections = ConnectionManager::new(config, provider, Arc::clone(&tracker), Arc::clone(&alerts))?;
        Ok(Self {
            connections,
            tracker,
            alerts,
            scorer: ConfidenceScorer::with_policy(config.scoring.clone()),
            max_staleness: Duration::milliseconds(config.quality.max_staleness_ms),
            max_variation: config.quality.max_variation,
            outlier_threshold: config.quality.outlier_threshold_std_devs,
            history_limit: config.quality.max_value_history,
            values: Mutex::new(HashMap::new()),
            confidences: Mutex::new(VecDeque::new()),
        })
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn tracker(&self) -> &Arc<DataQualityTracker> {
        &self.tracker
    }

    pub fn alerts(&self) -> &Arc<AlertSystem> {
        &self.alerts
    }

    pub async fn start(&self) -> Result<ConnectionStatus> {
        self.connections.connect().await
    }

    pub async fn shutdown(&self) {
        self.connections.disconnect().await;
    }

    /// Fetch from every endpoint and evaluate the batch
    pub async fn run_round(&self) -> RoundReport {
        let batch = self.connections.fetch_all().await;
        self.evaluate(&batch.readings, &batch.failures)
    }

    pub fn evaluate(&self, readings: &[OracleReading], failures: &[(String, OracleError)]) -> RoundReport {
        self.evaluate_at(readings, failures, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        readings: &[OracleReading],
        failures: &[(String, OracleError)],
        now: DateTime<Utc>,
    ) -> RoundReport {
        let mut anomalies = Vec::new();

        for reading in readings {
            if let Some(stale) =
                self.tracker
                    .check_staleness_at(&reading.provider_id, reading.timestamp, self.max_staleness, now)
            {
                anomalies.push(stale);
            }

            let history: Vec<f64> = {
                let mut values = lock(&self.values);
                let series = values.entry(reading.provider_id.clone()).or_default();
                let previous = series.iter().copied().collect();
                series.push_back(reading.value);
                while series.len() > self.history_limit {
                    series.pop_front();
                }
                previous
            };
            if let Some(outlier) =
                self.tracker
                    .detect_anomaly(&reading.provider_id, reading.value, &history, self.outlier_threshold)
            {
                anomalies.push(outlier);
            }
        }

        anomalies.extend(self.tracker.check_reading_consistency(readings, self.max_variation));

        let historical = self.historical_reliability();
        let score = self.scorer.score_at(readings, historical, now);
        if score.reading_count > 0 {
            let mut confidences = lock(&self.confidences);
            confidences.push_back(score.overall_confidence);
            while confidences.len() > self.history_limit {
                confidences.pop_front();
            }
        }

        let mut alerts = Vec::new();
        for endpoint in self.connections.endpoints() {
            if let Some(metrics) = self.tracker.metrics(&endpoint.id) {
                alerts.extend(self.alerts.check_feed_failure_at(&endpoint.id, &metrics, now));
                alerts.extend(self.alerts.check_performance_at(&endpoint.id, &metrics, now));
            }
        }
        for anomaly in &anomalies {
            alerts.extend(self.alerts.check_anomaly_at(anomaly, now));
        }
        alerts.extend(self.alerts.check_confidence_at(&score, now));

        if failures.is_empty() {
            info!("Round complete: {}", score.explanation);
        } else {
            warn!(
                "Round complete with {} failed providers: {}",
                failures.len(),
                score.explanation
            );
        }

        RoundReport {
            score,
            readings: readings.to_vec(),
            anomalies,
            alerts,
            failures: failures
                .iter()
                .map(|(id, e)| (id.clone(), e.to_string()))
                .collect(),
            connection: self.connections.status(),
        }
    }

    /// Decayed average of past round confidence, else tracker reliability
    pub fn historical_reliability(&self) -> Option<f64> {
        let past: Vec<f64> = lock(&self.confidences).iter().copied().collect();
        aggregate_over_time(&past, CONFIDENCE_DECAY).or_else(|| self.tracker.average_reliability())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertType, AnomalyKind, ProviderEndpoint, Severity};
    use crate::provider::SimulatedProvider;

    fn config() -> OracleConfig {
        let mut config = OracleConfig::with_endpoints(
            vec![
                ProviderEndpoint::primary("p1", "sim://p1"),
                ProviderEndpoint::primary("p2", "sim://p2"),
            ],
            vec![ProviderEndpoint::backup("b1", "sim://b1")],
        );
        config.connection.connect_timeout_ms = 50;
        config.connection.health_check_interval_ms = 60_000;
        config
    }

    fn monitor(provider: Arc<SimulatedProvider>) -> OracleMonitor {
        OracleMonitor::new(&config(), provider).unwrap()
    }

    #[tokio::test]
    async fn test_round_over_agreeing_providers() {
        let provider = Arc::new(
            SimulatedProvider::new()
                .with_fixed_feed("p1", 100.0, 0.9)
                .with_fixed_feed("p2", 101.0, 0.9)
                .with_fixed_feed("b1", 99.0, 0.9),
        );
        let monitor = monitor(provider);

        let report = monitor.run_round().await;
        assert_eq!(report.score.reading_count, 3);
        assert_eq!(report.score.agreement_rate, 100.0);
        assert!(report.score.consensus_score > 0.95);
        assert!(report.anomalies.is_empty());
        assert!(report.failures.is_empty());
        assert!(report.alerts.is_empty());
        assert_eq!(report.score.consensus_value.map(|v| v.round()), Some(100.0));
    }

    #[tokio::test]
    async fn test_round_reports_failed_provider() {
        let provider = Arc::new(
            SimulatedProvider::new()
                .with_fixed_feed("p1", 100.0, 0.9)
                .with_fixed_feed("p2", 101.0, 0.9)
                .with_fixed_feed("b1", 99.0, 0.9),
        );
        provider.fail("p2");
        let monitor = monitor(provider);

        let report = monitor.run_round().await;
        assert_eq!(report.score.reading_count, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "p2");
        assert!(report
            .alerts
            .iter()
            .any(|a| a.alert_type == AlertType::FeedFailure && a.provider_id.as_deref() == Some("p2")));
    }

    #[tokio::test]
    async fn test_outlier_detected_after_history_builds() {
        let provider = Arc::new(
            SimulatedProvider::new()
                .with_feed("p1", 100.0, 0.9)
                .with_feed("p2", 100.0, 0.9)
                .with_feed("b1", 100.0, 0.9),
        );
        let monitor = monitor(provider.clone());
        for _ in 0..12 {
            let report = monitor.run_round().await;
            assert!(report.anomalies.iter().all(|a| a.kind != AnomalyKind::Outlier));
        }

        provider.set_feed("p1", 200.0, 0.9, 0.0);
        let report = monitor.run_round().await;
        let outlier = report
            .anomalies
            .iter()
            .find(|a| a.kind == AnomalyKind::Outlier)
            .unwrap();
        assert_eq!(outlier.provider_id, "p1");
        assert_eq!(outlier.severity, Severity::Critical);
        assert!(report
            .anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::InconsistentData && a.provider_id == "p1"));
    }

    #[test]
    fn test_outlying_provider_flagged_inconsistent() {
        let monitor = monitor(Arc::new(SimulatedProvider::new()));
        let now = Utc::now();
        let readings = vec![
            OracleReading::new("p1", 500.0).with_timestamp(now),
            OracleReading::new("p2", 100.0).with_timestamp(now),
            OracleReading::new("b1", 102.0).with_timestamp(now),
        ];

        let report = monitor.evaluate_at(&readings, &[], now);
        let flagged: Vec<&DataAnomaly> = report
            .anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::InconsistentData)
            .collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].provider_id, "p1");
        assert!(flagged[0].severity >= Severity::High);
        assert!(report.alerts.iter().any(|a| a.alert_type == AlertType::Anomaly));
        assert!(report.score.agreement_rate < 100.0);
    }

    #[test]
    fn test_stale_reading_raises_alert() {
        let monitor = monitor(Arc::new(SimulatedProvider::new()));
        let now = Utc::now();
        let readings = vec![OracleReading::new("p1", 100.0).with_timestamp(now - Duration::minutes(11))];

        let report = monitor.evaluate_at(&readings, &[], now);
        let stale = report
            .anomalies
            .iter()
            .find(|a| a.kind == AnomalyKind::StaleData)
            .unwrap();
        assert_eq!(stale.severity, Severity::High);
        assert!(report.alerts.iter().any(|a| a.alert_type == AlertType::Anomaly));
    }

    #[test]
    fn test_empty_round_is_low_confidence() {
        let monitor = monitor(Arc::new(SimulatedProvider::new()));
        let report = monitor.evaluate(&[], &[]);
        assert_eq!(report.score.overall_confidence, 0.0);
        assert!(report
            .alerts
            .iter()
            .any(|a| a.alert_type == AlertType::LowConfidence));
        assert_eq!(monitor.historical_reliability(), None);
    }

    #[test]
    fn test_round_confidence_feeds_reliability() {
        let monitor = monitor(Arc::new(SimulatedProvider::new()));
        let now = Utc::now();
        let readings = vec![
            OracleReading::new("p1", 100.0).with_confidence(0.9).with_timestamp(now),
            OracleReading::new("p2", 102.0).with_confidence(0.9).with_timestamp(now),
            OracleReading::new("b1", 98.0).with_confidence(0.9).with_timestamp(now),
        ];

        let first = monitor.evaluate_at(&readings, &[], now);
        let reliability = monitor.historical_reliability().unwrap();
        assert!((reliability - first.score.overall_confidence).abs() < 1e-9);

        let second = monitor.evaluate_at(&readings, &[], now);
        assert!((second.score.reliability_score - first.score.overall_confidence).abs() < 1e-9);
    }
}
