// Alert generation, rate limiting and acknowledgment
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::config::AlertConfig;
use crate::lock;
use crate::models::{
    Alert, AlertType, ConfidenceScore, DataAnomaly, FeedPerformanceMetrics, ProviderEndpoint, ProviderTier,
    Severity,
};

const DISPATCH_CAPACITY: usize = 256;

/// Query filter; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub provider_id: Option<String>,
    pub alert_type: Option<AlertType>,
    pub severity: Option<Severity>,
    pub acknowledged: Option<bool>,
    pub limit: Option<usize>,
}

impl AlertFilter {
    fn matches(&self, alert: &Alert) -> bool {
        self.provider_id
            .as_ref()
            .map_or(true, |p| alert.provider_id.as_deref() == Some(p.as_str()))
            && self.alert_type.map_or(true, |t| alert.alert_type == t)
            && self.severity.map_or(true, |s| alert.severity == s)
            && self.acknowledged.map_or(true, |a| alert.acknowledged == a)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSummary {
    pub total: usize,
    pub unacknowledged: usize,
    pub by_severity: HashMap<Severity, usize>,
    pub by_type: HashMap<AlertType, usize>,
}

struct AlertLog {
    /// Most recent first
    history: VecDeque<Alert>,
    last_fired: HashMap<String, DateTime<Utc>>,
}

pub struct AlertSystem {
    config: AlertConfig,
    log: Mutex<AlertLog>,
    dispatch: broadcast::Sender<Alert>,
}

impl AlertSystem {
    pub fn new(config: AlertConfig) -> Self {
        let (dispatch, _) = broadcast::channel(DISPATCH_CAPACITY);
        Self {
            config,
            log: Mutex::new(AlertLog {
                history: VecDeque::new(),
                last_fired: HashMap::new(),
            }),
            dispatch,
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Stream of newly created alerts for the notification collaborator
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.dispatch.subscribe()
    }

    pub fn check_feed_failure(&self, provider_id: &str, metrics: &FeedPerformanceMetrics) -> Option<Alert> {
        self.check_feed_failure_at(provider_id, metrics, Utc::now())
    }

    pub fn check_feed_failure_at(
        &self,
        provider_id: &str,
        metrics: &FeedPerformanceMetrics,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let failure_rate = metrics.failure_rate();
        let threshold = self.config.failure_rate_threshold;
        if failure_rate <= threshold {
            return None;
        }

        let excess = ratio(failure_rate, threshold);
        let severity = if excess >= 5.0 {
            Severity::Critical
        } else if excess >= 3.0 {
            Severity::High
        } else if excess >= 1.5 {
            Severity::Medium
        } else {
            Severity::Low
        };

        let alert = Alert::new(
            AlertType::FeedFailure,
            severity,
            format!(
                "Feed {} failure rate {:.1}% exceeds {:.1}%",
                provider_id,
                failure_rate * 100.0,
                threshold * 100.0
            ),
        )
        .with_provider(provider_id)
        .with_details(json!({
            "failure_rate": failure_rate,
            "threshold": threshold,
            "failed_requests": metrics.failed_requests,
            "total_requests": metrics.total_requests,
        }));

        self.fire(
            Some((cooldown_key(provider_id, AlertType::FeedFailure, None), self.config.feed_failure_cooldown_ms)),
            alert,
            now,
        )
    }

    pub fn check_performance(&self, provider_id: &str, metrics: &FeedPerformanceMetrics) -> Option<Alert> {
        self.check_performance_at(provider_id, metrics, Utc::now())
    }

    pub fn check_performance_at(
        &self,
        provider_id: &str,
        metrics: &FeedPerformanceMetrics,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let response_time = metrics.avg_response_time_ms;
        let threshold = self.config.response_time_threshold_ms;
        if response_time <= threshold {
            return None;
        }

        let excess = ratio(response_time, threshold);
        let severity = if excess >= 3.0 {
            Severity::Critical
        } else if excess >= 2.0 {
            Severity::High
        } else if excess >= 1.5 {
            Severity::Medium
        } else {
            Severity::Low
        };

        let alert = Alert::new(
            AlertType::PerformanceDegradation,
            severity,
            format!(
                "Feed {} average response time {:.0}ms exceeds {:.0}ms",
                provider_id, response_time, threshold
            ),
        )
        .with_provider(provider_id)
        .with_details(json!({
            "avg_response_time_ms": response_time,
            "threshold_ms": threshold,
            "quality": metrics.quality,
        }));

        self.fire(
            Some((
                cooldown_key(provider_id, AlertType::PerformanceDegradation, None),
                self.config.performance_cooldown_ms,
            )),
            alert,
            now,
        )
    }

    pub fn check_anomaly(&self, anomaly: &DataAnomaly) -> Option<Alert> {
        self.check_anomaly_at(anomaly, Utc::now())
    }

    pub fn check_anomaly_at(&self, anomaly: &DataAnomaly, now: DateTime<Utc>) -> Option<Alert> {
        if anomaly.severity < self.config.min_anomaly_severity {
            return None;
        }

        let alert = Alert::new(
            AlertType::Anomaly,
            anomaly.severity,
            format!("{} anomaly on {}: {}", anomaly.kind, anomaly.provider_id, anomaly.description),
        )
        .with_provider(&anomaly.provider_id)
        .with_details(json!({
            "anomaly_id": anomaly.id,
            "kind": anomaly.kind,
            "observed_value": anomaly.observed_value,
            "expected_value": anomaly.expected_value,
        }));

        let kind = anomaly.kind.to_string();
        self.fire(
            Some((
                cooldown_key(&anomaly.provider_id, AlertType::Anomaly, Some(&kind)),
                self.config.anomaly_cooldown_ms,
            )),
            alert,
            now,
        )
    }

    pub fn check_confidence(&self, score: &ConfidenceScore) -> Option<Alert> {
        self.check_confidence_at(score, Utc::now())
    }

    pub fn check_confidence_at(&self, score: &ConfidenceScore, now: DateTime<Utc>) -> Option<Alert> {
        let threshold = self.config.min_confidence;
        if score.overall_confidence >= threshold {
            return None;
        }

        let excess = ratio(threshold, score.overall_confidence);
        let severity = if score.reading_count == 0 || excess >= 3.0 {
            Severity::Critical
        } else if excess >= 2.0 {
            Severity::High
        } else if excess >= 1.5 {
            Severity::Medium
        } else {
            Severity::Low
        };

        let alert = Alert::new(
            AlertType::LowConfidence,
            severity,
            format!(
                "Consensus confidence {:.3} below {:.3}: {}",
                score.overall_confidence, threshold, score.explanation
            ),
        )
        .with_details(json!({
            "overall_confidence": score.overall_confidence,
            "consensus_score": score.consensus_score,
            "quality_score": score.quality_score,
            "reliability_score": score.reliability_score,
            "reading_count": score.reading_count,
        }));

        self.fire(
            Some((cooldown_key("*", AlertType::LowConfidence, None), self.config.anomaly_cooldown_ms)),
            alert,
            now,
        )
    }

    /// Critical errors bypass rate limiting
    pub fn raise_critical(&self, message: &str, provider_id: Option<&str>, details: serde_json::Value) -> Alert {
        let mut alert = Alert::new(AlertType::CriticalError, Severity::Critical, message.to_string())
            .with_details(details);
        if let Some(provider_id) = provider_id {
            alert = alert.with_provider(provider_id);
        }
        self.record(alert)
    }

    /// Every failover is reported; backups raise the severity
    pub fn raise_failover(&self, from: Option<&str>, to: &ProviderEndpoint, reason: &str) -> Alert {
        let severity = match to.tier {
            ProviderTier::Backup => Severity::High,
            ProviderTier::Primary => Severity::Medium,
        };
        let message = match to.tier {
            ProviderTier::Backup => {
                format!("Primary unavailable, using backup {}: {}", to.id, reason)
            }
            ProviderTier::Primary => format!("Failed over to primary {}: {}", to.id, reason),
        };
        let alert = Alert::new(AlertType::Failover, severity, message)
            .with_provider(&to.id)
            .with_details(json!({
                "from": from,
                "to": to.id,
                "tier": to.tier,
                "reason": reason,
            }));
        self.record(alert)
    }

    /// Returns false only for unknown ids; the first acknowledgment is kept
    pub fn acknowledge(&self, alert_id: &str, who: &str) -> bool {
        let mut log = lock(&self.log);
        match log.history.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                if !alert.acknowledged {
                    alert.acknowledged = true;
                    alert.acknowledged_by = Some(who.to_string());
                    alert.acknowledged_at = Some(Utc::now());
                    info!("Alert {} acknowledged by {}", alert_id, who);
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, alert_id: &str) -> Option<Alert> {
        lock(&self.log).history.iter().find(|a| a.id == alert_id).cloned()
    }

    /// Most recent first
    pub fn alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let log = lock(&self.log);
        let matching = log.history.iter().filter(|a| filter.matches(a)).cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub fn unacknowledged(&self) -> Vec<Alert> {
        self.alerts(&AlertFilter {
            acknowledged: Some(false),
            ..Default::default()
        })
    }

    pub fn summary(&self) -> AlertSummary {
        let log = lock(&self.log);
        let mut by_severity = HashMap::new();
        let mut by_type = HashMap::new();
        let mut unacknowledged = 0;
        for alert in &log.history {
            *by_severity.entry(alert.severity).or_insert(0) += 1;
            *by_type.entry(alert.alert_type).or_insert(0) += 1;
            if !alert.acknowledged {
                unacknowledged += 1;
            }
        }
        AlertSummary {
            total: log.history.len(),
            unacknowledged,
            by_severity,
            by_type,
        }
    }

    pub fn clear_old_alerts(&self, older_than: Duration) -> usize {
        self.clear_old_alerts_at(older_than, Utc::now())
    }

    /// Prunes acknowledged alerts created before `now - older_than`
    pub fn clear_old_alerts_at(&self, older_than: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - older_than;
        let mut log = lock(&self.log);
        let before = log.history.len();
        log.history.retain(|a| !a.acknowledged || a.created_at >= cutoff);
        let removed = before - log.history.len();
        if removed > 0 {
            info!("Cleared {} acknowledged alerts older than {}", removed, cutoff);
        }
        removed
    }

    fn fire(&self, cooldown: Option<(String, i64)>, alert: Alert, now: DateTime<Utc>) -> Option<Alert> {
        if let Some((key, cooldown_ms)) = cooldown {
            let mut log = lock(&self.log);
            if let Some(last) = log.last_fired.get(&key) {
                if now - *last < Duration::milliseconds(cooldown_ms) {
                    debug!("Alert {} suppressed: in cooldown", key);
                    return None;
                }
            }
            log.last_fired.insert(key, now);
        }
        Some(self.record(alert.created_at(now)))
    }

    fn record(&self, alert: Alert) -> Alert {
        {
            let mut log = lock(&self.log);
            log.history.push_front(alert.clone());
            while log.history.len() > self.config.max_history {
                // Evict the oldest acknowledged alert before any open one
                match log.history.iter().rposition(|a| a.acknowledged) {
                    Some(index) => {
                        log.history.remove(index);
                    }
                    None => {
                        log.history.pop_back();
                    }
                }
            }
        }

        match alert.severity {
            Severity::Critical => error!("[{}] {}", alert.alert_type, alert.message),
            Severity::High => warn!("[{}] {}", alert.alert_type, alert.message),
            _ => info!("[{}] {}", alert.alert_type, alert.message),
        }

        // No subscribers is fine; history still has the alert
        let _ = self.dispatch.send(alert.clone());
        alert
    }
}

impl Default for AlertSystem {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}

fn cooldown_key(provider_id: &str, alert_type: AlertType, qualifier: Option<&str>) -> String {
    match qualifier {
        Some(q) => format!("{}:{}:{}", provider_id, alert_type, q),
        None => format!("{}:{}", provider_id, alert_type),
    }
}

fn ratio(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        f64::INFINITY
    } else {
        value / threshold
    }
}
