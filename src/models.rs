// Data models for the oracle reliability node
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ranking tier of a provider endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTier {
    Primary,
    Backup,
}

impl fmt::Display for ProviderTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderTier::Primary => write!(f, "primary"),
            ProviderTier::Backup => write!(f, "backup"),
        }
    }
}

/// Identity of one data source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub id: String,
    pub address: String,
    pub tier: ProviderTier,
}

impl ProviderEndpoint {
    pub fn primary(id: &str, address: &str) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            tier: ProviderTier::Primary,
        }
    }

    pub fn backup(id: &str, address: &str) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            tier: ProviderTier::Backup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Runtime state of one endpoint connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub endpoint_id: Option<String>,
    pub tier: Option<ProviderTier>,
    pub state: ConnectionState,
    pub connected: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub response_time_ms: f64,
    pub reliability: f64,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self {
            endpoint_id: None,
            tier: None,
            state: ConnectionState::Disconnected,
            connected: false,
            last_connected: None,
            last_health_check: None,
            response_time_ms: 0.0,
            reliability: 1.0,
        }
    }

    pub fn for_endpoint(endpoint: &ProviderEndpoint) -> Self {
        Self {
            endpoint_id: Some(endpoint.id.clone()),
            tier: Some(endpoint.tier),
            ..Self::disconnected()
        }
    }

    /// Exponential moving average toward 1.0 (success) or 0.0 (failure)
    pub fn apply_outcome(&mut self, success: bool, smoothing: f64) {
        self.reliability = ema(self.reliability, success, smoothing);
    }
}

/// Single data point from one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleReading {
    pub provider_id: String,
    pub value: f64,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl OracleReading {
    pub fn new(provider_id: &str, value: f64) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            value,
            confidence: 0.8, // Default confidence
            timestamp: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = unit_interval(confidence);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QualityRating {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Cumulative statistics for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPerformanceMetrics {
    pub provider_id: String,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub quality: QualityRating,
    pub reliability: f64,
    pub last_update: DateTime<Utc>,
}

impl FeedPerformanceMetrics {
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            total_requests: 0,
            failed_requests: 0,
            success_rate: 1.0,
            avg_response_time_ms: 0.0,
            quality: QualityRating::Excellent,
            reliability: 1.0,
            last_update: Utc::now(),
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Outlier,
    MissingData,
    StaleData,
    InconsistentData,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnomalyKind::Outlier => "outlier",
            AnomalyKind::MissingData => "missing_data",
            AnomalyKind::StaleData => "stale_data",
            AnomalyKind::InconsistentData => "inconsistent_data",
        };
        write!(f, "{}", name)
    }
}

/// Ordered so that `Low < Medium < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

/// A detected problem with a provider's data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataAnomaly {
    pub id: String,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub provider_id: String,
    pub description: String,
    pub observed_value: Option<f64>,
    pub expected_value: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl DataAnomaly {
    pub fn new(kind: AnomalyKind, severity: Severity, provider_id: &str, description: String) -> Self {
        Self {
            id: new_id("anomaly"),
            kind,
            severity,
            provider_id: provider_id.to_string(),
            description,
            observed_value: None,
            expected_value: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_values(mut self, observed: f64, expected: f64) -> Self {
        self.observed_value = Some(observed);
        self.expected_value = Some(expected);
        self
    }
}

/// Output of one consensus computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub overall_confidence: f64,
    pub consensus_score: f64,
    pub quality_score: f64,
    pub reliability_score: f64,
    pub consensus_value: Option<f64>,
    pub reading_count: usize,
    /// Percentage (0-100) of readings within tolerance of the median
    pub agreement_rate: f64,
    pub explanation: String,
    pub timestamp: DateTime<Utc>,
}

impl ConfidenceScore {
    pub fn empty(explanation: &str) -> Self {
        Self {
            overall_confidence: 0.0,
            consensus_score: 0.0,
            quality_score: 0.0,
            reliability_score: 0.0,
            consensus_value: None,
            reading_count: 0,
            agreement_rate: 0.0,
            explanation: explanation.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    FeedFailure,
    Anomaly,
    PerformanceDegradation,
    CriticalError,
    Failover,
    LowConfidence,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertType::FeedFailure => "feed_failure",
            AlertType::Anomaly => "anomaly",
            AlertType::PerformanceDegradation => "performance_degradation",
            AlertType::CriticalError => "critical_error",
            AlertType::Failover => "failover",
            AlertType::LowConfidence => "low_confidence",
        };
        write!(f, "{}", name)
    }
}

/// Operator-facing notice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub provider_id: Option<String>,
    pub message: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(alert_type: AlertType, severity: Severity, message: String) -> Self {
        Self {
            id: new_id("alert"),
            alert_type,
            severity,
            provider_id: None,
            message,
            details: serde_json::Value::Null,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
        }
    }

    pub fn with_provider(mut self, provider_id: &str) -> Self {
        self.provider_id = Some(provider_id.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Clamps to [0, 1]; non-finite input counts as no confidence
pub(crate) fn unit_interval(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub(crate) fn ema(previous: f64, success: bool, smoothing: f64) -> f64 {
    let target = if success { 1.0 } else { 0.0 };
    (previous * (1.0 - smoothing) + target * smoothing).clamp(0.0, 1.0)
}

fn new_id(prefix: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        Utc::now().timestamp_millis(),
        hex::encode(rand::random::<[u8; 4]>())
    )
}
