// Node configuration and validation
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{OracleError, Result};
use crate::models::{ProviderEndpoint, ProviderTier, Severity};
use crate::scoring::ScoringPolicy;

const SUPPORTED_SCHEMES: [&str; 3] = ["http://", "https://", "sim://"];

/// Connection manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Reliability below this triggers failover
    pub min_reliability: f64,
    /// EMA smoothing factor for reliability
    pub reliability_smoothing: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            health_check_interval_ms: 30_000,
            reconnect_base_delay_ms: 1_000,
            max_reconnect_attempts: 5,
            min_reliability: 0.95,
            reliability_smoothing: 0.1,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based): base * 2^(attempt-1)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(factor))
    }
}

/// Alert thresholds and cooldowns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Failure rate (0-1) above which a feed failure alert fires
    pub failure_rate_threshold: f64,
    pub response_time_threshold_ms: f64,
    /// Anomalies below this severity never alert
    pub min_anomaly_severity: Severity,
    pub min_confidence: f64,
    pub feed_failure_cooldown_ms: i64,
    pub anomaly_cooldown_ms: i64,
    pub performance_cooldown_ms: i64,
    pub max_history: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.10,
            response_time_threshold_ms: 5_000.0,
            min_anomaly_severity: Severity::Medium,
            min_confidence: 0.5,
            feed_failure_cooldown_ms: 5 * 60 * 1000,
            anomaly_cooldown_ms: 10 * 60 * 1000,
            performance_cooldown_ms: 15 * 60 * 1000,
            max_history: 1000,
        }
    }
}

/// Anomaly detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub outlier_threshold_std_devs: f64,
    pub max_staleness_ms: i64,
    pub max_variation: f64,
    pub max_anomaly_history: usize,
    /// Per-provider value history kept for outlier detection
    pub max_value_history: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            outlier_threshold_std_devs: 3.0,
            max_staleness_ms: 5 * 60 * 1000,
            max_variation: 0.15,
            max_anomaly_history: 1000,
            max_value_history: 100,
        }
    }
}

/// Oracle node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub primary_endpoints: Vec<ProviderEndpoint>,
    pub backup_endpoints: Vec<ProviderEndpoint>,
    pub connection: ConnectionConfig,
    pub alerts: AlertConfig,
    pub quality: QualityConfig,
    pub scoring: ScoringPolicy,
}

impl OracleConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OracleError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: OracleConfig = serde_json::from_str(&raw)
            .map_err(|e| OracleError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_endpoints(primaries: Vec<ProviderEndpoint>, backups: Vec<ProviderEndpoint>) -> Self {
        Self {
            primary_endpoints: primaries,
            backup_endpoints: backups,
            ..Default::default()
        }
    }

    /// Primaries then backups, in configured order
    pub fn ranked_endpoints(&self) -> Vec<ProviderEndpoint> {
        self.primary_endpoints
            .iter()
            .chain(self.backup_endpoints.iter())
            .cloned()
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.primary_endpoints.is_empty() && self.backup_endpoints.is_empty() {
            return Err(OracleError::InvalidConfig("no provider endpoints configured".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.primary_endpoints {
            validate_endpoint(endpoint, ProviderTier::Primary)?;
            if !seen.insert(endpoint.id.as_str()) {
                return Err(OracleError::InvalidEndpoint(format!("duplicate endpoint id {}", endpoint.id)));
            }
        }
        for endpoint in &self.backup_endpoints {
            validate_endpoint(endpoint, ProviderTier::Backup)?;
            if !seen.insert(endpoint.id.as_str()) {
                return Err(OracleError::InvalidEndpoint(format!("duplicate endpoint id {}", endpoint.id)));
            }
        }

        let conn = &self.connection;
        if conn.connect_timeout_ms == 0 {
            return Err(OracleError::InvalidConfig("connect_timeout_ms must be positive".to_string()));
        }
        if conn.health_check_interval_ms == 0 {
            return Err(OracleError::InvalidConfig(
                "health_check_interval_ms must be positive".to_string(),
            ));
        }
        if conn.reconnect_base_delay_ms == 0 {
            return Err(OracleError::InvalidConfig(
                "reconnect_base_delay_ms must be positive".to_string(),
            ));
        }
        check_unit("min_reliability", conn.min_reliability)?;
        if conn.reliability_smoothing <= 0.0 || conn.reliability_smoothing > 1.0 {
            return Err(OracleError::InvalidConfig(
                "reliability_smoothing must be in (0, 1]".to_string(),
            ));
        }

        let alerts = &self.alerts;
        check_unit("failure_rate_threshold", alerts.failure_rate_threshold)?;
        check_unit("min_confidence", alerts.min_confidence)?;
        if alerts.response_time_threshold_ms <= 0.0 {
            return Err(OracleError::InvalidConfig(
                "response_time_threshold_ms must be positive".to_string(),
            ));
        }
        if alerts.feed_failure_cooldown_ms < 0
            || alerts.anomaly_cooldown_ms < 0
            || alerts.performance_cooldown_ms < 0
        {
            return Err(OracleError::InvalidConfig("alert cooldowns must not be negative".to_string()));
        }
        if alerts.max_history == 0 {
            return Err(OracleError::InvalidConfig("alert max_history must be positive".to_string()));
        }

        let quality = &self.quality;
        if quality.outlier_threshold_std_devs <= 0.0 {
            return Err(OracleError::InvalidConfig(
                "outlier_threshold_std_devs must be positive".to_string(),
            ));
        }
        if quality.max_staleness_ms <= 0 {
            return Err(OracleError::InvalidConfig("max_staleness_ms must be positive".to_string()));
        }
        if quality.max_variation <= 0.0 {
            return Err(OracleError::InvalidConfig("max_variation must be positive".to_string()));
        }
        if quality.max_anomaly_history == 0 || quality.max_value_history == 0 {
            return Err(OracleError::InvalidConfig("history sizes must be positive".to_string()));
        }

        let scoring = &self.scoring;
        let weights = [
            scoring.consensus_weight,
            scoring.quality_weight,
            scoring.reliability_weight,
            scoring.self_confidence_weight,
            scoring.freshness_weight,
            scoring.completeness_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(OracleError::InvalidConfig("scoring weights must not be negative".to_string()));
        }
        check_unit("single_source_consensus", scoring.single_source_consensus)?;
        check_unit("default_reliability", scoring.default_reliability)?;
        if scoring.full_completeness_sources == 0 {
            return Err(OracleError::InvalidConfig(
                "full_completeness_sources must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn validate_endpoint(endpoint: &ProviderEndpoint, expected_tier: ProviderTier) -> Result<()> {
    if endpoint.id.trim().is_empty() {
        return Err(OracleError::InvalidEndpoint("endpoint id is empty".to_string()));
    }
    if endpoint.tier != expected_tier {
        return Err(OracleError::InvalidEndpoint(format!(
            "{} is listed as {} but declares tier {}",
            endpoint.id, expected_tier, endpoint.tier
        )));
    }
    let address = endpoint.address.as_str();
    if address.chars().any(char::is_whitespace) {
        return Err(OracleError::InvalidEndpoint(format!("{}: address contains whitespace", endpoint.id)));
    }
    let host = SUPPORTED_SCHEMES
        .iter()
        .find_map(|scheme| address.strip_prefix(scheme))
        .ok_or_else(|| {
            OracleError::InvalidEndpoint(format!("{}: unsupported address {}", endpoint.id, address))
        })?;
    if host.is_empty() {
        return Err(OracleError::InvalidEndpoint(format!("{}: address has no host", endpoint.id)));
    }
    Ok(())
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(OracleError::InvalidConfig(format!("{} must be in [0, 1], got {}", name, value)));
    }
    Ok(())
}
