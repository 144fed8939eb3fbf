// Provider connection management: health checks, failover and reconnection
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::alerts::AlertSystem;
use crate::config::{ConnectionConfig, OracleConfig};
use crate::error::{OracleError, Result};
use crate::lock;
use crate::models::{ConnectionState, ConnectionStatus, OracleReading, ProviderEndpoint, ProviderTier};
use crate::provider::{DataProvider, ProviderConnection};
use crate::quality::DataQualityTracker;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

struct Monitor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct ManagerState {
    status: ConnectionStatus,
    endpoint_status: HashMap<String, ConnectionStatus>,
    active: Option<ProviderEndpoint>,
    pool: HashMap<String, Arc<ProviderConnection>>,
    monitor: Option<Monitor>,
    reconnect: Option<JoinHandle<()>>,
}

/// Readings gathered from every configured endpoint in one pass
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub readings: Vec<OracleReading>,
    pub failures: Vec<(String, OracleError)>,
}

/// Resets the in-flight flag even if the health check is cancelled
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    /// Primaries then backups, in configured order
    endpoints: Vec<ProviderEndpoint>,
    provider: Arc<dyn DataProvider>,
    tracker: Arc<DataQualityTracker>,
    alerts: Arc<AlertSystem>,
    state: Mutex<ManagerState>,
    /// Serializes connect, failover, promotion and disconnect
    transition: AsyncMutex<()>,
    check_in_flight: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        config: &OracleConfig,
        provider: Arc<dyn DataProvider>,
        tracker: Arc<DataQualityTracker>,
        alerts: Arc<AlertSystem>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config: config.connection.clone(),
            endpoints: config.ranked_endpoints(),
            provider,
            tracker,
            alerts,
            state: Mutex::new(ManagerState {
                status: ConnectionStatus::disconnected(),
                endpoint_status: HashMap::new(),
                active: None,
                pool: HashMap::new(),
                monitor: None,
                reconnect: None,
            }),
            transition: AsyncMutex::new(()),
            check_in_flight: AtomicBool::new(false),
        }))
    }

    pub fn endpoints(&self) -> &[ProviderEndpoint] {
        &self.endpoints
    }

    /// Connect to the first healthy endpoint, primaries before backups
    pub async fn connect(self: &Arc<Self>) -> Result<ConnectionStatus> {
        let _transition = self.transition.lock().await;
        if self.is_connected() {
            return Ok(self.status());
        }

        match self.establish(None).await {
            Ok(endpoint) => {
                if endpoint.tier == ProviderTier::Backup {
                    self.alerts
                        .raise_failover(None, &endpoint, "all primary endpoints failed to connect");
                }
                Ok(self.status())
            }
            Err(e) => {
                error!("Unable to connect to any provider: {}", e);
                self.alerts.raise_critical(
                    "All provider endpoints unavailable",
                    None,
                    json!({ "error": e.to_string(), "endpoints": self.endpoints.len() }),
                );
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Stops monitoring and reconnection, and resets all connection state
    pub async fn disconnect(&self) {
        let monitor = {
            let _transition = self.transition.lock().await;
            let mut state = lock(&self.state);
            if let Some(reconnect) = state.reconnect.take() {
                reconnect.abort();
            }
            state.active = None;
            state.pool.clear();
            state.endpoint_status.clear();
            state.status = ConnectionStatus::disconnected();
            state.monitor.take()
        };

        if let Some(monitor) = monitor {
            let _ = monitor.shutdown.send(true);
            let mut handle = monitor.handle;
            // A check in progress is bounded by the connect timeout
            let grace = self.config.connect_timeout() + Duration::from_millis(100);
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Health monitor did not stop in time, aborting");
                handle.abort();
            }
            info!("Disconnected from provider");
        }
    }

    pub async fn perform_health_check(self: &Arc<Self>) -> Result<ConnectionStatus> {
        if self.check_in_flight.swap(true, Ordering::AcqRel) {
            debug!("Health check already in flight, skipping");
            return Ok(self.status());
        }
        let _in_flight = InFlight(&self.check_in_flight);

        let connection = self.get_connection(None)?;
        let endpoint_id = connection.endpoint().id.clone();
        let outcome = connection.ping().await;

        let reliability = {
            let mut state = lock(&self.state);
            if state.active.as_ref().map(|e| e.id.as_str()) != Some(endpoint_id.as_str()) {
                // Active endpoint changed while probing
                return Ok(state.status.clone());
            }
            let now = Utc::now();
            state.status.last_health_check = Some(now);
            if let Ok(elapsed) = &outcome {
                state.status.response_time_ms = elapsed.as_secs_f64() * 1000.0;
            }
            state
                .status
                .apply_outcome(outcome.is_ok(), self.config.reliability_smoothing);
            let snapshot = state.status.clone();
            state.endpoint_status.insert(endpoint_id.clone(), snapshot);
            state.status.reliability
        };

        match outcome {
            Ok(elapsed) => {
                self.tracker
                    .record_success(&endpoint_id, elapsed.as_secs_f64() * 1000.0);
                debug!("{} healthy (reliability {:.3})", endpoint_id, reliability);
            }
            Err(e) => {
                warn!("Health check failed for {}: {}", endpoint_id, e);
                self.tracker.record_failure(&endpoint_id, &e.to_string());
            }
        }

        if reliability < self.config.min_reliability {
            let reason = format!("reliability {:.3} below {:.3}", reliability, self.config.min_reliability);
            return self.failover(&endpoint_id, &reason).await;
        }
        Ok(self.status())
    }

    /// Pooled connection for `endpoint_id`, or for the active endpoint
    pub fn get_connection(&self, endpoint_id: Option<&str>) -> Result<Arc<ProviderConnection>> {
        let endpoint = match endpoint_id {
            Some(id) => self
                .endpoints
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .ok_or_else(|| OracleError::InvalidEndpoint(format!("unknown endpoint {}", id)))?,
            None => self
                .active_endpoint()
                .ok_or(OracleError::NoProviderAvailable { attempted: 0 })?,
        };
        Ok(self.pooled(&endpoint))
    }

    /// Explicit failure report against the active endpoint
    pub async fn report_failure(self: &Arc<Self>, reason: &str) -> Result<ConnectionStatus> {
        let endpoint = self
            .active_endpoint()
            .ok_or(OracleError::NoProviderAvailable { attempted: 0 })?;
        self.tracker.record_failure(&endpoint.id, reason);
        self.degrade(&endpoint.id, reason).await
    }

    /// Switch back from a backup to the first answering primary
    pub async fn promote_to_primary(self: &Arc<Self>) -> Result<bool> {
        let _transition = self.transition.lock().await;
        let current = self.active_endpoint();
        if current.as_ref().map_or(false, |e| e.tier == ProviderTier::Primary) {
            return Ok(false);
        }

        let primaries: Vec<ProviderEndpoint> = self
            .endpoints
            .iter()
            .filter(|e| e.tier == ProviderTier::Primary)
            .cloned()
            .collect();
        for endpoint in &primaries {
            match self.pooled(endpoint).ping().await {
                Ok(elapsed) => {
                    let from = current.as_ref().map(|e| e.id.clone());
                    self.teardown();
                    self.activate(endpoint, elapsed);
                    self.alerts
                        .raise_failover(from.as_deref(), endpoint, "primary restored");
                    return Ok(true);
                }
                Err(e) => {
                    debug!("Primary {} still unavailable: {}", endpoint.id, e);
                    self.tracker.record_failure(&endpoint.id, &e.to_string());
                    self.drop_pooled(&endpoint.id);
                }
            }
        }
        Ok(false)
    }

    /// One reading from the active endpoint
    pub async fn fetch_reading(self: &Arc<Self>) -> Result<OracleReading> {
        let connection = self.get_connection(None)?;
        let endpoint_id = connection.endpoint().id.clone();
        match connection.fetch().await {
            Ok((reading, elapsed)) => {
                self.tracker
                    .record_success(&endpoint_id, elapsed.as_secs_f64() * 1000.0);
                Ok(reading)
            }
            Err(e) => {
                let reason = e.to_string();
                self.tracker.record_failure(&endpoint_id, &reason);
                self.degrade(&endpoint_id, &reason).await?;
                Err(e)
            }
        }
    }

    /// Concurrently fetch from every configured endpoint
    pub async fn fetch_all(self: &Arc<Self>) -> FetchBatch {
        let mut tasks = JoinSet::new();
        for (rank, endpoint) in self.endpoints.iter().enumerate() {
            let connection = self.pooled(endpoint);
            tasks.spawn(async move {
                let id = connection.endpoint().id.clone();
                (rank, id, connection.fetch().await)
            });
        }

        let mut ranked = Vec::new();
        let mut batch = FetchBatch::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((rank, id, Ok((reading, elapsed)))) => {
                    self.tracker.record_success(&id, elapsed.as_secs_f64() * 1000.0);
                    ranked.push((rank, reading));
                }
                Ok((_, id, Err(e))) => {
                    self.tracker.record_failure(&id, &e.to_string());
                    batch.failures.push((id, e));
                }
                Err(join_error) => error!("Fetch task failed: {}", join_error),
            }
        }
        ranked.sort_by_key(|(rank, _)| *rank);
        batch.readings = ranked.into_iter().map(|(_, reading)| reading).collect();

        let active = self.active_endpoint().map(|e| e.id);
        let active_failure = active.and_then(|id| {
            batch
                .failures
                .iter()
                .find(|(failed, _)| *failed == id)
                .map(|(_, e)| (id.clone(), e.to_string()))
        });
        if let Some((id, reason)) = active_failure {
            if let Err(e) = self.degrade(&id, &reason).await {
                warn!("Failover after fetch failure did not succeed: {}", e);
            }
        }
        batch
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.state).status.clone()
    }

    /// Last known status of every endpoint that has been tried, in rank order
    pub fn endpoint_statuses(&self) -> Vec<ConnectionStatus> {
        let state = lock(&self.state);
        self.endpoints
            .iter()
            .filter_map(|e| state.endpoint_status.get(&e.id).cloned())
            .collect()
    }

    pub fn active_endpoint(&self) -> Option<ProviderEndpoint> {
        lock(&self.state).active.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).status.connected
    }

    pub fn is_reconnecting(&self) -> bool {
        lock(&self.state)
            .reconnect
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Try endpoints in rank order, skipping `skip`; caller holds `transition`
    async fn establish(self: &Arc<Self>, skip: Option<&str>) -> Result<ProviderEndpoint> {
        lock(&self.state).status.state = ConnectionState::Connecting;

        let mut attempted = 0;
        for endpoint in self.endpoints.iter().filter(|e| Some(e.id.as_str()) != skip) {
            attempted += 1;
            info!("Connecting to {} endpoint {} ({})", endpoint.tier, endpoint.id, endpoint.address);
            match self.pooled(endpoint).ping().await {
                Ok(elapsed) => {
                    self.activate(endpoint, elapsed);
                    return Ok(endpoint.clone());
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", endpoint.id, e);
                    self.tracker.record_failure(&endpoint.id, &e.to_string());
                    self.mark_failed(endpoint);
                    self.drop_pooled(&endpoint.id);
                }
            }
        }

        let mut state = lock(&self.state);
        state.status.state = ConnectionState::Disconnected;
        state.status.connected = false;
        Err(OracleError::NoProviderAvailable { attempted })
    }

    fn activate(self: &Arc<Self>, endpoint: &ProviderEndpoint, elapsed: Duration) {
        let response_time_ms = elapsed.as_secs_f64() * 1000.0;
        {
            let mut state = lock(&self.state);
            let now = Utc::now();
            let mut status = ConnectionStatus::for_endpoint(endpoint);
            status.state = ConnectionState::Connected;
            status.connected = true;
            status.last_connected = Some(now);
            status.last_health_check = Some(now);
            status.response_time_ms = response_time_ms;

            state.endpoint_status.insert(endpoint.id.clone(), status.clone());
            state.status = status;
            state.active = Some(endpoint.clone());
        }
        self.tracker.record_success(&endpoint.id, response_time_ms);
        info!("Connected to {} endpoint {} in {:.0}ms", endpoint.tier, endpoint.id, response_time_ms);
        self.start_monitoring();
    }

    /// Stops the monitor and releases the active endpoint without waiting
    fn teardown(&self) {
        let mut state = lock(&self.state);
        if let Some(monitor) = state.monitor.take() {
            let _ = monitor.shutdown.send(true);
        }
        if let Some(active) = state.active.take() {
            state.pool.remove(&active.id);
            if let Some(status) = state.endpoint_status.get_mut(&active.id) {
                status.connected = false;
                status.state = ConnectionState::Disconnected;
            }
        }
        state.status.connected = false;
        state.status.state = ConnectionState::Disconnected;
    }

    async fn failover(self: &Arc<Self>, failed_id: &str, reason: &str) -> Result<ConnectionStatus> {
        let _transition = self.transition.lock().await;
        if self.active_endpoint().map(|e| e.id).as_deref() != Some(failed_id) {
            // Already handled by a concurrent transition
            return Ok(self.status());
        }

        warn!("Failing over from {}: {}", failed_id, reason);
        self.teardown();

        match self.establish(Some(failed_id)).await {
            Ok(endpoint) => {
                self.alerts.raise_failover(Some(failed_id), &endpoint, reason);
                Ok(self.status())
            }
            Err(e) => {
                error!("Failover from {} found no healthy endpoint: {}", failed_id, e);
                self.alerts.raise_critical(
                    "Failover exhausted all provider endpoints",
                    Some(failed_id),
                    json!({ "reason": reason, "error": e.to_string() }),
                );
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    async fn degrade(self: &Arc<Self>, endpoint_id: &str, reason: &str) -> Result<ConnectionStatus> {
        let reliability = {
            let mut state = lock(&self.state);
            if state.active.as_ref().map(|e| e.id.as_str()) != Some(endpoint_id) {
                return Ok(state.status.clone());
            }
            state
                .status
                .apply_outcome(false, self.config.reliability_smoothing);
            let snapshot = state.status.clone();
            state.endpoint_status.insert(endpoint_id.to_string(), snapshot);
            state.status.reliability
        };

        if reliability < self.config.min_reliability {
            return self.failover(endpoint_id, reason).await;
        }
        Ok(self.status())
    }

    fn mark_failed(&self, endpoint: &ProviderEndpoint) {
        let mut state = lock(&self.state);
        let status = state
            .endpoint_status
            .entry(endpoint.id.clone())
            .or_insert_with(|| ConnectionStatus::for_endpoint(endpoint));
        status.connected = false;
        status.state = ConnectionState::Disconnected;
        status.apply_outcome(false, self.config.reliability_smoothing);
    }

    fn pooled(&self, endpoint: &ProviderEndpoint) -> Arc<ProviderConnection> {
        let mut state = lock(&self.state);
        let connection = state.pool.entry(endpoint.id.clone()).or_insert_with(|| {
            Arc::new(ProviderConnection::new(
                endpoint.clone(),
                Arc::clone(&self.provider),
                self.config.connect_timeout(),
            ))
        });
        Arc::clone(connection)
    }

    fn drop_pooled(&self, endpoint_id: &str) {
        lock(&self.state).pool.remove(endpoint_id);
    }

    fn start_monitoring(self: &Arc<Self>) {
        let (shutdown, receiver) = watch::channel(false);
        let handle = tokio::spawn(Self::health_loop(Arc::downgrade(self), receiver));
        let previous = lock(&self.state).monitor.replace(Monitor { shutdown, handle });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(true);
        }
    }

    fn health_loop(manager: Weak<Self>, mut shutdown: watch::Receiver<bool>) -> BoxFuture<()> {
        Box::pin(async move {
            let interval = match manager.upgrade() {
                Some(m) => m.config.health_check_interval(),
                None => return,
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }

                let Some(manager) = manager.upgrade() else { break };
                if let Err(e) = manager.perform_health_check().await {
                    warn!("Health check round ended with error: {}", e);
                }
            }
            debug!("Health monitor stopped");
        })
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        if state.reconnect.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        info!(
            "Scheduling reconnect ({} attempts, starting after {:?})",
            self.config.max_reconnect_attempts,
            self.config.backoff_delay(1)
        );
        state.reconnect = Some(tokio::spawn(Self::reconnect_loop(Arc::downgrade(self))));
    }

    fn reconnect_loop(manager: Weak<Self>) -> BoxFuture<()> {
        Box::pin(async move {
            let max_attempts = match manager.upgrade() {
                Some(m) => m.config.max_reconnect_attempts,
                None => return,
            };

            for attempt in 1..=max_attempts {
                let delay = match manager.upgrade() {
                    Some(m) => m.config.backoff_delay(attempt),
                    None => return,
                };
                tokio::time::sleep(delay).await;

                let Some(m) = manager.upgrade() else { return };
                let _transition = m.transition.lock().await;
                if m.is_connected() {
                    return;
                }
                info!("Reconnect attempt {}/{}", attempt, max_attempts);
                match m.establish(None).await {
                    Ok(endpoint) => {
                        if endpoint.tier == ProviderTier::Backup {
                            m.alerts
                                .raise_failover(None, &endpoint, "reconnected while primaries unavailable");
                        }
                        info!("Reconnected to {} on attempt {}", endpoint.id, attempt);
                        return;
                    }
                    Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
                }
            }

            if let Some(m) = manager.upgrade() {
                m.alerts.raise_critical(
                    "Reconnect attempts exhausted; explicit connect required",
                    None,
                    json!({ "attempts": max_attempts }),
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertFilter;
    use crate::models::{AlertType, Severity};
    use crate::provider::SimulatedProvider;

    struct Harness {
        provider: Arc<SimulatedProvider>,
        alerts: Arc<AlertSystem>,
        tracker: Arc<DataQualityTracker>,
        manager: Arc<ConnectionManager>,
    }

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
        config.connection.reconnect_base_delay_ms = 10;
        config.connection.max_reconnect_attempts = 3;
        config
    }

    fn harness(config: OracleConfig) -> Harness {
        let provider = Arc::new(
            SimulatedProvider::new()
                .with_fixed_feed("p1", 100.0, 0.9)
                .with_fixed_feed("p2", 101.0, 0.9)
                .with_fixed_feed("b1", 99.0, 0.8),
        );
        let alerts = Arc::new(AlertSystem::new(config.alerts.clone()));
        let tracker = Arc::new(DataQualityTracker::new(config.quality.clone()));
        let manager =
            ConnectionManager::new(&config, provider.clone(), tracker.clone(), alerts.clone()).unwrap();
        Harness {
            provider,
            alerts,
            tracker,
            manager,
        }
    }

    fn alerts_of(alerts: &AlertSystem, alert_type: AlertType) -> Vec<crate::models::Alert> {
        alerts.alerts(&AlertFilter {
            alert_type: Some(alert_type),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_connects_to_first_healthy_primary() {
        let h = harness(config());
        h.provider.fail("p1");

        let status = h.manager.connect().await.unwrap();
        assert!(status.connected);
        assert_eq!(status.endpoint_id.as_deref(), Some("p2"));
        assert_eq!(status.tier, Some(ProviderTier::Primary));
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(alerts_of(&h.alerts, AlertType::Failover).is_empty());
        assert_eq!(h.tracker.metrics("p1").unwrap().failed_requests, 1);

        h.manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_falls_back_to_backup_with_alert() {
        let h = harness(config());
        h.provider.fail("p1");
        h.provider.stall("p2");

        let status = h.manager.connect().await.unwrap();
        assert_eq!(status.endpoint_id.as_deref(), Some("b1"));
        assert_eq!(status.tier, Some(ProviderTier::Backup));

        let failovers = alerts_of(&h.alerts, AlertType::Failover);
        assert_eq!(failovers.len(), 1);
        assert!(failovers[0].message.contains("Primary unavailable"));

        h.manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_all_endpoints_down_is_an_error() {
        let h = harness(config());
        for id in ["p1", "p2", "b1"] {
            h.provider.fail(id);
        }

        let result = h.manager.connect().await;
        assert!(matches!(result, Err(OracleError::NoProviderAvailable { attempted: 3 })));
        assert!(!h.manager.is_connected());
        assert!(h.manager.is_reconnecting());

        let critical = alerts_of(&h.alerts, AlertType::CriticalError);
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].severity, Severity::Critical);

        h.manager.disconnect().await;
        assert!(!h.manager.is_reconnecting());
    }

    #[tokio::test]
    async fn test_reconnects_with_backoff_once_provider_recovers() {
        let h = harness(config());
        for id in ["p1", "p2", "b1"] {
            h.provider.fail(id);
        }
        assert!(h.manager.connect().await.is_err());

        h.provider.recover("p1");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(h.manager.is_connected());
        assert_eq!(h.manager.active_endpoint().unwrap().id, "p1");
        h.manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let mut cfg = config();
        cfg.connection.reconnect_base_delay_ms = 5;
        cfg.connection.max_reconnect_attempts = 2;
        let h = harness(cfg);
        for id in ["p1", "p2", "b1"] {
            h.provider.fail(id);
        }
        assert!(h.manager.connect().await.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!h.manager.is_reconnecting());
        assert!(!h.manager.is_connected());

        let critical = alerts_of(&h.alerts, AlertType::CriticalError);
        assert_eq!(critical.len(), 2);
        assert!(critical[0].message.contains("exhausted"));
    }

    #[tokio::test]
    async fn test_failed_health_check_fails_over_to_next_endpoint() {
        let h = harness(config());
        h.manager.connect().await.unwrap();
        assert_eq!(h.manager.active_endpoint().unwrap().id, "p1");

        h.provider.fail("p1");
        let status = h.manager.perform_health_check().await.unwrap();
        assert_eq!(status.endpoint_id.as_deref(), Some("p2"));
        assert!(status.connected);

        let failovers = alerts_of(&h.alerts, AlertType::Failover);
        assert_eq!(failovers.len(), 1);
        assert_eq!(failovers[0].details["from"], "p1");
        assert_eq!(failovers[0].details["to"], "p2");

        let p1 = h
            .manager
            .endpoint_statuses()
            .into_iter()
            .find(|s| s.endpoint_id.as_deref() == Some("p1"))
            .unwrap();
        assert!(!p1.connected);
        assert!(p1.reliability < 0.95);

        h.manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_successful_health_check_keeps_connection() {
        let h = harness(config());
        h.manager.connect().await.unwrap();
        let status = h.manager.perform_health_check().await.unwrap();
        assert_eq!(status.endpoint_id.as_deref(), Some("p1"));
        assert_eq!(status.reliability, 1.0);
        assert!(status.last_health_check.is_some());
        h.manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_overlapping_health_checks_are_skipped() {
        let provider = Arc::new(
            SimulatedProvider::new()
                .with_latency(Duration::from_millis(20))
                .with_fixed_feed("p1", 100.0, 0.9),
        );
        let mut cfg = OracleConfig::with_endpoints(vec![ProviderEndpoint::primary("p1", "sim://p1")], vec![]);
        cfg.connection.connect_timeout_ms = 500;
        cfg.connection.health_check_interval_ms = 60_000;
        let manager = ConnectionManager::new(
            &cfg,
            provider,
            Arc::new(DataQualityTracker::default()),
            Arc::new(AlertSystem::default()),
        )
        .unwrap();
        manager.connect().await.unwrap();

        let (a, b) = tokio::join!(manager.perform_health_check(), manager.perform_health_check());
        assert!(a.is_ok() && b.is_ok());
        // One probe for connect, one for the single check that ran
        assert_eq!(manager.get_connection(None).unwrap().request_count(), 2);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_periodic_monitor_detects_failure() {
        let mut cfg = config();
        cfg.connection.health_check_interval_ms = 20;
        let h = harness(cfg);
        h.manager.connect().await.unwrap();

        h.provider.fail("p1");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.manager.active_endpoint().unwrap().id, "p2");
        h.manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_connection_pool_reuses_handles() {
        let h = harness(config());
        assert!(matches!(
            h.manager.get_connection(None),
            Err(OracleError::NoProviderAvailable { .. })
        ));
        assert!(matches!(
            h.manager.get_connection(Some("nope")),
            Err(OracleError::InvalidEndpoint(_))
        ));

        h.manager.connect().await.unwrap();
        let first = h.manager.get_connection(None).unwrap();
        let second = h.manager.get_connection(Some("p1")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        h.manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let h = harness(config());
        h.manager.connect().await.unwrap();
        h.manager.disconnect().await;
        h.manager.disconnect().await;

        let status = h.manager.status();
        assert!(!status.connected);
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.endpoint_id.is_none());
        assert!(h.manager.active_endpoint().is_none());
    }

    #[tokio::test]
    async fn test_promote_back_to_primary() {
        let h = harness(config());
        h.provider.fail("p1");
        h.provider.fail("p2");
        h.manager.connect().await.unwrap();
        assert_eq!(h.manager.active_endpoint().unwrap().tier, ProviderTier::Backup);

        assert!(!h.manager.promote_to_primary().await.unwrap());
        h.provider.recover("p2");
        assert!(h.manager.promote_to_primary().await.unwrap());
        assert_eq!(h.manager.active_endpoint().unwrap().id, "p2");
        h.manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_fetch_reading_failure_triggers_failover() {
        let h = harness(config());
        h.manager.connect().await.unwrap();
        let reading = h.manager.fetch_reading().await.unwrap();
        assert_eq!(reading.provider_id, "p1");
        assert_eq!(reading.value, 100.0);

        h.provider.fail("p1");
        assert!(h.manager.fetch_reading().await.is_err());
        assert_eq!(h.manager.active_endpoint().unwrap().id, "p2");
        assert_eq!(h.manager.fetch_reading().await.unwrap().value, 101.0);
        h.manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_fetch_all_collects_readings_and_failures() {
        let h = harness(config());
        h.provider.stall("p2");

        let batch = h.manager.fetch_all().await;
        let ids: Vec<&str> = batch.readings.iter().map(|r| r.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "b1"]);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].0, "p2");
        assert!(matches!(batch.failures[0].1, OracleError::ConnectionTimeout(50)));
        assert_eq!(h.tracker.metrics("p2").unwrap().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_report_failure_without_connection() {
        let h = harness(config());
        assert!(matches!(
            h.manager.report_failure("manual").await,
            Err(OracleError::NoProviderAvailable { .. })
        ));
    }
}
