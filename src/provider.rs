// Data providers for fetching oracle readings
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{OracleError, Result};
use crate::lock;
use crate::models::{OracleReading, ProviderEndpoint};

/// Reading-fetch contract implemented by every provider backend
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Lightweight liveness probe
    async fn ping(&self, endpoint: &ProviderEndpoint) -> Result<()>;
    async fn fetch_reading(&self, endpoint: &ProviderEndpoint) -> Result<OracleReading>;
    fn name(&self) -> &str;
}

/// Runs `operation` under `timeout`, mapping expiry to `ConnectionTimeout`
pub async fn with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(OracleError::ConnectionTimeout(timeout.as_millis() as u64)),
    }
}

/// Pooled handle to one endpoint
pub struct ProviderConnection {
    endpoint: ProviderEndpoint,
    provider: Arc<dyn DataProvider>,
    timeout: Duration,
    opened_at: DateTime<Utc>,
    requests: AtomicU64,
}

impl ProviderConnection {
    pub fn new(endpoint: ProviderEndpoint, provider: Arc<dyn DataProvider>, timeout: Duration) -> Self {
        debug!("Opening pooled connection to {} via {}", endpoint.id, provider.name());
        Self {
            endpoint,
            provider,
            timeout,
            opened_at: Utc::now(),
            requests: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self) -> &ProviderEndpoint {
        &self.endpoint
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Probe the endpoint, returning the round-trip time
    pub async fn ping(&self) -> Result<Duration> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        with_timeout(self.timeout, self.provider.ping(&self.endpoint)).await?;
        Ok(started.elapsed())
    }

    pub async fn fetch(&self) -> Result<(OracleReading, Duration)> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let reading = with_timeout(self.timeout, self.provider.fetch_reading(&self.endpoint)).await?;
        Ok((reading, started.elapsed()))
    }
}

#[derive(Debug, Deserialize)]
struct ReadingPayload {
    value: f64,
    confidence: Option<f64>,
    timestamp: Option<DateTime<Utc>>,
}

/// JSON-over-HTTP provider.
///
/// Expects `GET {address}/health` to answer 2xx and `GET {address}/reading`
/// to return `{"value": f64, "confidence": f64?, "timestamp": rfc3339?}`.
pub struct HttpProvider {
    client: Client,
}

impl HttpProvider {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn url(endpoint: &ProviderEndpoint, path: &str) -> String {
        format!("{}/{}", endpoint.address.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl DataProvider for HttpProvider {
    async fn ping(&self, endpoint: &ProviderEndpoint) -> Result<()> {
        let response = self.client.get(Self::url(endpoint, "health")).send().await?;
        expect_success(endpoint, response.status(), "health check")
    }

    async fn fetch_reading(&self, endpoint: &ProviderEndpoint) -> Result<OracleReading> {
        let response = self.client.get(Self::url(endpoint, "reading")).send().await?;
        expect_success(endpoint, response.status(), "reading request")?;
        let payload: ReadingPayload = response.json().await?;
        reading_from_payload(endpoint, payload)
    }

    fn name(&self) -> &str {
        "http"
    }
}

fn expect_success(endpoint: &ProviderEndpoint, status: StatusCode, request: &str) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(OracleError::provider(&endpoint.id, format!("{} returned {}", request, status)))
    }
}

fn reading_from_payload(endpoint: &ProviderEndpoint, payload: ReadingPayload) -> Result<OracleReading> {
    if !payload.value.is_finite() {
        return Err(OracleError::provider(&endpoint.id, "non-finite value"));
    }

    let mut reading = OracleReading::new(&endpoint.id, payload.value)
        .with_confidence(payload.confidence.unwrap_or(0.8));
    if let Some(timestamp) = payload.timestamp {
        reading = reading.with_timestamp(timestamp);
    }
    Ok(reading)
}

#[derive(Debug, Clone)]
struct SimulatedFeed {
    base_value: f64,
    confidence: f64,
    /// Relative jitter, e.g. 0.01 for ±1%
    variation: f64,
}

/// In-process provider producing jittered readings around a base value.
/// Endpoints can be failed or stalled at runtime.
pub struct SimulatedProvider {
    feeds: Mutex<HashMap<String, SimulatedFeed>>,
    failing: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
    latency: Duration,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self {
            feeds: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            stalled: Mutex::new(HashSet::new()),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_feed(self, endpoint_id: &str, base_value: f64, confidence: f64) -> Self {
        self.set_feed(endpoint_id, base_value, confidence, 0.01);
        self
    }

    /// Feed without jitter
    pub fn with_fixed_feed(self, endpoint_id: &str, value: f64, confidence: f64) -> Self {
        self.set_feed(endpoint_id, value, confidence, 0.0);
        self
    }

    pub fn set_feed(&self, endpoint_id: &str, base_value: f64, confidence: f64, variation: f64) {
        let feed = SimulatedFeed {
            base_value,
            confidence: confidence.clamp(0.0, 1.0),
            variation,
        };
        lock(&self.feeds).insert(endpoint_id.to_string(), feed);
    }

    pub fn fail(&self, endpoint_id: &str) {
        lock(&self.failing).insert(endpoint_id.to_string());
    }

    /// Stalled endpoints never answer; callers see a timeout
    pub fn stall(&self, endpoint_id: &str) {
        lock(&self.stalled).insert(endpoint_id.to_string());
    }

    pub fn recover(&self, endpoint_id: &str) {
        lock(&self.failing).remove(endpoint_id);
        lock(&self.stalled).remove(endpoint_id);
    }

    async fn answer(&self, endpoint: &ProviderEndpoint) -> Result<SimulatedFeed> {
        let stalled = lock(&self.stalled).contains(&endpoint.id);
        if stalled {
            std::future::pending::<()>().await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if lock(&self.failing).contains(&endpoint.id) {
            return Err(OracleError::provider(&endpoint.id, "simulated outage"));
        }
        let feed = lock(&self.feeds).get(&endpoint.id).cloned();
        feed.ok_or_else(|| OracleError::provider(&endpoint.id, "no simulated feed configured"))
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataProvider for SimulatedProvider {
    async fn ping(&self, endpoint: &ProviderEndpoint) -> Result<()> {
        self.answer(endpoint).await.map(|_| ())
    }

    async fn fetch_reading(&self, endpoint: &ProviderEndpoint) -> Result<OracleReading> {
        let feed = self.answer(endpoint).await?;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * feed.variation;
        let value = feed.base_value * (1.0 + jitter);
        Ok(OracleReading::new(&endpoint.id, value).with_confidence(feed.confidence))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
