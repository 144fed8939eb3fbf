// Oracle data reliability: provider failover, data quality tracking,
// consensus confidence scoring and alerting
use std::sync::{Mutex, MutexGuard};

pub mod alerts;
pub mod config;
pub mod connection;
pub mod error;
pub mod models;
pub mod monitor;
pub mod provider;
pub mod quality;
pub mod scoring;
pub mod stats;

pub use alerts::{AlertFilter, AlertSummary, AlertSystem};
pub use config::{AlertConfig, ConnectionConfig, OracleConfig, QualityConfig};
pub use connection::{ConnectionManager, FetchBatch};
pub use error::{OracleError, Result};
pub use models::*;
pub use monitor::{OracleMonitor, RoundReport};
pub use provider::{DataProvider, HttpProvider, ProviderConnection, SimulatedProvider};
pub use quality::DataQualityTracker;
pub use scoring::{ConfidenceScorer, ScoringPolicy};

// Poisoned locks only follow a panic elsewhere; keep serving the data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
