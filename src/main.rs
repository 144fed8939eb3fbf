// Oracle Reliability Node - monitors redundant data providers and scores consensus
use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;

use oracle_reliability::{
    AlertSystem, DataProvider, HttpProvider, OracleConfig, OracleMonitor, ProviderConnection, ProviderEndpoint,
    ProviderTier, SimulatedProvider,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file (falls back to ORACLE_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use in-process simulated providers instead of HTTP
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitoring node
    Start {
        /// Round interval in seconds
        #[arg(short, long, default_value = "30")]
        interval: u64,
    },

    /// Run a single monitoring round and print the report
    Round,

    /// Probe every configured provider once
    TestProviders,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.clone(), cli.simulate)?;
    let provider = build_provider(&config, cli.simulate)?;

    match cli.command {
        Commands::Start { interval } => {
            start_node(&config, provider, interval).await?;
        }
        Commands::Round => {
            run_single_round(&config, provider).await?;
        }
        Commands::TestProviders => {
            test_providers(&config, provider).await;
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>, simulate: bool) -> anyhow::Result<OracleConfig> {
    let path = path.or_else(|| std::env::var("ORACLE_CONFIG").ok().map(PathBuf::from));
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            OracleConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))
        }
        None if simulate => Ok(OracleConfig::with_endpoints(
            vec![
                ProviderEndpoint::primary("primary-1", "sim://primary-1"),
                ProviderEndpoint::primary("primary-2", "sim://primary-2"),
            ],
            vec![ProviderEndpoint::backup("backup-1", "sim://backup-1")],
        )),
        None => anyhow::bail!("no configuration given; pass --config, set ORACLE_CONFIG or use --simulate"),
    }
}

fn build_provider(config: &OracleConfig, simulate: bool) -> anyhow::Result<Arc<dyn DataProvider>> {
    if simulate {
        let provider = SimulatedProvider::new();
        for endpoint in config.ranked_endpoints() {
            provider.set_feed(&endpoint.id, 100.0, 0.9, 0.01);
        }
        return Ok(Arc::new(provider));
    }
    let provider = HttpProvider::new(config.connection.connect_timeout())?;
    Ok(Arc::new(provider))
}

async fn start_node(config: &OracleConfig, provider: Arc<dyn DataProvider>, interval: u64) -> anyhow::Result<()> {
    let monitor = OracleMonitor::new(config, provider)?;
    spawn_alert_logger(monitor.alerts());

    info!(
        "Starting oracle reliability node with {} primary and {} backup endpoints",
        config.primary_endpoints.len(),
        config.backup_endpoints.len()
    );
    info!("Round interval: {} seconds", interval);

    if let Err(e) = monitor.start().await {
        // Reconnection continues in the background
        error!("Initial connection failed: {}", e);
    }

    loop {
        let report = monitor.run_round().await;
        info!(
            "Round: value {} (confidence {:.3}, {} readings, {} anomalies, {} alerts)",
            report
                .score
                .consensus_value
                .map(|v| format!("{:.4}", v))
                .unwrap_or_else(|| "n/a".to_string()),
            report.score.overall_confidence,
            report.score.reading_count,
            report.anomalies.len(),
            report.alerts.len()
        );

        if report.connection.tier == Some(ProviderTier::Backup) {
            match monitor.connections().promote_to_primary().await {
                Ok(true) => info!("Returned to a primary endpoint"),
                Ok(false) => {}
                Err(e) => warn!("Promotion attempt failed: {}", e),
            }
        }
        monitor.alerts().clear_old_alerts(chrono::Duration::hours(24));

        tokio::select! {
            _ = sleep(Duration::from_secs(interval)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    monitor.shutdown().await;
    Ok(())
}

fn spawn_alert_logger(alerts: &Arc<AlertSystem>) {
    let mut receiver = alerts.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(alert) => info!(
                    "Alert {} [{} {}]: {}",
                    alert.id, alert.severity, alert.alert_type, alert.message
                ),
                Err(RecvError::Lagged(skipped)) => warn!("Alert stream lagged, {} alerts skipped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn run_single_round(config: &OracleConfig, provider: Arc<dyn DataProvider>) -> anyhow::Result<()> {
    let monitor = OracleMonitor::new(config, provider)?;
    if let Err(e) = monitor.start().await {
        warn!("No active connection: {}", e);
    }

    let report = monitor.run_round().await;
    monitor.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn test_providers(config: &OracleConfig, provider: Arc<dyn DataProvider>) {
    for endpoint in config.ranked_endpoints() {
        let label = format!("{} ({})", endpoint.id, endpoint.tier);
        let connection = ProviderConnection::new(endpoint, Arc::clone(&provider), config.connection.connect_timeout());
        match connection.fetch().await {
            Ok((reading, elapsed)) => {
                println!(
                    "{}: {:.4} (confidence: {:.2}, {}ms)",
                    label,
                    reading.value,
                    reading.confidence,
                    elapsed.as_millis()
                );
            }
            Err(e) => {
                println!("{}: Error - {}", label, e);
            }
        }
    }
}
