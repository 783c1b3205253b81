use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

mod config;
use config::{Config, MetricsConfig};
use fleet::accounts::{AccountRouter, CREDENTIALS_UPDATE_FREQUENCY_SECONDS};
use fleet::health::HealthSupervisor;
use fleet::registry::Registry;
use gateway::errors::GatewayError;
use gateway::service::Dispatcher;
use metrics_exporter_statsd::StatsdBuilder;
use shared::client::BackendClient;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// One full pass over all registered health checks per this many seconds.
const HEALTH_CHECK_FREQUENCY_SECONDS: u64 = 15;

/// Aggregating reverse proxy for a fleet of account-sharded clouddrivers.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Failed to load config file: {0}")]
    ConfigLoadError(#[from] config::ConfigError),
    #[error("Failed to create runtime: {0}")]
    RuntimeError(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        std::process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config_file_path)?;
    init_statsd_recorder("cumulus", config.metrics.clone());

    if config.clouddrivers.is_empty() && config.controller.is_none() {
        tracing::warn!("No clouddrivers defined in config, and controller not configured");
    }
    for clouddriver in &config.clouddrivers {
        tracing::info!(name = %clouddriver.name, url = %clouddriver.url, "Configured clouddriver");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    if let Err(e) = rt.block_on(serve(config)) {
        tracing::error!(error = %e, "Runtime error");
        process::exit(1);
    }
    Ok(())
}

async fn serve(config: Config) -> Result<(), GatewayError> {
    let health = HealthSupervisor::new(HEALTH_CHECK_FREQUENCY_SECONDS);
    let client = BackendClient::new(&config.http_client_config);

    let registry = Registry::new(
        config.clouddrivers,
        config.spinnaker_user,
        health.clone(),
        client.clone(),
    );

    let accounts = AccountRouter::new();
    health.add_check("account-router", false, accounts.sync_check());
    tokio::spawn(accounts.clone().run(
        registry.clone(),
        client.clone(),
        Duration::from_secs(CREDENTIALS_UPDATE_FREQUENCY_SECONDS),
    ));

    if let Some(controller) = config.controller {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(fleet::discovery::run(controller, tx));

        let registry = registry.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                registry.apply(update);
            }
        });
    }

    tokio::spawn(health.clone().run());

    let dispatcher = Dispatcher {
        client,
        accounts,
        health,
    };

    tokio::select! {
        result = gateway::run(config.http_listen_port, dispatcher) => result,
        _ = shutdown_signal() => {
            tracing::info!("Exiting cleanly");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

fn init_statsd_recorder(prefix: &str, metrics_config: Option<MetricsConfig>) {
    if let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        let recorder = StatsdBuilder::from(statsd_host, statsd_port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder")
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
