use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kafka_http_gateway::client::kafka::KafkaConnector;
use kafka_http_gateway::config::Config;
use kafka_http_gateway::hints::MessageSizeHints;
use kafka_http_gateway::http::{self, AppState};
use kafka_http_gateway::pool::Pool;

/// REST gateway to an Apache Kafka cluster.
#[derive(Debug, Parser)]
#[command(name = "kafka-http-gateway", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration file.
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.global.address = listen;
    }

    init_tracing(&config);

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing the metrics recorder")?;

    let connector = Arc::new(KafkaConnector::new(config.dial_config()));
    let pool = Pool::connect(connector, config.pool_config())
        .await
        .context("dialing the broker pool")?;

    let address = config.global.address;
    let state = AppState {
        pool: Arc::clone(&pool),
        hints: Arc::new(MessageSizeHints::new()),
        config: Arc::new(config),
    };
    let app = http::router(state).route(
        "/metrics",
        get(move || async move { metrics_handle.render() }),
    );

    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!(%address, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("shutting down the broker pool");
    pool.close().await;
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = if config.global.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
