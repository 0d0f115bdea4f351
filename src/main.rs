//! Binary entry point: `serve` (HTTP API), `work` (queue worker), and
//! `init` (idempotent broker topology declaration).

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use taskqd::api::{self, ApiState};
use taskqd::backoff::BackoffStrategy;
use taskqd::broker::{self, topology::Topology, Publisher};
use taskqd::config::Config;
use taskqd::handler::HandlerRegistry;
use taskqd::store::TaskStore;
use taskqd::worker::Worker;
use taskqd::{db, Result};
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "taskqd",
    about = "Durable priority task queue over RabbitMQ and Postgres"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API: enqueue, task lookup, health, metrics.
    Serve,
    /// Run a worker consuming every configured priority queue.
    Work,
    /// Declare the broker topology idempotently, then exit.
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Work => work(config).await,
        Command::Init => init_topology(config).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config: Config) -> Result<()> {
    let addr = config.http_addr()?.to_string();
    let pool = db::connect(&config.db_dsn).await?;
    let conn = broker::connect(&config.broker_url).await?;
    let publisher = Publisher::new(conn.create_channel().await?);
    let topology = Topology::new(config.namespace.clone(), config.queues.clone());
    let metrics_handle = taskqd::metrics::install()?;

    let state = Arc::new(ApiState {
        store: TaskStore::new(pool),
        broker: conn,
        publisher,
        topology,
        metrics: metrics_handle,
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    Ok(())
}

async fn work(config: Config) -> Result<()> {
    let pool = db::connect(&config.db_dsn).await?;
    let conn = broker::connect(&config.broker_url).await?;
    let topology = Topology::new(config.namespace.clone(), config.queues.clone());
    let backoff = BackoffStrategy::from_config(&config.backoff);
    let registry = HandlerRegistry::with_builtin_handlers();

    let worker = Worker::new(
        conn,
        TaskStore::new(pool),
        registry,
        backoff,
        topology,
        config.prefetch,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await
}

async fn init_topology(config: Config) -> Result<()> {
    let conn = broker::connect(&config.broker_url).await?;
    let channel = conn.create_channel().await?;
    let topology = Topology::new(config.namespace.clone(), config.queues.clone());
    topology.declare(&channel).await?;
    tracing::info!(
        namespace = %config.namespace,
        queues = ?config.queues,
        "broker topology ensured"
    );
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
