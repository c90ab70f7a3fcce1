use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fleet_monitor::{
    api::{ApiState, spawn_api_server},
    config::{Config, read_config_file},
    dispatch::CommandDispatcher,
    ingest::IngestionConsumer,
    ledger::CommandLedger,
    storage::open_backend,
    supervisor::{SupervisorHandle, SupervisorSettings},
    transport::build_broker,
    watchdog::WatchdogHandle,
};
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// JSON config file; without it the configuration is read from the environment
    #[arg(short)]
    file: Option<String>,
}

fn init() {
    let level = match std::env::var("APP_ENV").as_deref() {
        Ok("production") => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };

    let filter = filter::Targets::new().with_targets(vec![
        ("fleet_monitor", level),
        ("fleet_hub", level),
        ("tower_http", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();

    // panics are fatal, the process manager restarts the hub
    std::panic::set_hook(Box::new(|info| {
        error!("fatal: {info}");
        std::process::exit(1);
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = match &args.file {
        Some(path) => read_config_file(path)?,
        None => Config::from_env()?,
    };
    debug!("configuration: {config:?}");
    let agent_liveness = config.hub.agent_liveness()?;

    let store = open_backend(&config.store, &config.pool)
        .await
        .context("failed to open the store")?;

    let broker = build_broker(&config.broker.transport)?;
    info!("using broker {}", broker.describe());

    let consumer = IngestionConsumer::new(store.clone());
    let ingest_stats = consumer.stats();
    let supervisor =
        SupervisorHandle::spawn(broker, consumer, SupervisorSettings::from(&config.broker));

    let ledger = CommandLedger::new(store.clone());
    let dispatcher = CommandDispatcher::new(
        store.clone(),
        ledger.clone(),
        supervisor.sessions(),
        config.broker.command_queue.clone(),
    );

    let watchdog = WatchdogHandle::spawn(
        ledger.clone(),
        Duration::from_secs(config.hub.stale_command_secs),
        Duration::from_secs(config.hub.stale_scan_interval_secs.max(1)),
    );

    let state = ApiState::new(
        store.clone(),
        ledger,
        dispatcher,
        supervisor.clone(),
        ingest_stats,
        agent_liveness,
    )
    .with_watchdog(watchdog.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.hub.port));
    spawn_api_server(addr, state).await?;

    shutdown_signal().await;
    info!("shutting down");

    if let Err(e) = supervisor.shutdown().await {
        warn!("connection supervisor did not stop cleanly: {e}");
    }
    if let Err(e) = watchdog.shutdown().await {
        warn!("watchdog did not stop cleanly: {e}");
    }
    store.close().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
