mod adapter;
mod config;
mod handler;
mod heartbeat;
mod session;
mod socket;
mod state_dir;

use adapter::ProtocolAdapters;
use anyhow::{Context, Result};
use clap::Parser;
use config::{CliOverrides, Config};
use handler::NodeState;
use pinger::client::default_socket_path;
use pinger_crypto::host_id::load_or_create_host_id;
use pinger_push::fanout::alert_all_devices;
use pinger_push::{Dispatcher, HttpGateway, MemoryGateway, PushGateway};
use pinger_store::{DeviceRegistry, MemoryStore, SqliteStore, Store, run_blocking};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "pinger mail-push daemon")]
struct Args {
    /// TOML config file. Built-in defaults apply without one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the Unix socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// State directory for the host id and the device database.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// SQLite database file (default: <state-dir>/pinger.db).
    #[arg(long, conflicts_with = "memory_store")]
    db: Option<PathBuf>,

    /// Keep device records in memory only.
    #[arg(long)]
    memory_store: bool,

    /// Push relay base URL. Overrides the config file.
    #[arg(long)]
    push_relay: Option<String>,

    /// Accept registrations even when the push endpoint cannot be created.
    #[arg(long)]
    ignore_push_failures: bool,

    /// Debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    config.apply(&CliOverrides {
        debug: args.debug,
        ignore_push_failures: args.ignore_push_failures,
        push_relay: args.push_relay.clone(),
    });

    let default_filter = if config.backend.debug {
        "pinger_node=debug,pinger_push=debug,pinger_store=debug"
    } else {
        "pinger_node=info,pinger_push=info,pinger_store=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    pinger_store::validate_schema().context("device schema is inconsistent")?;

    let state_dir = match args.state_dir {
        Some(dir) => dir,
        None => state_dir::default_state_dir()?,
    };
    state_dir::ensure_state_dir(&state_dir)?;
    let socket_path = args.socket.unwrap_or_else(default_socket_path);

    let pinger_id = load_or_create_host_id(&state_dir).context("failed to load host id")?;
    tracing::info!(pinger_id = %pinger_id, "host id loaded");

    let store: Arc<dyn Store> = if args.memory_store {
        tracing::warn!("using in-memory device store, registrations will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let db = args
            .db
            .unwrap_or_else(|| state_dir::default_db_path(&state_dir));
        Arc::new(SqliteStore::open(&db).context("failed to open device database")?)
    };
    let devices = DeviceRegistry::new(store, pinger_id);

    let gateway: Arc<dyn PushGateway> = match &config.push.relay_url {
        Some(url) => {
            tracing::info!(relay = %url, "pushing through relay");
            Arc::new(HttpGateway::new(url, config.push.api_key.clone())?)
        }
        None => {
            tracing::warn!("no push relay configured, notifications stay in-process");
            Arc::new(MemoryGateway::new())
        }
    };
    let dispatcher = Dispatcher::new(gateway, config.payload_settings());

    let registry = devices.clone();
    run_blocking(move || registry.touch_heartbeat())
        .await
        .context("failed to write heartbeat")?;

    let state = NodeState::new(
        config,
        devices,
        dispatcher,
        Arc::new(ProtocolAdapters::from_env()),
    );

    tokio::spawn(heartbeat::run(
        state.devices.clone(),
        state.config.backend.heartbeat_interval(),
        state.shutdown_signal(),
    ));

    if state.config.backend.rearm_on_start {
        let state = state.clone();
        tokio::spawn(async move {
            let delay = Duration::from_secs(state.config.backend.rearm_timeout_secs);
            tokio::time::sleep(delay).await;
            match alert_all_devices(&state.devices, &state.dispatcher).await {
                Ok(sent) => tracing::info!(sent, "asked owned devices to re-register"),
                Err(e) => tracing::error!(err = %e, "re-register fan-out failed"),
            }
        });
    }

    let mut shutdown = state.shutdown_signal();
    tokio::select! {
        result = socket::serve(state.clone(), &socket_path) => {
            result.context("socket server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = shutdown.wait_for(|down| *down) => {
            tracing::info!("shutdown requested");
        }
    }

    state.begin_shutdown();
    let stopped = state
        .sessions
        .drain(state.config.backend.shutdown_grace())
        .await;
    tracing::info!(sessions = stopped, "sessions stopped");

    std::fs::remove_file(&socket_path).ok();
    tracing::info!("pinger-node shut down");
    Ok(())
}
