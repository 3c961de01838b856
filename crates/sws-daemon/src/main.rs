//! sws-daemon entry point.
//!
//! Parses the CLI, initializes logging, seeds the in-memory record
//! store, wires the event bridges, and serves the WebSocket endpoint
//! until SIGINT or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sws_core::alert::HttpSink;
use sws_core::policy::CpuStartMode;
use sws_core::record::{MemoryStore, RecordStore};
use sws_daemon::bridge::PassthroughProtector;
use sws_daemon::{Server, ServerConfig, server};

/// SWS tunnel server
#[derive(Parser, Debug)]
#[command(name = "sws-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to serve the WebSocket endpoint on
    #[arg(long, default_value = "127.0.0.1:8090")]
    addr: SocketAddr,

    /// Log blacklist writes instead of persisting them
    #[arg(long = "testingMode")]
    testing_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON fixture to seed the record store from
    #[arg(long)]
    seed: Option<PathBuf>,

    /// How the BOLO session probe derives its time value
    #[arg(long, value_enum, default_value = "derived")]
    cpu_start_mode: CpuStartArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CpuStartArg {
    /// round2(baseTimestamp - osClock); the intended form
    Derived,
    /// The reported clock value unmodified
    Raw,
}

impl From<CpuStartArg> for CpuStartMode {
    fn from(arg: CpuStartArg) -> Self {
        match arg {
            CpuStartArg::Derived => Self::Derived,
            CpuStartArg::Raw => Self::Raw,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.testing_mode {
        warn!("server is running with testing mode enabled");
    }

    let memory = Arc::new(MemoryStore::new());
    if let Some(path) = &args.seed {
        let fixture = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read seed fixture {}", path.display()))?;
        memory
            .load_seed(&fixture)
            .context("failed to load seed fixture")?;
        info!(path = %path.display(), "record store seeded");
    }
    let store: Arc<dyn RecordStore> = memory;

    let config = ServerConfig {
        testing_mode: args.testing_mode,
        cpu_start_mode: args.cpu_start_mode.into(),
        ..ServerConfig::default()
    };

    let sink = Arc::new(HttpSink::new().context("failed to build alert sink")?);
    let srv = Server::new(config, store, sink);
    srv.install_bridges(Arc::new(PassthroughProtector));

    let app = Router::new()
        .route("/subscribe", get(server::subscribe))
        .with_state(srv);

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    info!(addr = %args.addr, "sws-daemon listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("daemon shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to register SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}
