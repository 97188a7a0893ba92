//! tallyd - Tournament score reconciliation daemon
//!
//! Periodically reconciles the off-chain score ledger against the on-chain
//! tournament contract through the signing relay. Exposes a small diagnostic
//! HTTP surface for status inspection and manual resync triggers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tally_core::chain::{ChainClient, RpcChainClient};
use tally_core::config::TallyConfig;
use tally_core::ledger::ScoreLedger;
use tally_core::schedule::{SystemTimeSource, TimeSource};
use tally_daemon::diag::{self, DiagContext};
use tally_daemon::scheduler::Scheduler;
use tally_daemon::state::DaemonStateHandle;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// tallyd - tournament score reconciliation daemon
#[derive(Parser, Debug)]
#[command(name = "tallyd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/tally/tally.toml")]
    config: PathBuf,

    /// Override the ledger database path from the config
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Override the diagnostic listen address from the config
    #[arg(long)]
    diag_listen: Option<SocketAddr>,

    /// Log filter (overridden by `RUST_LOG` when set)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = TallyConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(db_path) = args.db_path {
        config.daemon.db_path = db_path;
    }
    if let Some(diag_listen) = args.diag_listen {
        config.daemon.diag_listen = diag_listen;
    }

    info!(
        config = %args.config.display(),
        db = %config.daemon.db_path.display(),
        relay = %config.chain.endpoint,
        "starting tallyd"
    );

    let ledger = ScoreLedger::open(&config.daemon.db_path).with_context(|| {
        format!(
            "failed to open ledger database {}",
            config.daemon.db_path.display()
        )
    })?;

    let chain: Arc<dyn ChainClient> = Arc::new(
        RpcChainClient::new(config.chain.clone()).context("failed to build chain relay client")?,
    );

    let time: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);
    let state = Arc::new(DaemonStateHandle::new(Utc::now()));
    let schedule = config
        .schedule
        .generator()
        .context("schedule parameters are inconsistent")?;

    // Startup signer check. Advisory only: a drifted signer is reported, and
    // every pass re-checks before submitting anything.
    match chain.verify_signer().await {
        Ok(check) if check.is_match => info!(signer = %check.configured, "signer authorized"),
        Ok(check) => error!(
            configured = %check.configured,
            authorized = %check.authorized,
            "signer is not the authorized writer; passes will fail until rotated"
        ),
        Err(e) => error!(error = %e, "signer check failed; will retry during passes"),
    }

    let scheduler = Arc::new(Scheduler::new(
        ledger.clone(),
        Arc::clone(&chain),
        config.sync.clone(),
        schedule,
        Arc::clone(&state),
        Arc::clone(&time),
        config.daemon.poll_interval,
        config.schedule.weeks_ahead,
    ));

    let scheduler_task = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run().await }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }

        signal_state.request_shutdown();
        let _ = shutdown_tx.send(());
    });

    let ctx = Arc::new(DiagContext {
        state,
        ledger,
        chain,
        scheduler,
        time,
    });
    let app = diag::router(ctx);
    let listener = tokio::net::TcpListener::bind(config.daemon.diag_listen)
        .await
        .with_context(|| format!("failed to bind {}", config.daemon.diag_listen))?;
    info!(addr = %config.daemon.diag_listen, "diagnostic server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
        .context("diagnostic server error")?;

    // The scheduler finishes its in-flight pass before observing the flag.
    info!("waiting for scheduler to drain");
    scheduler_task.await.context("scheduler task panicked")?;
    info!("tallyd stopped");

    Ok(())
}
