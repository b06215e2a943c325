//! XRAY control plane daemon.
//!
//! Runs the per-host install/repair dispatch loop and serves the
//! `/health`, `/ready`, `/metrics` observability endpoints.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use xray_cp_common::config::Config;
use xray_cpd::http_api::{self, HttpState};
use xray_cpd::lock::LockStore;
use xray_cpd::log_sink::InstallLogSink;
use xray_cpd::processor;
use xray_cpd::queue::JobQueue;
use xray_cpd::store::Store;

#[derive(Parser)]
#[command(name = "xray-cpd")]
#[command(author, version, about = "XRAY control plane daemon")]
struct Cli {
    /// HTTP port for /health, /ready, /metrics.
    #[arg(long, default_value = "8090")]
    http_port: u16,

    /// Enable verbose (debug) logging, overriding RUST_LOG.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let (config, warnings) = Config::from_env();
    for warning in &warnings {
        tracing::warn!(field = warning.field, "{}", warning.message);
    }

    http_api::register_metrics();

    let store = Arc::new(Store::new());
    let lock_store = Arc::new(LockStore::new());
    let log_sink = Arc::new(InstallLogSink::new(config.install_log_dir.clone()));

    let (queue, mut handoff_rx) = JobQueue::new(
        lock_store,
        log_sink,
        config.lock_ttl,
        config.cancel_flag_ttl,
        config.completed_retention,
        config.failed_retention,
        config.retention_records,
    );
    let queue = Arc::new(queue);

    let http_state = HttpState {
        queue: queue.clone(),
        version: env!("CARGO_PKG_VERSION"),
        started_at: Instant::now(),
        pid: std::process::id(),
    };
    let _http_handle = http_api::start_server(cli.http_port, http_state).await;

    tracing::info!("xray-cpd dispatch loop starting (dry_run={})", config.dry_run);

    while let Some(handoff) = handoff_rx.recv().await {
        let store = store.clone();
        let queue = queue.clone();
        let config = config.clone();
        http_api::job_started();
        tokio::spawn(async move {
            processor::process(handoff, &store, &queue, &config).await;
            http_api::job_finished();
        });
    }

    Ok(())
}
