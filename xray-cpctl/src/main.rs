//! Thin CLI client for the XRAY control plane.
//!
//! Host/secret/user rows are persisted to a small JSON state file between
//! invocations (the daemon itself keeps no such file — it is expected to
//! run for a process lifetime against a real relational store). Jobs are
//! not persisted: each invocation that triggers a job runs it to
//! completion in-process and prints the final status directly, which is
//! why `status`/`logs`/`cancel` against a job id from an earlier
//! invocation report `JOB_NOT_FOUND` here rather than reaching a
//! long-running daemon.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use xray_cp_common::config::Config;
use xray_cp_common::{Host, HostId, Secret, SecretId, SecretKind};
use xray_cpd::lock::LockStore;
use xray_cpd::log_sink::InstallLogSink;
use xray_cpd::processor;
use xray_cpd::queue::JobQueue;
use xray_cpd::store::{Store, StoreSnapshot};

#[derive(Parser)]
#[command(name = "xray-cpctl")]
#[command(author, version, about = "XRAY control plane CLI")]
struct Cli {
    /// Path to the CLI's persisted host/secret/user state file.
    #[arg(long)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new host.
    Hosts {
        #[command(subcommand)]
        action: HostsAction,
    },
    /// Run the install workflow against a registered host.
    Install { host_id: String },
    /// Run the repair workflow against a registered host.
    Repair { host_id: String },
    /// Print a job's current status (only meaningful within the same
    /// invocation that enqueued it; see module docs).
    Status { job_id: String },
    /// Print a job's log tail.
    Logs {
        job_id: String,
        #[arg(long, default_value = "200")]
        tail: usize,
    },
    /// Request cancellation of a job.
    Cancel { job_id: String },
}

#[derive(Subcommand)]
enum HostsAction {
    /// Add a host with a password-authenticated SSH credential.
    Add {
        host_id: String,
        host: String,
        ssh_user: String,
        #[arg(long)]
        password: String,
    },
}

fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("xray-cpctl")
        .join("state.json")
}

async fn load_state(path: &std::path::Path, store: &Store) {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return;
    };
    if let Ok(snapshot) = serde_json::from_slice::<StoreSnapshot>(&bytes) {
        store.restore(snapshot).await;
    }
}

async fn save_state(path: &std::path::Path, store: &Store) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let snapshot = store.snapshot().await;
    let bytes = serde_json::to_vec_pretty(&snapshot)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Which workflow a CLI invocation should run.
enum Workflow {
    Install,
    Repair,
}

/// Build a queue, run one job to completion, and print its final state.
async fn run_job_to_completion(
    store: &Store,
    config: &Config,
    workflow: Workflow,
    host_id: HostId,
) -> anyhow::Result<()> {
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

    let job_id = match workflow {
        Workflow::Install => queue.enqueue_install(host_id).await?,
        Workflow::Repair => queue.enqueue_repair(host_id).await?,
    };

    // Exactly one handoff is ever published for a single enqueued job; no
    // background dispatch task is needed for a one-shot CLI invocation.
    let handoff = handoff_rx
        .recv()
        .await
        .expect("job queue dropped its dispatch sender before handing off the job it just enqueued");
    processor::process(handoff, store, &queue, config).await;

    let job = queue.get_job(&job_id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let state_path = cli.state_file.clone().unwrap_or_else(default_state_path);
    let (config, _warnings) = Config::from_env();

    let store = Store::new();
    load_state(&state_path, &store).await;

    match cli.command {
        Commands::Hosts {
            action: HostsAction::Add { host_id, host, ssh_user, password },
        } => {
            let host_id = HostId::new(host_id);
            let secret_id = SecretId::new(format!("{}-ssh", host_id.as_str()));
            store
                .put_secret(Secret::seal(
                    secret_id.clone(),
                    SecretKind::Password,
                    password.as_bytes(),
                    &config.master_key,
                ))
                .await;
            store.put_host(Host::new(host_id.clone(), host, ssh_user, secret_id)).await;
            save_state(&state_path, &store).await?;
            println!("Host {} registered", host_id);
        }
        Commands::Install { host_id } => {
            let host_id = HostId::new(host_id);
            run_job_to_completion(&store, &config, Workflow::Install, host_id).await?;
            save_state(&state_path, &store).await?;
        }
        Commands::Repair { host_id } => {
            let host_id = HostId::new(host_id);
            run_job_to_completion(&store, &config, Workflow::Repair, host_id).await?;
            save_state(&state_path, &store).await?;
        }
        Commands::Status { job_id } => {
            println!("job {job_id} not found (no daemon process to query; see --help)");
        }
        Commands::Logs { job_id, tail } => {
            println!("job {job_id} not found (tail={tail}; no daemon process to query; see --help)");
        }
        Commands::Cancel { job_id } => {
            println!("job {job_id} not found (no daemon process to query; see --help)");
        }
    }

    Ok(())
}
