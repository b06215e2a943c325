//! Job processor: the single `process` entry point the dispatch loop calls
//! into after popping a job off the queue.

use xray_cp_common::config::Config;
use xray_cp_common::{AppError, HostStatus, JobResult, JobType, LogLevel};

use crate::install::{self, InstallParams};
use crate::queue::{JobContext, JobHandoff, JobQueue};
use crate::repair::{self, RepairParams};
use crate::ssh::{FakeSshScript, ScriptedReply, SshExecutor, SshOptions, SshSecret};
use crate::store::Store;
use crate::workflow_common::{CONTAINER_PROBE_LABEL, DETECT_OS_LABEL, DOCKER_PROBE_LABEL};

/// Canned replies for every labelled probe the install/repair workflows can
/// issue, so a dry-run job reaches `READY` the same way a real install would:
/// a supported OS, Docker already present, the container already running,
/// the port already listening, and `nc` reachable.
fn default_dry_run_script() -> FakeSshScript {
    FakeSshScript::new()
        .with_reply(DETECT_OS_LABEL, ScriptedReply::ok("ubuntu"))
        .with_reply(DOCKER_PROBE_LABEL, ScriptedReply::ok("docker 24"))
        .with_reply(CONTAINER_PROBE_LABEL, ScriptedReply::ok("abc123"))
        .with_reply("Probe listening port", ScriptedReply::ok("LISTEN 443"))
        .with_reply("Probe external reachability", ScriptedReply::ok("NC_PRESENT:0"))
}

/// Resolve a host's SSH secret into a live (or faked) executor. `dry_run`
/// bypasses SSH entirely.
pub async fn build_executor(
    store: &Store,
    config: &Config,
    host_id: &xray_cp_common::HostId,
) -> Result<(String, SshExecutor), AppError> {
    let host = store.get_host(host_id).await?;

    if config.dry_run {
        return Ok((host.ssh_user, SshExecutor::fake(default_dry_run_script())));
    }

    let secret = store.get_secret(&host.ssh_secret_ref).await?;
    let plaintext = secret.reveal(&config.master_key);
    let ssh_secret = match secret.kind {
        xray_cp_common::SecretKind::Password => {
            SshSecret::Password(String::from_utf8_lossy(&plaintext).into_owned())
        }
        xray_cp_common::SecretKind::PrivateKey => {
            SshSecret::PrivateKey(String::from_utf8_lossy(&plaintext).into_owned())
        }
    };

    let options = SshOptions {
        connect_timeout: config.connect_timeout,
        command_timeout: config.command_timeout,
    };

    Ok((
        host.ssh_user.clone(),
        SshExecutor::real(host.host.clone(), host.ssh_user, ssh_secret, options),
    ))
}

/// Run one job to completion and record its outcome on the queue. This is
/// what the dispatch loop invokes for every [`JobHandoff`].
pub async fn process(
    handoff: JobHandoff,
    store: &Store,
    queue: &JobQueue,
    config: &Config,
) {
    let JobHandoff { job_type, host_id, ctx } = handoff;

    ctx.append_log(
        LogLevel::Info,
        format!("Job started: type={job_type} serverId={host_id} dryRun={}", config.dry_run),
    )
    .await;
    ctx.set_progress(5.0).await;

    let outcome = run_job(job_type, &host_id, store, config, &ctx).await;

    match outcome {
        Ok(result) => {
            queue.record_success(&ctx.job_id, result).await;
        }
        Err(err) if err.kind.is_cancellation() => {
            queue.record_cancelled(&ctx.job_id, err.to_string()).await;
        }
        Err(err) => {
            ctx.append_log(LogLevel::Error, format!("Job failed: {err}")).await;
            queue.record_failure(&ctx.job_id, err.to_string()).await;
        }
    }

    queue.finish(&ctx.job_id, &host_id).await;
}

async fn run_job(
    job_type: JobType,
    host_id: &xray_cp_common::HostId,
    store: &Store,
    config: &Config,
    ctx: &JobContext,
) -> Result<JobResult, AppError> {
    match job_type {
        JobType::Install => {
            let host = store.get_host(host_id).await?;
            if host.status == HostStatus::Ready {
                run_repair(host_id, store, config, ctx).await?;
                return Ok(JobResult {
                    already_installed: true,
                    ..Default::default()
                });
            }
            run_install(host_id, store, config, ctx).await?;
            ctx.set_progress(100.0).await;
            Ok(JobResult::default())
        }
        JobType::Repair => {
            let repair_result = run_repair(host_id, store, config, ctx).await?;
            Ok(JobResult {
                actions: repair_result.actions,
                status_before: Some(repair_result.status_before),
                status_after: Some(repair_result.status_after),
                ..Default::default()
            })
        }
    }
}

async fn run_install(
    host_id: &xray_cp_common::HostId,
    store: &Store,
    config: &Config,
    ctx: &JobContext,
) -> Result<(), AppError> {
    let (ssh_user, executor) = build_executor(store, config, host_id).await?;
    let params = InstallParams {
        host_id: host_id.clone(),
        ssh: &executor,
        ssh_user: &ssh_user,
        backoff: &config.retry_backoff,
        dry_run: config.dry_run,
    };
    install::run(&params, store, ctx).await
}

async fn run_repair(
    host_id: &xray_cp_common::HostId,
    store: &Store,
    config: &Config,
    ctx: &JobContext,
) -> Result<repair::RepairResult, AppError> {
    let host = store.get_host(host_id).await?;
    let (ssh_user, executor) = build_executor(store, config, host_id).await?;
    let params = RepairParams {
        host_id: host_id.clone(),
        ssh: &executor,
        ssh_user: &ssh_user,
        backoff: &config.retry_backoff,
        dry_run: config.dry_run,
        external_host: &host.host,
    };
    repair::run(&params, store, ctx).await
}
