//! Repair workflow: an idempotent convergence pass. Never rotates an
//! existing REALITY key-pair; restarts XRAY only when something actually
//! changed.

use xray_cp_common::render::{render_compose, render_config, RenderClient, RenderInput};
use xray_cp_common::{AppError, ErrorKind, HostId, HostStatus, LogLevel, XrayInstance};

use crate::queue::JobContext;
use crate::ssh::SshExecutor;
use crate::store::Store;
use crate::workflow_common::{
    classify_reachability, container_running_script, dry_run_key_material, ensure_supported_os,
    execute_checked, external_reachability_script, generate_short_ids, hash_probe_script,
    install_docker_script, parse_hash_probe, parse_reality_keypair, port_listening_script,
    sha256_hex, sudo_prefix, upload_file_script, ReachabilityOutcome, CONTAINER_PROBE_LABEL,
    DETECT_OS_LABEL, DETECT_OS_SCRIPT, DOCKER_PROBE_LABEL, DOCKER_PROBE_SCRIPT,
    GENERATE_KEYPAIR_LABEL, GENERATE_KEYPAIR_SCRIPT, INSTALL_DOCKER_LABEL, PREPARE_DIRS_LABEL,
    PREPARE_DIRS_SCRIPT,
};

const REALITY_FINGERPRINT: &str = "chrome";
const REALITY_SERVER_NAME: &str = "www.microsoft.com";
const REALITY_DEST: &str = "www.microsoft.com:443";
const LISTEN_PORT: u16 = 443;
const COMPOSE_PATH: &str = "/opt/xray-cp/docker-compose.yml";
const CONFIG_PATH: &str = "/opt/xray-cp/config.json";

pub struct RepairParams<'a> {
    pub host_id: HostId,
    pub ssh: &'a SshExecutor,
    pub ssh_user: &'a str,
    pub backoff: &'a [std::time::Duration],
    pub dry_run: bool,
    /// Host address used for the informational external reachability probe.
    pub external_host: &'a str,
}

/// `{actions[], statusBefore, statusAfter}`, matching the shape stored on
/// `Job.result`.
#[derive(Debug, Clone)]
pub struct RepairResult {
    pub actions: Vec<String>,
    pub status_before: HostStatus,
    pub status_after: HostStatus,
}

pub async fn run(
    params: &RepairParams<'_>,
    store: &Store,
    ctx: &JobContext,
) -> Result<RepairResult, AppError> {
    let host = store.get_host(&params.host_id).await?;
    let status_before = host.status;
    let sudo = sudo_prefix(params.ssh_user);

    match run_steps(params, store, ctx, sudo).await {
        Ok(mut actions) => {
            if actions.is_empty() {
                actions.push("No repair actions required".to_string());
            }
            store
                .update_host_status(&params.host_id, HostStatus::Ready, None)
                .await?;
            Ok(RepairResult {
                actions,
                status_before,
                status_after: HostStatus::Ready,
            })
        }
        Err(err) if err.kind.is_cancellation() => {
            store
                .update_host_status(&params.host_id, status_before, host.last_error.clone())
                .await?;
            ctx.append_log(LogLevel::Warn, "REPAIR cancelled").await;
            Err(err)
        }
        Err(err) => {
            let repair_err = match err.kind {
                ErrorKind::CommandFailed { .. } => err,
                other => AppError::new(ErrorKind::RepairFailed(other.to_string())),
            };
            store
                .update_host_status(
                    &params.host_id,
                    HostStatus::Error,
                    Some(repair_err.kind.user_message()),
                )
                .await?;
            ctx.append_log(LogLevel::Error, format!("REPAIR failed: {repair_err}"))
                .await;
            Err(repair_err)
        }
    }
}

async fn run_steps(
    params: &RepairParams<'_>,
    store: &Store,
    ctx: &JobContext,
    sudo: &str,
) -> Result<Vec<String>, AppError> {
    let cancel_check = {
        let ctx = ctx.clone();
        move || ctx.is_cancelled()
    };
    let mut actions = Vec::new();

    if ctx.is_cancelled() {
        return Err(AppError::new(ErrorKind::JobCancelled(
            "cancelled before OS detection".into(),
        )));
    }

    let os_probe = execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        DETECT_OS_LABEL,
        sudo,
        DETECT_OS_SCRIPT,
        true,
    )
    .await?;
    ensure_supported_os(os_probe.stdout.trim())?;

    let docker_probe = execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        DOCKER_PROBE_LABEL,
        sudo,
        DOCKER_PROBE_SCRIPT,
        true,
    )
    .await?;
    if !docker_probe.success() {
        execute_checked(
            params.ssh,
            params.backoff,
            cancel_check.clone(),
            INSTALL_DOCKER_LABEL,
            sudo,
            &install_docker_script(os_probe.stdout.trim()),
            true,
        )
        .await?;
        actions.push(INSTALL_DOCKER_LABEL.to_string());
    }

    execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        PREPARE_DIRS_LABEL,
        sudo,
        PREPARE_DIRS_SCRIPT,
        true,
    )
    .await?;

    if ctx.is_cancelled() {
        return Err(AppError::new(ErrorKind::JobCancelled(
            "cancelled before runtime config".into(),
        )));
    }

    let instance = build_runtime_config(params, store, ctx, sudo, cancel_check.clone()).await?;

    let mut enabled_users = store.enabled_users(&params.host_id).await;
    enabled_users.sort_by(|a, b| a.uuid.cmp(&b.uuid));

    let render_input = RenderInput {
        listen_port: instance.listen_port,
        reality_private_key: instance.reality_private_key.clone(),
        server_name: instance.server_name.clone(),
        dest: instance.dest.clone(),
        short_ids: instance.short_ids.clone(),
        clients: enabled_users
            .iter()
            .map(|u| RenderClient {
                id: u.uuid.clone(),
                email: None,
            })
            .collect(),
    };

    let expected_compose = render_compose();
    let expected_config = render_config(&render_input);
    let expected_compose_hash = sha256_hex(&expected_compose);
    let expected_config_hash = sha256_hex(&expected_config);

    if ctx.is_cancelled() {
        return Err(AppError::new(ErrorKind::JobCancelled(
            "cancelled before hash probe".into(),
        )));
    }

    let compose_probe = execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        "Probe docker-compose.yml hash",
        sudo,
        &hash_probe_script(COMPOSE_PATH),
        true,
    )
    .await?;
    let compose_hash = parse_hash_probe(&compose_probe.stdout);

    let config_probe = execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        "Probe config.json hash",
        sudo,
        &hash_probe_script(CONFIG_PATH),
        true,
    )
    .await?;
    let config_hash = parse_hash_probe(&config_probe.stdout);

    let mut rewrote_any = false;

    if compose_hash.needs_update(&expected_compose_hash) {
        execute_checked(
            params.ssh,
            params.backoff,
            cancel_check.clone(),
            "Upload docker-compose.yml",
            sudo,
            &upload_file_script(&expected_compose, COMPOSE_PATH, "0644"),
            true,
        )
        .await?;
        actions.push("Recreate docker-compose.yml".to_string());
        rewrote_any = true;
    }

    if config_hash.needs_update(&expected_config_hash) {
        execute_checked(
            params.ssh,
            params.backoff,
            cancel_check.clone(),
            "Upload config.json",
            sudo,
            &upload_file_script(&expected_config, CONFIG_PATH, "0600"),
            false,
        )
        .await?;
        actions.push("Regenerate config.json to match users".to_string());
        rewrote_any = true;
    }

    if ctx.is_cancelled() {
        return Err(AppError::new(ErrorKind::JobCancelled(
            "cancelled before container probe".into(),
        )));
    }

    let container_probe = execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        CONTAINER_PROBE_LABEL,
        sudo,
        container_running_script(),
        true,
    )
    .await?;

    if container_probe.stdout.trim().is_empty() {
        execute_checked(
            params.ssh,
            params.backoff,
            cancel_check.clone(),
            "Start xray container",
            sudo,
            &format!("docker compose -f {COMPOSE_PATH} up -d"),
            true,
        )
        .await?;
        actions.push("Start xray container".to_string());
    } else if rewrote_any {
        execute_checked(
            params.ssh,
            params.backoff,
            cancel_check.clone(),
            "Restart xray container to apply configuration",
            sudo,
            &format!("docker compose -f {COMPOSE_PATH} up -d --force-recreate xray"),
            true,
        )
        .await?;
        actions.push("Restart xray container to apply configuration".to_string());
    }

    let port_probe = execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        "Probe listening port",
        sudo,
        &port_listening_script(instance.listen_port),
        true,
    )
    .await?;

    if port_probe.stdout.trim().is_empty() {
        execute_checked(
            params.ssh,
            params.backoff,
            cancel_check.clone(),
            "Restart xray container because port is not listening",
            sudo,
            &format!("docker compose -f {COMPOSE_PATH} restart xray"),
            true,
        )
        .await?;
        actions.push("Restart xray container because port is not listening".to_string());

        let reprobe = execute_checked(
            params.ssh,
            params.backoff,
            cancel_check.clone(),
            "Probe listening port",
            sudo,
            &port_listening_script(instance.listen_port),
            true,
        )
        .await?;

        if reprobe.stdout.trim().is_empty() {
            return Err(AppError::new(ErrorKind::RepairFailed(
                "XRAY port is not listening after repair".to_string(),
            )));
        }
    }

    let reachability_probe = execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        "Probe external reachability",
        sudo,
        &format!(
            "if command -v nc >/dev/null 2>&1; then {}; echo \"NC_PRESENT:$?\"; else echo NC_ABSENT; fi",
            external_reachability_script(params.external_host, instance.listen_port)
        ),
        true,
    )
    .await?;

    match classify_nc_output(&reachability_probe.stdout) {
        ReachabilityOutcome::No => {
            actions.push("External port is not reachable from this host".to_string());
        }
        ReachabilityOutcome::Skip => {
            actions.push("External reachability probe skipped".to_string());
        }
        ReachabilityOutcome::Yes => {}
    }

    store.upsert_instance(instance).await;

    Ok(actions)
}

fn classify_nc_output(stdout: &str) -> ReachabilityOutcome {
    if stdout.contains("NC_ABSENT") {
        return classify_reachability(false, 0);
    }
    let exit_code = stdout
        .lines()
        .find_map(|line| line.strip_prefix("NC_PRESENT:"))
        .and_then(|code| code.trim().parse::<i32>().ok())
        .unwrap_or(1);
    classify_reachability(true, exit_code)
}

async fn build_runtime_config(
    params: &RepairParams<'_>,
    store: &Store,
    ctx: &JobContext,
    sudo: &str,
    cancel_check: impl Fn() -> bool,
) -> Result<XrayInstance, AppError> {
    if let Some(existing) = store.get_instance(&params.host_id).await {
        return Ok(existing);
    }

    ctx.append_log(LogLevel::Info, "No existing XRAY instance; generating REALITY key material")
        .await;

    let mut rng = rand::rng();

    let (private_key, public_key) = if params.dry_run {
        (dry_run_key_material(&mut rng), dry_run_key_material(&mut rng))
    } else {
        let result = execute_checked(
            params.ssh,
            params.backoff,
            cancel_check,
            GENERATE_KEYPAIR_LABEL,
            sudo,
            GENERATE_KEYPAIR_SCRIPT,
            false,
        )
        .await?;
        parse_reality_keypair(&result.stdout, &result.stderr)?
    };

    let short_ids = generate_short_ids(&mut rng);
    let now = chrono::Utc::now();

    Ok(XrayInstance {
        id: uuid::Uuid::new_v4().to_string(),
        host_id: params.host_id.clone(),
        listen_port: LISTEN_PORT,
        reality_private_key: private_key,
        reality_public_key: public_key,
        server_name: REALITY_SERVER_NAME.to_string(),
        dest: REALITY_DEST.to_string(),
        fingerprint: REALITY_FINGERPRINT.to_string(),
        short_ids,
        created_at: now,
        updated_at: now,
    })
}
