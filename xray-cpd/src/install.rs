//! Install workflow: drives a host `NEW` -> `INSTALLING` ->
//! `READY`, or back out to `ERROR`/its prior status on failure/cancellation.

use rand::Rng;
use xray_cp_common::render::{render_compose, render_config, RenderClient, RenderInput};
use xray_cp_common::{AppError, ErrorKind, HostId, HostStatus, LogLevel, XrayInstance};

use crate::queue::JobContext;
use crate::ssh::SshExecutor;
use crate::store::Store;
use crate::workflow_common::{
    dry_run_key_material, ensure_supported_os, execute_checked, generate_short_ids,
    install_docker_script, parse_reality_keypair, sudo_prefix, upload_file_script,
    DETECT_OS_LABEL, DETECT_OS_SCRIPT, GENERATE_KEYPAIR_LABEL, GENERATE_KEYPAIR_SCRIPT,
    INSTALL_DOCKER_LABEL, PREPARE_DIRS_LABEL, PREPARE_DIRS_SCRIPT,
};

const REALITY_FINGERPRINT: &str = "chrome";
const REALITY_SERVER_NAME: &str = "www.microsoft.com";
const REALITY_DEST: &str = "www.microsoft.com:443";
const LISTEN_PORT: u16 = 443;

pub struct InstallParams<'a> {
    pub host_id: HostId,
    pub ssh: &'a SshExecutor,
    pub ssh_user: &'a str,
    pub backoff: &'a [std::time::Duration],
    pub dry_run: bool,
}

/// Run the 11-step install sequence against `params.host_id`. Returns
/// `Err(JobCancelled)` with the host reverted, or `Err(..)` with the host set
/// to `ERROR`, or `Ok(())` with the host `READY`.
pub async fn run(params: &InstallParams<'_>, store: &Store, ctx: &JobContext) -> Result<(), AppError> {
    let host = store.get_host(&params.host_id).await?;
    let status_before = host.status;
    let sudo = sudo_prefix(params.ssh_user);

    ctx.set_progress(5.0).await;

    match run_steps(params, store, ctx, sudo).await {
        Ok(()) => {
            store
                .update_host_status(&params.host_id, HostStatus::Ready, None)
                .await?;
            ctx.set_progress(100.0).await;
            Ok(())
        }
        Err(err) if err.kind.is_cancellation() => {
            store
                .update_host_status(&params.host_id, status_before, host.last_error.clone())
                .await?;
            ctx.append_log(LogLevel::Warn, "INSTALL cancelled").await;
            Err(err)
        }
        Err(err) => {
            store
                .update_host_status(
                    &params.host_id,
                    HostStatus::Error,
                    Some(err.kind.user_message()),
                )
                .await?;
            ctx.append_log(LogLevel::Error, format!("INSTALL failed: {err}"))
                .await;
            Err(err)
        }
    }
}

async fn run_steps(
    params: &InstallParams<'_>,
    store: &Store,
    ctx: &JobContext,
    sudo: &str,
) -> Result<(), AppError> {
    let cancel_check = {
        let ctx = ctx.clone();
        move || ctx.is_cancelled()
    };

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
    ctx.append_log(LogLevel::Info, format!("Detected OS: {}", os_probe.stdout.trim()))
        .await;

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

    ctx.set_progress(15.0).await;

    if ctx.is_cancelled() {
        return Err(AppError::new(ErrorKind::JobCancelled(
            "cancelled before runtime config".into(),
        )));
    }

    let instance = build_runtime_config(params, store, ctx, sudo, cancel_check.clone()).await?;

    let enabled_users = store.enabled_users(&params.host_id).await;
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

    let compose_bytes = render_compose();
    let config_bytes = render_config(&render_input);

    execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        "Upload docker-compose.yml",
        sudo,
        &upload_file_script(&compose_bytes, "/opt/xray-cp/docker-compose.yml", "0644"),
        true,
    )
    .await?;

    execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        "Upload config.json",
        sudo,
        &upload_file_script(&config_bytes, "/opt/xray-cp/config.json", "0600"),
        false,
    )
    .await?;

    if ctx.is_cancelled() {
        return Err(AppError::new(ErrorKind::JobCancelled(
            "cancelled before bring-up".into(),
        )));
    }

    execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        "Bring up xray",
        sudo,
        "docker compose -f /opt/xray-cp/docker-compose.yml up -d",
        true,
    )
    .await?;

    execute_checked(
        params.ssh,
        params.backoff,
        cancel_check.clone(),
        "Open firewall port",
        sudo,
        &open_firewall_script(instance.listen_port),
        true,
    )
    .await?;

    store.upsert_instance(instance).await;

    Ok(())
}

/// ufw if present, else an idempotent iptables insert (checks presence of the
/// rule before inserting it).
fn open_firewall_script(port: u16) -> String {
    format!(
        "if command -v ufw >/dev/null 2>&1; then ufw allow {port}/tcp; \
         else iptables -C INPUT -p tcp --dport {port} -j ACCEPT 2>/dev/null || \
         iptables -A INPUT -p tcp --dport {port} -j ACCEPT; fi"
    )
}

async fn build_runtime_config(
    params: &InstallParams<'_>,
    store: &Store,
    ctx: &JobContext,
    sudo: &str,
    cancel_check: impl Fn() -> bool,
) -> Result<XrayInstance, AppError> {
    if let Some(existing) = store.get_instance(&params.host_id).await {
        ctx.append_log(LogLevel::Info, "Reusing existing REALITY key material")
            .await;
        return Ok(existing);
    }

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
