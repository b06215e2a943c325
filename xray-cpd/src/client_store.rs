//! Client store. Applies the enabled-user list onto a running XRAY
//! instance. The core treats this as opaque; the fallback policy is the
//! concrete store's responsibility.

use std::collections::HashSet;

use xray_cp_common::render::{render_config, RenderInput};

use crate::ssh::SshExecutor;

fn upload_script(bytes: &[u8], path: &str, mode: &str) -> String {
    let delimiter = format!("XRAY_CP_{:012x}", rand::random::<u64>() & 0xffffffffffff);
    let mut body = String::from_utf8_lossy(bytes).into_owned();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    format!(
        "cat <<'{delimiter}' > {path}\n{body}{delimiter}\nchmod {mode} {path}"
    )
}

/// Which concrete `ClientStore` a host uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Rewrite `/opt/xray-cp/config.json` and `docker compose restart xray`.
    /// Always safe; incurs a restart.
    File,
    /// `xray api adu`/`rmu` over the localhost API inbound; falls back to
    /// `File` on health-check failure.
    Grpc,
}

pub struct ClientStoreContext<'a> {
    pub ssh: &'a SshExecutor,
    pub sudo_prefix: &'a str,
}

/// Rewrite the remote config to exactly the given client list and restart
/// XRAY. This is the `File` store's `sync`; it is also the fallback path for
/// `Grpc`.
pub async fn file_sync(ctx: &ClientStoreContext<'_>, input: &RenderInput) -> Result<(), xray_cp_common::AppError> {
    let bytes = render_config(input);
    let script = upload_script(&bytes, "/opt/xray-cp/config.json", "0600");
    let full = format!("{}bash -lc '{}'", ctx.sudo_prefix, script.replace('\'', "'\\''"));
    ctx.ssh.execute("Regenerate config.json to match users", &full).await?;
    ctx.ssh
        .execute(
            "Restart xray to apply user list",
            &format!("{}docker compose -f /opt/xray-cp/docker-compose.yml restart xray", ctx.sudo_prefix),
        )
        .await?;
    Ok(())
}

/// One email per line, as printed by `xray api inbounduser`. Blank lines are
/// skipped; anything else is taken as a live client id verbatim.
fn parse_inbound_user_list(stdout: &str) -> HashSet<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Live gRPC-ish store: health-check the API, list the inbound's current
/// users, then diff-apply against `input.clients` — `adu` for ids that
/// should be present but aren't, `rmu` for ids that are present but
/// shouldn't be (e.g. a revoked client). Falls back to the file store on any
/// non-zero exit along the way, since a partially-applied diff is worse than
/// a full rewrite.
pub async fn grpc_sync(
    ctx: &ClientStoreContext<'_>,
    input: &RenderInput,
) -> Result<(), xray_cp_common::AppError> {
    let health = ctx
        .ssh
        .execute(
            "Check live API health",
            &format!("{}docker exec xray xray api inboundusercount --server=127.0.0.1:10085 -tag vless-in", ctx.sudo_prefix),
        )
        .await?;

    if !health.success() {
        return file_sync(ctx, input).await;
    }

    let listing = ctx
        .ssh
        .execute(
            "List live API users",
            &format!("{}docker exec xray xray api inbounduser --server=127.0.0.1:10085 -tag vless-in", ctx.sudo_prefix),
        )
        .await?;

    if !listing.success() {
        return file_sync(ctx, input).await;
    }

    let live_ids = parse_inbound_user_list(&listing.stdout);
    let desired_ids: HashSet<String> = input.clients.iter().map(|c| c.id.clone()).collect();

    for id in desired_ids.difference(&live_ids) {
        let cmd = format!(
            "{}docker exec xray xray api adu --server=127.0.0.1:10085 -email {id}",
            ctx.sudo_prefix
        );
        let result = ctx.ssh.execute("Add user via live API", &cmd).await?;
        if !result.success() {
            return file_sync(ctx, input).await;
        }
    }

    for id in live_ids.difference(&desired_ids) {
        let cmd = format!(
            "{}docker exec xray xray api rmu --server=127.0.0.1:10085 -email {id}",
            ctx.sudo_prefix
        );
        let result = ctx.ssh.execute("Remove user via live API", &cmd).await?;
        if !result.success() {
            return file_sync(ctx, input).await;
        }
    }

    Ok(())
}

pub async fn sync(
    kind: StoreKind,
    ctx: &ClientStoreContext<'_>,
    input: &RenderInput,
) -> Result<(), xray_cp_common::AppError> {
    match kind {
        StoreKind::File => file_sync(ctx, input).await,
        StoreKind::Grpc => grpc_sync(ctx, input).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{FakeSshScript, ScriptedReply};
    use xray_cp_common::render::RenderClient;

    fn sample_input() -> RenderInput {
        RenderInput {
            listen_port: 443,
            reality_private_key: "priv".into(),
            server_name: "example.com".into(),
            dest: "example.com:443".into(),
            short_ids: vec!["deadbeef".into()],
            clients: vec![RenderClient {
                id: "e7f8e06d-2942-4cb9-bca5-6d511244f6d7".into(),
                email: None,
            }],
        }
    }

    #[tokio::test]
    async fn file_sync_rewrites_config_and_restarts() {
        let exec = SshExecutor::fake(FakeSshScript::new());
        let ctx = ClientStoreContext {
            ssh: &exec,
            sudo_prefix: "",
        };
        sync(StoreKind::File, &ctx, &sample_input()).await.unwrap();
        if let SshExecutor::Fake(script) = &exec {
            let guard = script.lock().unwrap();
            assert!(guard
                .commands_run
                .contains(&"Regenerate config.json to match users".to_string()));
            assert!(guard
                .commands_run
                .contains(&"Restart xray to apply user list".to_string()));
        }
    }

    #[tokio::test]
    async fn grpc_sync_falls_back_to_file_on_unhealthy_api() {
        let script = FakeSshScript::new().with_reply(
            "Check live API health",
            ScriptedReply::failure(1, "api unavailable"),
        );
        let exec = SshExecutor::fake(script);
        let ctx = ClientStoreContext {
            ssh: &exec,
            sudo_prefix: "",
        };
        sync(StoreKind::Grpc, &ctx, &sample_input()).await.unwrap();
        if let SshExecutor::Fake(script) = &exec {
            let guard = script.lock().unwrap();
            assert!(guard
                .commands_run
                .contains(&"Regenerate config.json to match users".to_string()));
        }
    }

    #[tokio::test]
    async fn grpc_sync_adds_new_client_and_removes_revoked_one() {
        let script = FakeSshScript::new()
            .with_reply("Check live API health", ScriptedReply::ok("1"))
            .with_reply(
                "List live API users",
                ScriptedReply::ok("e7f8e06d-2942-4cb9-bca5-6d511244f6d7\nrevoked-client-id\n"),
            );
        let exec = SshExecutor::fake(script);
        let ctx = ClientStoreContext {
            ssh: &exec,
            sudo_prefix: "",
        };

        let input = RenderInput {
            listen_port: 443,
            reality_private_key: "priv".into(),
            server_name: "example.com".into(),
            dest: "example.com:443".into(),
            short_ids: vec!["deadbeef".into()],
            clients: vec![
                RenderClient {
                    id: "e7f8e06d-2942-4cb9-bca5-6d511244f6d7".into(),
                    email: None,
                },
                RenderClient {
                    id: "new-client-id".into(),
                    email: None,
                },
            ],
        };

        sync(StoreKind::Grpc, &ctx, &input).await.unwrap();

        if let SshExecutor::Fake(script) = &exec {
            let guard = script.lock().unwrap();
            assert!(guard.commands_run.contains(&"Add user via live API".to_string()));
            assert!(guard.commands_run.contains(&"Remove user via live API".to_string()));
            assert!(!guard
                .commands_run
                .contains(&"Regenerate config.json to match users".to_string()));
        }
    }

    #[tokio::test]
    async fn grpc_sync_falls_back_to_file_when_listing_fails() {
        let script = FakeSshScript::new()
            .with_reply("Check live API health", ScriptedReply::ok("1"))
            .with_reply("List live API users", ScriptedReply::failure(1, "timed out"));
        let exec = SshExecutor::fake(script);
        let ctx = ClientStoreContext {
            ssh: &exec,
            sudo_prefix: "",
        };

        sync(StoreKind::Grpc, &ctx, &sample_input()).await.unwrap();

        if let SshExecutor::Fake(script) = &exec {
            let guard = script.lock().unwrap();
            assert!(guard
                .commands_run
                .contains(&"Regenerate config.json to match users".to_string()));
        }
    }
}
