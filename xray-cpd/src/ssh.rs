//! SSH executor.
//!
//! Connect, run one shell command, capture stdout/stderr/exit code, map
//! transport errors to the closed set, honour per-connect and per-command
//! timeouts. The connection is one-shot per command: no pooling.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::timeout;
use xray_cp_common::{AppError, ErrorKind};

/// Result of running one remote command. A non-zero `exit_code` is NOT an
/// error at this layer — callers decide.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub enum SshSecret {
    Password(String),
    PrivateKey(String),
}

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Canned reply for one labelled step in dry-run/test mode.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ScriptedReply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}

/// A table of labelled canned replies, consulted by label. Unlabelled calls
/// (or labels not present in the table) fall back to `exit_code=0` with
/// empty output, matching the install workflow's dry-run default.
#[derive(Debug, Clone, Default)]
pub struct FakeSshScript {
    replies: HashMap<String, ScriptedReply>,
    pub commands_run: Vec<String>,
}

impl FakeSshScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(mut self, label: impl Into<String>, reply: ScriptedReply) -> Self {
        self.replies.insert(label.into(), reply);
        self
    }
}

/// One-shot connect per command; no pooling.
pub enum SshExecutor {
    Real {
        host: String,
        user: String,
        secret: SshSecret,
        options: SshOptions,
    },
    /// Stubs all calls with canned output; used for dry-run mode and tests.
    Fake(std::sync::Mutex<FakeSshScript>),
}

impl SshExecutor {
    pub fn real(host: String, user: String, secret: SshSecret, options: SshOptions) -> Self {
        Self::Real {
            host,
            user,
            secret,
            options,
        }
    }

    pub fn fake(script: FakeSshScript) -> Self {
        Self::Fake(std::sync::Mutex::new(script))
    }

    /// Run `command` (already wrapped in `bash -lc '...'` and `sudo` as
    /// needed by the caller) under the step `label`. The label is used only
    /// for dry-run/test replay and logging, never sent to the remote host.
    pub async fn execute(&self, label: &str, command: &str) -> Result<CommandResult, AppError> {
        match self {
            Self::Real {
                host,
                user,
                secret,
                options,
            } => run_real(host, user, secret, options, command).await,
            Self::Fake(script) => {
                let mut guard = script.lock().expect("fake ssh script mutex poisoned");
                guard.commands_run.push(label.to_string());
                let reply = guard
                    .replies
                    .get(label)
                    .cloned()
                    .unwrap_or_else(|| ScriptedReply::ok(""));
                Ok(CommandResult {
                    stdout: reply.stdout,
                    stderr: reply.stderr,
                    exit_code: reply.exit_code,
                })
            }
        }
    }
}

async fn run_real(
    host: &str,
    user: &str,
    secret: &SshSecret,
    options: &SshOptions,
    command: &str,
) -> Result<CommandResult, AppError> {
    let connect = async {
        let mut builder = openssh::SessionBuilder::default();
        builder.user(user.to_string());
        builder.known_hosts_check(openssh::KnownHosts::Accept);
        if let SshSecret::PrivateKey(path) = secret {
            builder.keyfile(path);
        }
        builder.connect_mux(host).await
    };

    let session = match timeout(options.connect_timeout, connect).await {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => return Err(map_transport_error(&e.to_string())),
        Err(_) => return Err(AppError::new(ErrorKind::Timeout)),
    };

    let run = async {
        session
            .command("bash")
            .arg("-lc")
            .raw_arg(command)
            .output()
            .await
    };

    let output = match timeout(options.command_timeout, run).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(map_transport_error(&e.to_string())),
        Err(_) => {
            let _ = session.close().await;
            return Err(AppError::new(ErrorKind::Timeout));
        }
    };

    let _ = session.close().await;

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Deterministic, priority-ordered error mapping.
fn map_transport_error(message: &str) -> AppError {
    let lower = message.to_ascii_lowercase();

    if lower.contains("permission denied")
        || lower.contains("authentication")
        || lower.contains("auth fail")
    {
        return AppError::with_cause(ErrorKind::AuthFailed, anyhow::anyhow!(message.to_string()));
    }

    if lower.contains("etimedout") || lower.contains("timed out") {
        return AppError::with_cause(ErrorKind::Timeout, anyhow::anyhow!(message.to_string()));
    }

    if lower.contains("enotfound")
        || lower.contains("ehostunreach")
        || lower.contains("econnrefused")
        || lower.contains("econnreset")
        || lower.contains("no route to host")
        || lower.contains("connection refused")
        || lower.contains("name or service not known")
    {
        return AppError::with_cause(
            ErrorKind::HostUnreachable,
            anyhow::anyhow!(message.to_string()),
        );
    }

    AppError::with_cause(
        ErrorKind::CommandFailed {
            command: "connect".into(),
            exit_code: -1,
            stderr_excerpt: Some(truncate(message, 500)),
        },
        anyhow::anyhow!(message.to_string()),
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s[..max].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_executor_returns_scripted_reply_by_label() {
        let script =
            FakeSshScript::new().with_reply("Detect OS", ScriptedReply::ok("ubuntu"));
        let exec = SshExecutor::fake(script);
        let result = exec.execute("Detect OS", "irrelevant").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "ubuntu");
    }

    #[tokio::test]
    async fn fake_executor_defaults_unscripted_labels_to_success() {
        let exec = SshExecutor::fake(FakeSshScript::new());
        let result = exec.execute("Unscripted step", "x").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "");
    }

    #[tokio::test]
    async fn fake_executor_records_commands_run_in_order() {
        let exec = SshExecutor::fake(FakeSshScript::new());
        exec.execute("a", "x").await.unwrap();
        exec.execute("b", "y").await.unwrap();
        if let SshExecutor::Fake(script) = &exec {
            let guard = script.lock().unwrap();
            assert_eq!(guard.commands_run, vec!["a".to_string(), "b".to_string()]);
        } else {
            panic!("expected fake executor");
        }
    }

    #[test]
    fn maps_auth_failure_before_other_classes() {
        let err = map_transport_error("Permission denied (publickey)");
        assert_eq!(err.kind.tag(), "AUTH_FAILED");
    }

    #[test]
    fn maps_timeout_message() {
        let err = map_transport_error("connect ETIMEDOUT 10.0.0.1:22");
        assert_eq!(err.kind.tag(), "TIMEOUT");
    }

    #[test]
    fn maps_unreachable_codes() {
        for msg in ["ECONNREFUSED", "EHOSTUNREACH", "ENOTFOUND", "ECONNRESET"] {
            let err = map_transport_error(msg);
            assert_eq!(err.kind.tag(), "HOST_UNREACHABLE", "failed for {msg}");
        }
    }

    #[test]
    fn falls_back_to_command_failed_with_details() {
        let err = map_transport_error("some unexpected transport error");
        assert_eq!(err.kind.tag(), "COMMAND_FAILED");
    }
}
