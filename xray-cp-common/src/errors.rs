//! Closed error catalog.
//!
//! `ErrorKind` enumerates exactly the kinds the core can surface. Unlike a
//! sprawling per-subsystem catalog, this system's error surface is small
//! enough to fit in one enum with a stable wire tag and an HTTP-status-like
//! code per variant.

use std::fmt;
use thiserror::Error;

/// One of the closed set of kinds the core can surface.
#[derive(Debug, Clone, Error)]
pub enum ErrorKind {
    #[error("authentication failed")]
    AuthFailed,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("operation timed out")]
    Timeout,

    #[error("command failed: {command} (exit {exit_code})")]
    CommandFailed {
        command: String,
        exit_code: i32,
        /// Truncated to 500 bytes; never populated for sensitive steps.
        stderr_excerpt: Option<String>,
    },

    #[error("server not found")]
    ServerNotFound,

    #[error("secret not found")]
    SecretNotFound,

    #[error("secret decryption failed")]
    SecretDecryptFailed,

    #[error("repair failed: {0}")]
    RepairFailed(String),

    #[error("job cancelled: {0}")]
    JobCancelled(String),

    #[error("job not found")]
    JobNotFound,

    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("server busy")]
    ServerBusy,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorKind {
    /// Stable wire tag used by the external interface.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::HostUnreachable => "HOST_UNREACHABLE",
            Self::Timeout => "TIMEOUT",
            Self::CommandFailed { .. } => "COMMAND_FAILED",
            Self::ServerNotFound => "SERVER_NOT_FOUND",
            Self::SecretNotFound => "SECRET_NOT_FOUND",
            Self::SecretDecryptFailed => "SECRET_DECRYPT_FAILED",
            Self::RepairFailed(_) => "REPAIR_FAILED",
            Self::JobCancelled(_) => "JOB_CANCELLED",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::JobFailed(_) => "JOB_FAILED",
            Self::ServerBusy => "SERVER_BUSY",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP-status-adjacent code for the external interface; purely
    /// informational for kinds that surface nowhere else.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ServerNotFound | Self::SecretNotFound | Self::JobNotFound => 404,
            Self::ServerBusy => 409,
            Self::AuthFailed => 401,
            Self::Timeout => 504,
            Self::HostUnreachable => 502,
            Self::CommandFailed { .. }
            | Self::SecretDecryptFailed
            | Self::RepairFailed(_)
            | Self::JobCancelled(_)
            | Self::JobFailed(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Only `HOST_UNREACHABLE` and `TIMEOUT` are transient network errors
    /// eligible for the retry policy's bounded backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HostUnreachable | Self::Timeout)
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::JobCancelled(_))
    }

    /// Message surfaced to `job.error`/`host.lastError`. Unlike `Display`,
    /// this never leaks a remote command's label or exit code: a failed SSH
    /// step always surfaces as the flat string `"SSH command failed"`, with
    /// the command/exit-code/stderr detail available to operators only
    /// through the install log tail, not through this user-facing field.
    pub fn user_message(&self) -> String {
        match self {
            Self::CommandFailed { .. } => "SSH command failed".to_string(),
            other => other.to_string(),
        }
    }
}

/// Wraps an [`ErrorKind`] plus an optional diagnostic cause. The cause is for
/// human-facing display only; it never widens the closed kind taxonomy.
#[derive(Debug, Error)]
pub struct AppError {
    pub kind: ErrorKind,
    #[source]
    pub cause: Option<anyhow::Error>,
}

impl AppError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, cause: None }
    }

    pub fn with_cause(kind: ErrorKind, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            cause: Some(cause.into()),
        }
    }

    pub fn tag(&self) -> &'static str {
        self.kind.tag()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl From<ErrorKind> for AppError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}
