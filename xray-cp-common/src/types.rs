//! Data model: Host, Secret, XRAY Instance, User, Job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable host identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable job identity, minted at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque secret identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretId(pub String);

impl SecretId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `Host.status`. Transitions are driven only by the install/repair workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostStatus {
    New,
    Installing,
    Ready,
    Error,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Installing => "INSTALLING",
            Self::Ready => "READY",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// A registered remote host plus its SSH credential reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub host: String,
    pub ssh_user: String,
    pub ssh_secret_ref: SecretId,
    pub status: HostStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Host {
    pub fn new(id: HostId, host: String, ssh_user: String, ssh_secret_ref: SecretId) -> Self {
        let now = Utc::now();
        Self {
            id,
            host,
            ssh_user,
            ssh_secret_ref,
            status: HostStatus::New,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The plaintext payload kind a `Secret` decrypts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    Password,
    PrivateKey,
}

/// Opaque ciphertext addressed by id. The core only ever sees the decrypted
/// value at connect time (via [`Secret::reveal`]); it must never be logged or
/// persisted elsewhere.
#[derive(Clone, Serialize, Deserialize)]
pub struct Secret {
    pub id: SecretId,
    pub kind: SecretKind,
    ciphertext: Vec<u8>,
}

impl Secret {
    /// Construct from an already-decrypted value, storing it as if encrypted.
    /// A real deployment would call out to a KMS; the decrypt step here is an
    /// XOR-with-master-key placeholder that exists purely to keep the
    /// plaintext out of `Debug`/serde output by default.
    pub fn seal(id: SecretId, kind: SecretKind, plaintext: &[u8], master_key: &[u8; 32]) -> Self {
        Self {
            id,
            kind,
            ciphertext: xor_with_key(plaintext, master_key),
        }
    }

    /// Decrypt and return the plaintext. Callers must not log or persist the
    /// result.
    pub fn reveal(&self, master_key: &[u8; 32]) -> Vec<u8> {
        xor_with_key(&self.ciphertext, master_key)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ciphertext", &"<redacted>")
            .finish()
    }
}

fn xor_with_key(data: &[u8], key: &[u8; 32]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

/// Derived runtime descriptor for a host's XRAY deployment. The REALITY
/// key-pair and `short_ids` must be preserved byte-identical across
/// subsequent install/repair passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XrayInstance {
    pub id: String,
    pub host_id: HostId,
    pub listen_port: u16,
    pub reality_private_key: String,
    pub reality_public_key: String,
    pub server_name: String,
    pub dest: String,
    pub fingerprint: String,
    pub short_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A VLESS client belonging to a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub server_id: HostId,
    pub uuid: String,
    pub enabled: bool,
}

/// `Job.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Install,
    Repair,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Repair => write!(f, "repair"),
        }
    }
}

/// `Job.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// One ordered line in a job's log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogLine {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Terminal payload stored on a job that finished (successfully or by
/// cancellation).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobResult {
    pub canceled: bool,
    pub reason: Option<String>,
    pub already_installed: bool,
    pub actions: Vec<String>,
    pub status_before: Option<HostStatus>,
    pub status_after: Option<HostStatus>,
}

/// A queued record representing a pending, running, or completed workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub server_id: HostId,
    pub status: JobStatus,
    pub progress: u8,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub logs: Vec<JobLogLine>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, job_type: JobType, server_id: HostId) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_type,
            server_id,
            status: JobStatus::Queued,
            progress: 0,
            result: None,
            error: None,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Clamp to 0-100; non-finite or out-of-range inputs collapse to the
    /// nearest valid bound (NaN collapses to 0).
    pub fn set_progress(&mut self, n: f64) {
        let n = if n.is_finite() { n } else { 0.0 };
        self.progress = n.round().clamp(0.0, 100.0) as u8;
        self.updated_at = Utc::now();
    }

    pub fn append_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(JobLogLine {
            ts: Utc::now(),
            level,
            message: message.into(),
        });
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_progress_clamps_and_rounds() {
        let mut job = Job::new(JobId::new("j1"), JobType::Install, HostId::new("h1"));
        job.set_progress(-5.0);
        assert_eq!(job.progress, 0);
        job.set_progress(150.0);
        assert_eq!(job.progress, 100);
        job.set_progress(42.6);
        assert_eq!(job.progress, 43);
        job.set_progress(f64::NAN);
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn secret_roundtrips_through_seal_reveal_without_storing_plaintext() {
        let key = [7u8; 32];
        let secret = Secret::seal(
            SecretId::new("s1"),
            SecretKind::Password,
            b"hunter2",
            &key,
        );
        assert_eq!(secret.reveal(&key), b"hunter2");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn host_status_display_matches_wire_tokens() {
        assert_eq!(HostStatus::New.to_string(), "NEW");
        assert_eq!(HostStatus::Installing.to_string(), "INSTALLING");
        assert_eq!(HostStatus::Ready.to_string(), "READY");
        assert_eq!(HostStatus::Error.to_string(), "ERROR");
    }
}
