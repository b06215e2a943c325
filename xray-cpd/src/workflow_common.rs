//! Shared building blocks for the install and repair workflows: the
//! `executeChecked` step wrapper, OS/Docker probes, REALITY key-pair
//! generation, file upload, and remote hash probing.

use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};
use xray_cp_common::{AppError, ErrorKind};

use crate::retry::with_retry;
use crate::ssh::SshExecutor;

/// `sudo ` when the SSH user is not root, otherwise empty.
pub fn sudo_prefix(ssh_user: &str) -> &'static str {
    if ssh_user == "root" { "" } else { "sudo " }
}

fn wrap_bash(sudo: &str, body: &str) -> String {
    format!("{sudo}bash -lc '{}'", body.replace('\'', "'\\''"))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max { s.to_string() } else { s[..max].to_string() }
}

/// A single labelled, checked step: non-zero exit becomes `COMMAND_FAILED`
/// with the label, exit code, and (if not sensitive) a 500-byte stderr
/// excerpt. Retries transient network errors via the retry policy.
pub async fn execute_checked(
    ssh: &SshExecutor,
    backoff: &[std::time::Duration],
    is_cancelled: impl Fn() -> bool,
    label: &str,
    sudo: &str,
    body: &str,
    include_stderr_in_error: bool,
) -> Result<crate::ssh::CommandResult, AppError> {
    let command = wrap_bash(sudo, body);
    let result = with_retry(backoff, is_cancelled, || ssh.execute(label, &command)).await?;

    if !result.success() {
        let stderr_excerpt = include_stderr_in_error.then(|| truncate(&result.stderr, 500));
        return Err(AppError::new(ErrorKind::CommandFailed {
            command: label.to_string(),
            exit_code: result.exit_code,
            stderr_excerpt,
        }));
    }

    Ok(result)
}

pub const DETECT_OS_LABEL: &str = "Detect OS";
pub const DETECT_OS_SCRIPT: &str = "source /etc/os-release && printf \"%s\" \"$ID\"";

pub fn ensure_supported_os(os_id: &str) -> Result<(), AppError> {
    match os_id {
        "ubuntu" | "debian" => Ok(()),
        other => Err(AppError::new(ErrorKind::CommandFailed {
            command: DETECT_OS_LABEL.to_string(),
            exit_code: 0,
            stderr_excerpt: Some(format!("Unsupported OS: {other}")),
        })),
    }
}

pub const INSTALL_DOCKER_LABEL: &str = "Install Docker and Compose plugin";

pub fn install_docker_script(os_id: &str) -> String {
    format!(
        "set -e; \
         curl -fsSL https://download.docker.com/linux/{os_id}/gpg | gpg --dearmor -o /usr/share/keyrings/docker.gpg; \
         echo \"deb [signed-by=/usr/share/keyrings/docker.gpg] https://download.docker.com/linux/{os_id} $(source /etc/os-release && echo $VERSION_CODENAME) stable\" > /etc/apt/sources.list.d/docker.list; \
         apt-get update -y; \
         apt-get install -y docker-ce docker-ce-cli containerd.io docker-buildx-plugin docker-compose-plugin; \
         systemctl enable --now docker"
    )
}

pub const DOCKER_PROBE_LABEL: &str = "Probe Docker installation";
pub const DOCKER_PROBE_SCRIPT: &str = "command -v docker && docker compose version";

pub const PREPARE_DIRS_LABEL: &str = "Prepare directories";
pub const PREPARE_DIRS_SCRIPT: &str = "mkdir -p /opt/xray-cp /var/log/xray";

pub const GENERATE_KEYPAIR_LABEL: &str = "Generate REALITY keypair";
pub const GENERATE_KEYPAIR_SCRIPT: &str =
    "docker run --rm ghcr.io/xtls/xray-core:latest xray x25519";

/// Parse `Private key: <...>` / `Public key: <...>` from combined
/// stdout+stderr.
pub fn parse_reality_keypair(stdout: &str, stderr: &str) -> Result<(String, String), AppError> {
    let combined = format!("{stdout}\n{stderr}");
    let private_key = extract_after(&combined, "Private key:");
    let public_key = extract_after(&combined, "Public key:");
    match (private_key, public_key) {
        (Some(private_key), Some(public_key)) => Ok((private_key, public_key)),
        _ => Err(AppError::new(ErrorKind::CommandFailed {
            command: GENERATE_KEYPAIR_LABEL.to_string(),
            exit_code: 0,
            stderr_excerpt: Some("Failed to parse REALITY keypair output".to_string()),
        })),
    }
}

fn extract_after<'a>(text: &'a str, prefix: &str) -> Option<String> {
    text.lines().find_map(|line| {
        line.trim()
            .strip_prefix(prefix)
            .map(|rest| rest.trim().to_string())
    })
}

/// 4 distinct hex short-ids, each 8-16 hex characters.
pub fn generate_short_ids<R: Rng>(rng: &mut R) -> Vec<String> {
    let mut ids = Vec::with_capacity(4);
    while ids.len() < 4 {
        let mut bytes = [0u8; 8];
        rng.fill(&mut bytes);
        let full = hex::encode(bytes);
        let len = 8 + (rng.random::<usize>() % 9); // 8..=16
        let candidate = full[..len].to_string();
        if !ids.contains(&candidate) {
            ids.push(candidate);
        }
    }
    ids
}

/// Fresh random 32-byte URL-safe base64 value, used in place of a real
/// REALITY key when `dry_run` is set.
pub fn dry_run_key_material<R: Rng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A heredoc-based upload script with a random delimiter; chmods in the same
/// session.
pub fn upload_file_script(bytes: &[u8], remote_path: &str, mode: &str) -> String {
    let mut rng = rand::rng();
    let mut delim_bytes = [0u8; 6];
    rng.fill(&mut delim_bytes);
    let delimiter = format!("XRAY_CP_{}", hex::encode(delim_bytes));
    let mut body = String::from_utf8_lossy(bytes).into_owned();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    format!("cat <<'{delimiter}' > {remote_path}\n{body}{delimiter}\nchmod {mode} {remote_path}")
}

/// Outcome of a remote hash probe. `Missing` and `Unavailable` both
/// normalise to "needs update".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashProbe {
    Hash(String),
    Missing,
    Unavailable,
}

impl HashProbe {
    pub fn needs_update(&self, expected_hash_lower: &str) -> bool {
        match self {
            Self::Hash(h) => h.to_ascii_lowercase() != expected_hash_lower,
            Self::Missing | Self::Unavailable => true,
        }
    }
}

pub fn hash_probe_script(remote_path: &str) -> String {
    format!(
        "if [ ! -f {remote_path} ]; then echo MISSING; \
         elif command -v sha256sum >/dev/null 2>&1; then sha256sum {remote_path} | awk '{{print $1}}'; \
         elif command -v openssl >/dev/null 2>&1; then openssl dgst -sha256 {remote_path} | awk '{{print $NF}}'; \
         else echo UNAVAILABLE; fi"
    )
}

pub fn parse_hash_probe(stdout: &str) -> HashProbe {
    match stdout.trim() {
        "MISSING" => HashProbe::Missing,
        "UNAVAILABLE" => HashProbe::Unavailable,
        other if other.is_empty() => HashProbe::Unavailable,
        other => HashProbe::Hash(other.to_string()),
    }
}

pub const CONTAINER_PROBE_LABEL: &str = "Probe xray container";

pub fn container_running_script() -> &'static str {
    "docker ps --filter \"name=^/xray$\" --filter \"status=running\" -q"
}

pub fn port_listening_script(port: u16) -> String {
    format!("ss -lntp | grep ':{port}'")
}

pub fn external_reachability_script(host: &str, port: u16) -> String {
    format!("nc -z -w 3 {host} {port}")
}

/// Outcome of the informational external reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityOutcome {
    Yes,
    No,
    Skip,
}

pub fn classify_reachability(nc_present: bool, exit_code: i32) -> ReachabilityOutcome {
    if !nc_present {
        ReachabilityOutcome::Skip
    } else if exit_code == 0 {
        ReachabilityOutcome::Yes
    } else {
        ReachabilityOutcome::No
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sudo_prefix_applies_only_for_non_root_users() {
        assert_eq!(sudo_prefix("root"), "");
        assert_eq!(sudo_prefix("deploy"), "sudo ");
    }

    #[test]
    fn ensure_supported_os_accepts_ubuntu_and_debian_only() {
        assert!(ensure_supported_os("ubuntu").is_ok());
        assert!(ensure_supported_os("debian").is_ok());
        let err = ensure_supported_os("centos").unwrap_err();
        assert_eq!(err.kind.tag(), "COMMAND_FAILED");
    }

    #[test]
    fn parse_reality_keypair_extracts_both_keys() {
        let stdout = "Private key: abc123\nPublic key: def456\n";
        let (private_key, public_key) = parse_reality_keypair(stdout, "").unwrap();
        assert_eq!(private_key, "abc123");
        assert_eq!(public_key, "def456");
    }

    #[test]
    fn parse_reality_keypair_fails_on_unparsable_output() {
        let err = parse_reality_keypair("garbage", "").unwrap_err();
        assert_eq!(err.kind.tag(), "COMMAND_FAILED");
    }

    #[test]
    fn generate_short_ids_produces_four_distinct_hex_ids_in_range() {
        let mut rng = rand::rng();
        let ids = generate_short_ids(&mut rng);
        assert_eq!(ids.len(), 4);
        let mut seen = std::collections::HashSet::new();
        for id in &ids {
            assert!(id.len() >= 8 && id.len() <= 16);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(id.clone()), "short ids must be distinct");
        }
    }

    #[test]
    fn hash_probe_needs_update_normalises_missing_and_unavailable() {
        let expected = "abc".to_string();
        assert!(HashProbe::Missing.needs_update(&expected));
        assert!(HashProbe::Unavailable.needs_update(&expected));
        assert!(!HashProbe::Hash("ABC".into()).needs_update(&expected));
        assert!(HashProbe::Hash("xyz".into()).needs_update(&expected));
    }

    #[test]
    fn parse_hash_probe_recognises_sentinels() {
        assert_eq!(parse_hash_probe("MISSING"), HashProbe::Missing);
        assert_eq!(parse_hash_probe("UNAVAILABLE"), HashProbe::Unavailable);
        assert_eq!(
            parse_hash_probe("deadbeef\n"),
            HashProbe::Hash("deadbeef".into())
        );
    }

    #[test]
    fn classify_reachability_skips_when_nc_absent() {
        assert_eq!(classify_reachability(false, 0), ReachabilityOutcome::Skip);
        assert_eq!(classify_reachability(true, 0), ReachabilityOutcome::Yes);
        assert_eq!(classify_reachability(true, 1), ReachabilityOutcome::No);
    }

    #[test]
    fn upload_file_script_appends_trailing_newline_and_chmods() {
        let script = upload_file_script(b"hello", "/tmp/x", "0600");
        assert!(script.contains("hello\n"));
        assert!(script.contains("chmod 0600 /tmp/x"));
    }
}
