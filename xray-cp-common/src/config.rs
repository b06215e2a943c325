//! Typed configuration surface.
//!
//! Loaded from `XRAY_CP_*` environment variables. Loading never fails
//! outright for a bad-but-parseable value; it collects [`ConfigWarning`]s
//! instead, mirroring the env/validate split this codebase uses elsewhere.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_backoff() -> Vec<Duration> {
    vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
    ]
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_cancel_flag_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_completed_retention() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_failed_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_retention_records() -> usize {
    500
}

fn default_install_log_dir() -> PathBuf {
    PathBuf::from("var/install-logs")
}

fn default_tail_lines() -> usize {
    200
}

fn default_max_tail_lines() -> usize {
    1000
}

/// Which `ClientStore` implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    File,
    Grpc,
}

/// Severity of a [`ConfigWarning`], following the category/severity shape
/// used by this codebase's other validated-config surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub field: &'static str,
    pub severity: Severity,
    pub message: String,
}

/// Process-wide configuration for the control plane daemon and CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub master_key: [u8; 32],
    pub dry_run: bool,
    pub install_log_dir: PathBuf,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub retry_backoff: Vec<Duration>,
    pub lock_ttl: Duration,
    pub cancel_flag_ttl: Duration,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
    pub retention_records: usize,
    pub default_tail_lines: usize,
    pub max_tail_lines: usize,
    pub store_mode: StoreMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master_key: [0u8; 32],
            dry_run: false,
            install_log_dir: default_install_log_dir(),
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            retry_backoff: default_retry_backoff(),
            lock_ttl: default_lock_ttl(),
            cancel_flag_ttl: default_cancel_flag_ttl(),
            completed_retention: default_completed_retention(),
            failed_retention: default_failed_retention(),
            retention_records: default_retention_records(),
            default_tail_lines: default_tail_lines(),
            max_tail_lines: default_max_tail_lines(),
            store_mode: StoreMode::File,
        }
    }
}

impl Config {
    /// Load from the process environment, collecting non-fatal warnings for
    /// questionable (but parseable) values.
    pub fn from_env() -> (Self, Vec<ConfigWarning>) {
        let mut cfg = Self::default();
        let mut warnings = Vec::new();

        if let Ok(raw) = env::var("XRAY_CP_MASTER_KEY") {
            match base64_decode_32(&raw) {
                Some(key) => cfg.master_key = key,
                None => warnings.push(ConfigWarning {
                    field: "XRAY_CP_MASTER_KEY",
                    severity: Severity::Warning,
                    message: "expected 32 bytes of base64; using zero key".into(),
                }),
            }
        }

        if let Ok(raw) = env::var("XRAY_CP_DRY_RUN") {
            cfg.dry_run = matches!(raw.as_str(), "1" | "true" | "TRUE" | "yes");
        }

        if let Ok(raw) = env::var("XRAY_CP_INSTALL_LOG_DIR") {
            cfg.install_log_dir = PathBuf::from(raw);
        }

        if let Ok(raw) = env::var("XRAY_CP_CONNECT_TIMEOUT") {
            match humantime::parse_duration(&raw) {
                Ok(d) => cfg.connect_timeout = d,
                Err(_) => warnings.push(bad_duration_warning("XRAY_CP_CONNECT_TIMEOUT")),
            }
        }

        if let Ok(raw) = env::var("XRAY_CP_COMMAND_TIMEOUT") {
            match humantime::parse_duration(&raw) {
                Ok(d) => {
                    if d < Duration::from_secs(1) {
                        warnings.push(ConfigWarning {
                            field: "XRAY_CP_COMMAND_TIMEOUT",
                            severity: Severity::Warning,
                            message: "command timeout below 1s is unlikely to be intentional"
                                .into(),
                        });
                    }
                    cfg.command_timeout = d;
                }
                Err(_) => warnings.push(bad_duration_warning("XRAY_CP_COMMAND_TIMEOUT")),
            }
        }

        if let Ok(raw) = env::var("XRAY_CP_STORE_MODE") {
            cfg.store_mode = match raw.as_str() {
                "grpc" => StoreMode::Grpc,
                "file" => StoreMode::File,
                _ => {
                    warnings.push(ConfigWarning {
                        field: "XRAY_CP_STORE_MODE",
                        severity: Severity::Warning,
                        message: format!("unknown store mode {raw:?}; defaulting to file"),
                    });
                    StoreMode::File
                }
            };
        }

        (cfg, warnings)
    }
}

fn bad_duration_warning(field: &'static str) -> ConfigWarning {
    ConfigWarning {
        field,
        severity: Severity::Warning,
        message: "could not parse duration; keeping default".into(),
    }
}

fn base64_decode_32(raw: &str) -> Option<[u8; 32]> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD.decode(raw.trim()).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    #[test]
    fn defaults_are_reasonable() {
        let cfg = Config::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.command_timeout, Duration::from_secs(60));
        assert_eq!(
            cfg.retry_backoff,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(cfg.lock_ttl, Duration::from_secs(900));
        assert_eq!(cfg.default_tail_lines, 200);
        assert_eq!(cfg.max_tail_lines, 1000);
    }

    #[test]
    fn bad_command_timeout_warns_but_does_not_fail() {
        let _guard = env_test_lock();
        unsafe {
            env::set_var("XRAY_CP_COMMAND_TIMEOUT", "not-a-duration");
        }
        let (cfg, warnings) = Config::from_env();
        unsafe {
            env::remove_var("XRAY_CP_COMMAND_TIMEOUT");
        }
        assert_eq!(cfg.command_timeout, Duration::from_secs(60));
        assert!(warnings.iter().any(|w| w.field == "XRAY_CP_COMMAND_TIMEOUT"));
    }

    #[test]
    fn low_command_timeout_is_accepted_with_a_warning() {
        let _guard = env_test_lock();
        unsafe {
            env::set_var("XRAY_CP_COMMAND_TIMEOUT", "500ms");
        }
        let (cfg, warnings) = Config::from_env();
        unsafe {
            env::remove_var("XRAY_CP_COMMAND_TIMEOUT");
        }
        assert_eq!(cfg.command_timeout, Duration::from_millis(500));
        assert!(warnings.iter().any(|w| w.severity == Severity::Warning));
    }
}
