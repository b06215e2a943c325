//! Install log sink. Per-host append-only file, one line per
//! step. Tail reads skip empty lines and apply the redactor.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use xray_cp_common::{redact::redact, HostId};

pub struct InstallLogSink {
    dir: PathBuf,
}

impl InstallLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, host_id: &HostId) -> PathBuf {
        self.dir.join(format!("{}.log", host_id.as_str()))
    }

    /// Append one `<ISO8601> <message>\n` line.
    pub async fn append(&self, host_id: &HostId, message: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(host_id))
            .await?;
        let line = format!("{} {}\n", Utc::now().to_rfc3339(), message);
        file.write_all(line.as_bytes()).await
    }

    /// Tail of the last `n` lines (clamped 1-1000), redacted, skipping empty
    /// lines.
    pub async fn tail(&self, host_id: &HostId, n: usize) -> std::io::Result<Vec<String>> {
        let n = n.clamp(1, 1000);
        let path = self.path_for(host_id);
        if !Path::new(&path).exists() {
            return Ok(Vec::new());
        }

        let file = tokio::fs::File::open(&path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut all = Vec::new();
        while let Some(line) = reader.next_line().await? {
            if !line.trim().is_empty() {
                all.push(redact(&line));
            }
        }

        let start = all.len().saturating_sub(n);
        Ok(all.split_off(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_tail_returns_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = InstallLogSink::new(dir.path());
        let host = HostId::new("h1");
        sink.append(&host, "Detect OS").await.unwrap();
        sink.append(&host, "Install Docker and Compose plugin")
            .await
            .unwrap();

        let lines = sink.tail(&host, 200).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Detect OS"));
        assert!(lines[1].ends_with("Install Docker and Compose plugin"));
    }

    #[tokio::test]
    async fn tail_respects_n_and_clamps_to_1000() {
        let dir = tempfile::tempdir().unwrap();
        let sink = InstallLogSink::new(dir.path());
        let host = HostId::new("h1");
        for i in 0..10 {
            sink.append(&host, &format!("step {i}")).await.unwrap();
        }
        let lines = sink.tail(&host, 3).await.unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].ends_with("step 9"));
    }

    #[tokio::test]
    async fn tail_redacts_secret_material() {
        let dir = tempfile::tempdir().unwrap();
        let sink = InstallLogSink::new(dir.path());
        let host = HostId::new("h1");
        sink.append(&host, "Private key: abc123").await.unwrap();
        let lines = sink.tail(&host, 10).await.unwrap();
        assert!(!lines[0].contains("abc123"));
        assert!(lines[0].contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn tail_on_missing_host_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = InstallLogSink::new(dir.path());
        let lines = sink.tail(&HostId::new("nope"), 10).await.unwrap();
        assert!(lines.is_empty());
    }
}
