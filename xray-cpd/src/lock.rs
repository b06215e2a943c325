//! Per-host lock: distributed mutual exclusion keyed by host id, modelled
//! here as an in-process `RwLock<HashMap>` standing in for a Redis-backed
//! `lock:server:<hostId>` key in a real deployment.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use xray_cp_common::{AppError, ErrorKind, HostId};

struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// `lock:server:<hostId>` held as a per-job token with a TTL (default 15
/// min). Acquired with set-if-absent semantics; released by
/// token-compare-and-delete so a stale worker cannot evict a fresh lock.
pub struct LockStore {
    locks: RwLock<HashMap<HostId, LockEntry>>,
}

impl LockStore {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire with set-if-absent semantics. A held-but-expired entry is
    /// treated as absent; the TTL is checked lazily on next acquire rather
    /// than via a background sweep or renewal mechanism.
    pub async fn acquire(
        &self,
        host_id: &HostId,
        token: &str,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let mut locks = self.locks.write().await;
        if let Some(entry) = locks.get(host_id) {
            if entry.expires_at > Instant::now() {
                return Err(AppError::new(ErrorKind::ServerBusy));
            }
        }
        locks.insert(
            host_id.clone(),
            LockEntry {
                token: token.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    /// Token-compare-and-delete. Returns `false` (no-op) if the held token
    /// does not match, so a stale worker cannot evict a fresh lock.
    pub async fn release(&self, host_id: &HostId, token: &str) -> bool {
        let mut locks = self.locks.write().await;
        match locks.get(host_id) {
            Some(entry) if entry.token == token => {
                locks.remove(host_id);
                true
            }
            _ => false,
        }
    }

    pub async fn is_locked(&self, host_id: &HostId) -> bool {
        let locks = self.locks.read().await;
        locks
            .get(host_id)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }
}

impl Default for LockStore {
    fn default() -> Self {
        Self::new()
    }
}
