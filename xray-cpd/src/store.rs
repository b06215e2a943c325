//! In-memory stand-in for the relational store. Swappable: a real
//! deployment drops in a Postgres/SQLite implementation behind the same
//! shape without touching the rest of the control plane.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use xray_cp_common::{
    AppError, ErrorKind, Host, HostId, HostStatus, Secret, SecretId, User, XrayInstance,
};

#[derive(Default)]
pub struct Store {
    hosts: RwLock<HashMap<HostId, Host>>,
    secrets: RwLock<HashMap<SecretId, Secret>>,
    /// Exactly one XRAY instance per host: "latest wins" is structural,
    /// enforced by the map key, not a query-time tiebreak.
    instances: RwLock<HashMap<HostId, XrayInstance>>,
    users: RwLock<HashMap<HostId, Vec<User>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_host(&self, host: Host) {
        self.hosts.write().await.insert(host.id.clone(), host);
    }

    pub async fn get_host(&self, id: &HostId) -> Result<Host, AppError> {
        self.hosts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::new(ErrorKind::ServerNotFound))
    }

    pub async fn update_host_status(
        &self,
        id: &HostId,
        status: HostStatus,
        last_error: Option<String>,
    ) -> Result<(), AppError> {
        let mut hosts = self.hosts.write().await;
        let host = hosts
            .get_mut(id)
            .ok_or_else(|| AppError::new(ErrorKind::ServerNotFound))?;
        host.status = status;
        host.last_error = last_error;
        host.updated_at = Utc::now();
        Ok(())
    }

    pub async fn put_secret(&self, secret: Secret) {
        self.secrets
            .write()
            .await
            .insert(secret.id.clone(), secret);
    }

    pub async fn get_secret(&self, id: &SecretId) -> Result<Secret, AppError> {
        self.secrets
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::new(ErrorKind::SecretNotFound))
    }

    pub async fn get_instance(&self, host_id: &HostId) -> Option<XrayInstance> {
        self.instances.read().await.get(host_id).cloned()
    }

    /// Upsert latest-by-host.
    pub async fn upsert_instance(&self, instance: XrayInstance) {
        self.instances
            .write()
            .await
            .insert(instance.host_id.clone(), instance);
    }

    pub async fn put_users(&self, host_id: HostId, users: Vec<User>) {
        self.users.write().await.insert(host_id, users);
    }

    /// Enabled users, in storage order. Callers sort when determinism
    /// matters.
    pub async fn enabled_users(&self, host_id: &HostId) -> Vec<User> {
        self.users
            .read()
            .await
            .get(host_id)
            .map(|users| users.iter().filter(|u| u.enabled).cloned().collect())
            .unwrap_or_default()
    }

    /// Capture every row for on-disk persistence (the CLI's file-backed
    /// state; the daemon itself runs purely in-memory for a process
    /// lifetime).
    pub async fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            hosts: self.hosts.read().await.values().cloned().collect(),
            secrets: self.secrets.read().await.values().cloned().collect(),
            instances: self.instances.read().await.values().cloned().collect(),
            users: self
                .users
                .read()
                .await
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Merge a previously captured snapshot back in. Existing rows with the
    /// same key are overwritten.
    pub async fn restore(&self, snapshot: StoreSnapshot) {
        let mut hosts = self.hosts.write().await;
        for host in snapshot.hosts {
            hosts.insert(host.id.clone(), host);
        }
        drop(hosts);

        let mut secrets = self.secrets.write().await;
        for secret in snapshot.secrets {
            secrets.insert(secret.id.clone(), secret);
        }
        drop(secrets);

        let mut instances = self.instances.write().await;
        for instance in snapshot.instances {
            instances.insert(instance.host_id.clone(), instance);
        }
        drop(instances);

        let mut users = self.users.write().await;
        for (host_id, host_users) in snapshot.users {
            users.insert(host_id, host_users);
        }
    }
}

/// Serializable snapshot of every row `Store` holds, used by the CLI to
/// persist host/secret/instance/user state between invocations.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StoreSnapshot {
    pub hosts: Vec<Host>,
    pub secrets: Vec<Secret>,
    pub instances: Vec<XrayInstance>,
    pub users: Vec<(HostId, Vec<User>)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use xray_cp_common::SecretKind;

    fn sample_host() -> Host {
        Host::new(
            HostId::new("h1"),
            "10.0.0.1".into(),
            "root".into(),
            SecretId::new("s1"),
        )
    }

    #[tokio::test]
    async fn get_host_fails_with_server_not_found_when_absent() {
        let store = Store::new();
        let err = store.get_host(&HostId::new("missing")).await.unwrap_err();
        assert_eq!(err.kind.tag(), "SERVER_NOT_FOUND");
    }

    #[tokio::test]
    async fn update_host_status_persists_last_error() {
        let store = Store::new();
        store.put_host(sample_host()).await;
        store
            .update_host_status(&HostId::new("h1"), HostStatus::Error, Some("boom".into()))
            .await
            .unwrap();
        let host = store.get_host(&HostId::new("h1")).await.unwrap();
        assert_eq!(host.status, HostStatus::Error);
        assert_eq!(host.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn upsert_instance_keeps_exactly_one_per_host() {
        let store = Store::new();
        let host_id = HostId::new("h1");
        let first = XrayInstance {
            id: "i1".into(),
            host_id: host_id.clone(),
            listen_port: 443,
            reality_private_key: "a".into(),
            reality_public_key: "b".into(),
            server_name: "x".into(),
            dest: "x:443".into(),
            fingerprint: "chrome".into(),
            short_ids: vec!["deadbeef".into()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut second = first.clone();
        second.id = "i2".into();
        store.upsert_instance(first).await;
        store.upsert_instance(second).await;
        let current = store.get_instance(&host_id).await.unwrap();
        assert_eq!(current.id, "i2");
    }

    #[tokio::test]
    async fn enabled_users_filters_out_disabled() {
        let store = Store::new();
        let host_id = HostId::new("h1");
        store
            .put_users(
                host_id.clone(),
                vec![
                    User {
                        server_id: host_id.clone(),
                        uuid: "a".into(),
                        enabled: true,
                    },
                    User {
                        server_id: host_id.clone(),
                        uuid: "b".into(),
                        enabled: false,
                    },
                ],
            )
            .await;
        let enabled = store.enabled_users(&host_id).await;
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].uuid, "a");
    }

    #[tokio::test]
    async fn secret_lookup_fails_with_secret_not_found_when_absent() {
        let store = Store::new();
        let err = store.get_secret(&SecretId::new("missing")).await.unwrap_err();
        assert_eq!(err.kind.tag(), "SECRET_NOT_FOUND");
    }

    #[tokio::test]
    async fn secret_roundtrips_through_store() {
        let store = Store::new();
        let key = [1u8; 32];
        let secret = Secret::seal(SecretId::new("s1"), SecretKind::Password, b"pw", &key);
        store.put_secret(secret).await;
        let fetched = store.get_secret(&SecretId::new("s1")).await.unwrap();
        assert_eq!(fetched.reveal(&key), b"pw");
    }

    #[tokio::test]
    async fn snapshot_then_restore_into_a_fresh_store_preserves_every_row() {
        let store = Store::new();
        store.put_host(sample_host()).await;
        store
            .put_secret(Secret::seal(
                SecretId::new("s1"),
                SecretKind::Password,
                b"pw",
                &[0u8; 32],
            ))
            .await;
        let host_id = HostId::new("h1");
        store
            .put_users(
                host_id.clone(),
                vec![User {
                    server_id: host_id.clone(),
                    uuid: "e7f8e06d-2942-4cb9-bca5-6d511244f6d7".into(),
                    enabled: true,
                }],
            )
            .await;

        let snapshot = store.snapshot().await;
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: StoreSnapshot = serde_json::from_str(&json).unwrap();

        let fresh = Store::new();
        fresh.restore(restored).await;

        assert!(fresh.get_host(&host_id).await.is_ok());
        assert!(fresh.get_secret(&SecretId::new("s1")).await.is_ok());
        assert_eq!(fresh.enabled_users(&host_id).await.len(), 1);
    }
}
