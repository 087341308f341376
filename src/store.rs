//! Credential persistence in namespace-scoped secrets.
//!
//! Concurrent writers (two OAuth callbacks for the same session, a restart
//! racing a provision) are expected, so every write is a read-merge-update
//! guarded by the secret's resource version and retried on conflict.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterApi, OwnerReference, SecretObject};
use crate::error::{ClusterError, CredentialError};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Key holding the serialized OAuth credential document.
pub const OAUTH_CREDENTIALS_KEY: &str = "credentials.json";
pub const OAUTH_ACCESS_TOKEN_KEY: &str = "access_token";
pub const OAUTH_REFRESH_TOKEN_KEY: &str = "refresh_token";

/// `expiry` is read by a consumer that expects a naive UTC timestamp.
pub const EXPIRY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// `(namespace, name)` of a secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl SecretRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A credential value read back from the store.
pub struct CredentialValue {
    value: SecretString,
}

impl CredentialValue {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CredentialError> {
        let s = String::from_utf8(bytes)
            .map_err(|_| CredentialError::Internal("stored credential is not UTF-8".into()))?;
        Ok(Self {
            value: SecretString::from(s),
        })
    }

    /// Plaintext. Never log or echo the result.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.value.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CredentialValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialValue([REDACTED, {} bytes])", self.len())
    }
}

/// OAuth credential document written under [`OAUTH_CREDENTIALS_KEY`].
///
/// Field names and the `expiry` format are consumed verbatim downstream.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredOAuthCredential {
    pub token: String,
    pub refresh_token: String,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub expiry: String,
}

impl StoredOAuthCredential {
    pub fn format_expiry(at: DateTime<Utc>) -> String {
        at.format(EXPIRY_FORMAT).to_string()
    }
}

impl fmt::Debug for StoredOAuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredOAuthCredential")
            .field("token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("token_uri", &self.token_uri)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("scopes", &self.scopes)
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Reads and writes credentials.
pub struct CredentialStore {
    cluster: Arc<dyn ClusterApi>,
    policy: RetryPolicy,
}

impl CredentialStore {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            policy: RetryPolicy::new(3, Duration::from_millis(50), Duration::from_millis(500)),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Write one key, creating the secret (owned by `owner`) if needed.
    pub async fn upsert(
        &self,
        secret: &SecretRef,
        key: &str,
        value: &[u8],
        owner: &OwnerReference,
    ) -> Result<(), CredentialError> {
        let entries = BTreeMap::from([(key.to_string(), value.to_vec())]);
        self.upsert_many(secret, owner, &BTreeMap::new(), &entries).await
    }

    /// Merge `entries` and `labels` into the secret in one write.
    pub async fn upsert_many(
        &self,
        secret: &SecretRef,
        owner: &OwnerReference,
        labels: &BTreeMap<String, String>,
        entries: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), CredentialError> {
        let result = retry_with_backoff(
            &self.policy,
            std::future::pending::<()>(),
            |e: &ClusterError| e.is_conflict() || e.is_already_exists(),
            |_| self.try_upsert(secret, owner, labels, entries),
        )
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(secret = %secret, keys = entries.len(), "Credential stored");
                Ok(())
            }
            Err(e) => {
                let e = e.into_inner(|attempts| ClusterError::Conflict {
                    kind: "Secret",
                    name: format!("{secret} (cancelled after {attempts} attempts)"),
                });
                tracing::warn!(secret = %secret, error = %e, "Failed to store credential");
                Err(e.into())
            }
        }
    }

    async fn try_upsert(
        &self,
        secret: &SecretRef,
        owner: &OwnerReference,
        labels: &BTreeMap<String, String>,
        entries: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), ClusterError> {
        match self.cluster.get_secret(&secret.namespace, &secret.name).await {
            Ok(mut existing) => {
                existing.data.extend(entries.clone());
                existing.labels.extend(labels.clone());
                if existing.owner_references.is_empty() {
                    existing.owner_references.push(owner.clone());
                }
                self.cluster.update_secret(&existing).await.map(|_| ())
            }
            Err(e) if e.is_not_found() => {
                let fresh = SecretObject {
                    name: secret.name.clone(),
                    namespace: secret.namespace.clone(),
                    labels: labels.clone(),
                    data: entries.clone(),
                    owner_references: vec![owner.clone()],
                    resource_version: None,
                };
                self.cluster.create_secret(&fresh).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Value stored under `key`. `NotFound` if the secret or key is absent.
    pub async fn read(
        &self,
        secret: &SecretRef,
        key: &str,
    ) -> Result<CredentialValue, CredentialError> {
        let object = self
            .cluster
            .get_secret(&secret.namespace, &secret.name)
            .await?;
        let bytes = object
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(format!("key {key} in secret {secret}")))?;
        CredentialValue::from_bytes(bytes)
    }

    /// Write an OAuth credential under the fixed key layout. Every key is
    /// rewritten, so an empty refresh token clears the one from an earlier
    /// grant.
    pub async fn write_oauth(
        &self,
        secret: &SecretRef,
        owner: &OwnerReference,
        labels: &BTreeMap<String, String>,
        credential: &StoredOAuthCredential,
    ) -> Result<(), CredentialError> {
        let document = serde_json::to_vec_pretty(credential)
            .map_err(|e| CredentialError::Internal(format!("encode credential: {e}")))?;

        let entries = BTreeMap::from([
            (OAUTH_CREDENTIALS_KEY.to_string(), document),
            (
                OAUTH_ACCESS_TOKEN_KEY.to_string(),
                credential.token.as_bytes().to_vec(),
            ),
            (
                OAUTH_REFRESH_TOKEN_KEY.to_string(),
                credential.refresh_token.as_bytes().to_vec(),
            ),
        ]);
        self.upsert_many(secret, owner, labels, &entries).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::cluster::memory::MemoryCluster;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "vteam.ambient-code/v1alpha1".into(),
            kind: "AgenticSession".into(),
            name: "s1".into(),
            uid: "uid-1".into(),
            controller: Some(true),
        }
    }

    fn store(cluster: &MemoryCluster) -> CredentialStore {
        CredentialStore::new(Arc::new(cluster.clone())).with_policy(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(2),
        ))
    }

    #[tokio::test]
    async fn test_upsert_creates_with_owner_then_merges() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster);
        let secret = SecretRef::new("proj-a", "creds");

        store.upsert(&secret, "a", b"1", &owner()).await.unwrap();
        store.upsert(&secret, "b", b"2", &owner()).await.unwrap();
        store.upsert(&secret, "a", b"3", &owner()).await.unwrap();

        let stored = cluster.secret("proj-a", "creds").unwrap();
        assert_eq!(stored.owner_references, vec![owner()]);
        assert_eq!(stored.data["a"], b"3");
        assert_eq!(stored.data["b"], b"2");
        assert_eq!(store.read(&secret, "a").await.unwrap().expose(), "3");
    }

    #[tokio::test]
    async fn test_upsert_retries_on_conflict() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster);
        let secret = SecretRef::new("proj-a", "creds");
        store.upsert(&secret, "a", b"1", &owner()).await.unwrap();

        cluster.fail_next(
            "update_secret",
            ClusterError::Conflict {
                kind: "Secret",
                name: "creds".into(),
            },
        );
        store.upsert(&secret, "a", b"2", &owner()).await.unwrap();
        assert_eq!(cluster.calls_to("update_secret").len(), 2);
        assert_eq!(cluster.secret("proj-a", "creds").unwrap().data["a"], b"2");
    }

    #[tokio::test]
    async fn test_upsert_gives_up_after_bounded_conflicts() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster);
        let secret = SecretRef::new("proj-a", "creds");
        store.upsert(&secret, "a", b"1", &owner()).await.unwrap();
        for _ in 0..3 {
            cluster.fail_next(
                "update_secret",
                ClusterError::Conflict {
                    kind: "Secret",
                    name: "creds".into(),
                },
            );
        }
        let err = store.upsert(&secret, "a", b"2", &owner()).await.unwrap_err();
        assert!(matches!(err, CredentialError::Conflict(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_create_race_falls_back_to_update() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster);
        cluster.fail_next(
            "create_secret",
            ClusterError::AlreadyExists {
                kind: "Secret",
                name: "creds".into(),
            },
        );
        store
            .upsert(&SecretRef::new("proj-a", "creds"), "a", b"1", &owner())
            .await
            .unwrap();
        assert_eq!(cluster.calls_to("create_secret").len(), 2);
    }

    #[tokio::test]
    async fn test_read_missing_key_is_not_found() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster);
        let secret = SecretRef::new("proj-a", "creds");
        assert!(matches!(
            store.read(&secret, "a").await,
            Err(CredentialError::NotFound(_))
        ));
        store.upsert(&secret, "a", b"1", &owner()).await.unwrap();
        assert!(matches!(
            store.read(&secret, "b").await,
            Err(CredentialError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_oauth_layout() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster);
        let credential = StoredOAuthCredential {
            token: "ya29.access".into(),
            refresh_token: "1//refresh".into(),
            token_uri: "https://oauth2.googleapis.com/token".into(),
            client_id: "cid".into(),
            client_secret: "csecret".into(),
            scopes: vec!["openid".into()],
            expiry: StoredOAuthCredential::format_expiry(
                Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap(),
            ),
        };
        store
            .write_oauth(
                &SecretRef::new("proj-a", "s1-google-oauth"),
                &owner(),
                &BTreeMap::new(),
                &credential,
            )
            .await
            .unwrap();

        let stored = cluster.secret("proj-a", "s1-google-oauth").unwrap();
        let doc: serde_json::Value =
            serde_json::from_slice(&stored.data[OAUTH_CREDENTIALS_KEY]).unwrap();
        assert_eq!(doc["expiry"], "2026-03-04T05:06:07");
        assert_eq!(doc["token"], "ya29.access");
        assert_eq!(doc["scopes"][0], "openid");
        assert_eq!(stored.data[OAUTH_ACCESS_TOKEN_KEY], b"ya29.access");
        assert_eq!(stored.data[OAUTH_REFRESH_TOKEN_KEY], b"1//refresh");
        assert!(!format!("{credential:?}").contains("csecret"));
    }
}
