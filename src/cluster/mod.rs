//! The cluster API seam.
//!
//! Everything this crate does to the outside world (identities, policies,
//! secrets, token review, compute jobs, the session resource) goes through
//! [`ClusterApi`]. Two implementations ship:
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────────────┐
//! │  HttpCluster         │      │  MemoryCluster               │
//! │  REST over reqwest,  │      │  in-process state, used by   │
//! │  one auth mode each  │      │  tests and local development │
//! └──────────────────────┘      └──────────────────────────────┘
//! ```
//!
//! A [`ClusterConnector`] turns a caller's bearer into a client that
//! authenticates as exactly that bearer and nothing else.

pub mod http;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::session::Session;

/// Back-link from a dependent object to the session that owns it, so the
/// cluster garbage-collects it when the session is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

/// An ephemeral machine identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceAccount {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
}

/// One allow rule of an authorization policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub verbs: Vec<String>,
}

impl PolicyRule {
    pub fn new(group: &str, resource: &str, verbs: &[&str]) -> Self {
        Self {
            api_groups: vec![group.to_string()],
            resources: vec![resource.to_string()],
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Whether this rule grants `verb` on `group/resource`.
    pub fn allows(&self, group: &str, resource: &str, verb: &str) -> bool {
        let matches = |set: &[String], want: &str| set.iter().any(|s| s == want || s == "*");
        matches(&self.api_groups, group)
            && matches(&self.resources, resource)
            && matches(&self.verbs, verb)
    }
}

/// Namespaced authorization policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub namespace: String,
    pub rules: Vec<PolicyRule>,
    pub owner_references: Vec<OwnerReference>,
    pub resource_version: Option<String>,
}

/// Subject of a role binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Binds a role to identities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleBinding {
    pub name: String,
    pub namespace: String,
    pub role_name: String,
    pub subjects: Vec<Subject>,
    pub owner_references: Vec<OwnerReference>,
    pub resource_version: Option<String>,
}

/// Namespace-scoped key/value secret material.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretObject {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
    pub owner_references: Vec<OwnerReference>,
    pub resource_version: Option<String>,
}

impl std::fmt::Debug for SecretObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretObject")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("labels", &self.labels)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("owner_references", &self.owner_references)
            .field("resource_version", &self.resource_version)
            .finish()
    }
}

/// A freshly minted, time-boxed bearer for an identity.
#[derive(Debug)]
pub struct MintedToken {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

/// Result of submitting a bearer to the introspection authority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenReview {
    pub authenticated: bool,
    pub username: Option<String>,
    pub error: Option<String>,
}

/// `({group, resource, verb, namespace})` question for the authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCheck {
    pub group: String,
    pub resource: String,
    pub verb: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
}

/// How dependents of a deleted job are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Delete dependents before the owner disappears.
    Foreground,
    /// Return immediately and let the collector remove dependents.
    Background,
}

impl Propagation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foreground => "Foreground",
            Self::Background => "Background",
        }
    }
}

/// Operations against the cluster API.
///
/// Each implementation authenticates as one identity for its whole lifetime.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_session(&self, namespace: &str, name: &str) -> Result<Session, ClusterError>;

    /// Merge-patch annotations onto a session. Does not require a resource version.
    async fn patch_session_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Session, ClusterError>;

    /// Replace the session's metadata and spec. Fails with `Conflict` if the
    /// resource version is stale.
    async fn update_session(&self, session: &Session) -> Result<Session, ClusterError>;

    /// Replace the session's status subresource.
    async fn update_session_status(&self, session: &Session) -> Result<Session, ClusterError>;

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, ClusterError>;

    async fn create_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, ClusterError>;

    async fn patch_service_account_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError>;

    /// Mint a bearer for a service account valid for `ttl`.
    async fn create_token(
        &self,
        namespace: &str,
        account: &str,
        ttl: Duration,
    ) -> Result<MintedToken, ClusterError>;

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Role, ClusterError>;

    async fn create_role(&self, role: &Role) -> Result<Role, ClusterError>;

    async fn update_role(&self, role: &Role) -> Result<Role, ClusterError>;

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<RoleBinding, ClusterError>;

    async fn create_role_binding(&self, binding: &RoleBinding)
    -> Result<RoleBinding, ClusterError>;

    async fn update_role_binding(&self, binding: &RoleBinding)
    -> Result<RoleBinding, ClusterError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretObject, ClusterError>;

    async fn create_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError>;

    /// Replace a secret. Fails with `Conflict` if the resource version is stale.
    async fn update_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError>;

    /// Introspect a bearer token.
    async fn review_token(&self, token: &str) -> Result<TokenReview, ClusterError>;

    /// Ask whether the client's own identity may perform `check`.
    async fn check_access(&self, check: &AccessCheck) -> Result<AccessDecision, ClusterError>;

    async fn delete_job(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), ClusterError>;

    /// Delete every pod matching `label_selector` (`key=value`).
    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> Result<(), ClusterError>;
}

/// Builds clients bound to a caller-supplied bearer.
pub trait ClusterConnector: Send + Sync {
    /// Client that authenticates with exactly `token`. Implementations must
    /// not carry any other credential source into the returned client.
    fn with_bearer(&self, token: &str) -> Result<Arc<dyn ClusterApi>, ClusterError>;
}
