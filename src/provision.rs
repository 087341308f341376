//! Per-session identity provisioning.
//!
//! Provisioning is a strictly ordered sequence, each step depending on the
//! previous one's side effect:
//!
//! 1. ensure the session's service account exists (owned by the session)
//! 2. ensure its role holds exactly the required rules, repairing it if not
//! 3. ensure the role binding points that role at the identity
//! 4. mint a time-boxed token and upsert it into the credential secret
//! 5. merge-patch the identity and secret names onto the session
//!
//! Re-running replaces the stored token in place, so a session never has more
//! than one current credential.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;

use crate::cluster::{
    ClusterApi, OwnerReference, PolicyRule, Role, RoleBinding, ServiceAccount, Subject,
};
use crate::config::{ProvisionConfig, SessionResource};
use crate::error::CredentialError;
use crate::session::{ANNOTATION_CREDENTIAL_SECRET, ANNOTATION_IDENTITY, SessionRef};
use crate::store::{CredentialStore, SecretRef};

/// Key under which the runner credential is stored.
pub const RUNNER_TOKEN_KEY: &str = "k8s-token";

pub fn identity_name(session: &str) -> String {
    format!("ambient-session-{session}")
}

pub fn role_name(session: &str) -> String {
    format!("ambient-session-{session}-role")
}

pub fn binding_name(session: &str) -> String {
    format!("ambient-session-{session}-rb")
}

pub fn credential_secret_name(session: &str) -> String {
    format!("ambient-runner-token-{session}")
}

/// The minimal rule set a session identity holds: read/update its own
/// session status, read/update/patch session objects, and create
/// self-authorization checks.
pub fn required_rules(resource: &SessionResource) -> Vec<PolicyRule> {
    vec![
        PolicyRule::new(
            &resource.group,
            &format!("{}/status", resource.plural),
            &["get", "update", "patch"],
        ),
        PolicyRule::new(
            &resource.group,
            &resource.plural,
            &["get", "list", "watch", "update", "patch"],
        ),
        PolicyRule::new(
            "authorization.k8s.io",
            "selfsubjectaccessreviews",
            &["create"],
        ),
    ]
}

/// Required rules the existing policy does not grant in full.
pub fn missing_rules(existing: &[PolicyRule], required: &[PolicyRule]) -> Vec<PolicyRule> {
    required
        .iter()
        .filter(|rule| {
            !rule.api_groups.iter().all(|group| {
                rule.resources.iter().all(|resource| {
                    rule.verbs
                        .iter()
                        .all(|verb| existing.iter().any(|e| e.allows(group, resource, verb)))
                })
            })
        })
        .cloned()
        .collect()
}

/// Where a provisioned credential lives. The token itself is never returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    pub identity_name: String,
    pub secret: SecretRef,
    pub expires_at: DateTime<Utc>,
}

/// Creates and rotates session identities.
///
/// Holds the platform's own client. Never hand it a request-scoped client.
pub struct IdentityProvisioner {
    cluster: Arc<dyn ClusterApi>,
    store: CredentialStore,
    resource: SessionResource,
    config: ProvisionConfig,
}

impl IdentityProvisioner {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        resource: SessionResource,
        config: ProvisionConfig,
    ) -> Self {
        Self {
            store: CredentialStore::new(Arc::clone(&cluster)),
            cluster,
            resource,
            config,
        }
    }

    /// Provision or rotate the session's identity and credential.
    pub async fn provision(
        &self,
        session_ref: &SessionRef,
    ) -> Result<IssuedCredential, CredentialError> {
        let SessionRef { namespace, name } = session_ref;
        let session = self.cluster.get_session(namespace, name).await?;
        let owner = session.owner_reference();

        let identity = identity_name(name);
        self.ensure_identity(namespace, &identity, &owner).await?;
        self.ensure_role(namespace, name, &owner).await?;
        self.ensure_binding(namespace, name, &identity, &owner).await?;

        let minted = self
            .cluster
            .create_token(namespace, &identity, self.config.token_ttl)
            .await?;
        if minted.token.expose_secret().is_empty() {
            return Err(CredentialError::Internal(format!(
                "cluster returned an empty token for {namespace}/{identity}"
            )));
        }

        let secret = SecretRef::new(namespace.as_str(), credential_secret_name(name));
        self.store
            .upsert(
                &secret,
                RUNNER_TOKEN_KEY,
                minted.token.expose_secret().as_bytes(),
                &owner,
            )
            .await?;

        let annotations = BTreeMap::from([
            (ANNOTATION_IDENTITY.to_string(), identity.clone()),
            (ANNOTATION_CREDENTIAL_SECRET.to_string(), secret.name.clone()),
        ]);
        self.cluster
            .patch_session_annotations(namespace, name, &annotations)
            .await?;

        tracing::info!(
            session = %session_ref,
            identity = %identity,
            expires_at = %minted.expires_at,
            "Session credential issued"
        );
        Ok(IssuedCredential {
            identity_name: identity,
            secret,
            expires_at: minted.expires_at,
        })
    }

    /// [`provision`](Self::provision), logging instead of failing. A session
    /// left without a credential stays Pending and is retried by the next
    /// lifecycle pass.
    pub async fn provision_best_effort(&self, session_ref: &SessionRef) -> Option<IssuedCredential> {
        match self.provision(session_ref).await {
            Ok(issued) => Some(issued),
            Err(e) => {
                tracing::warn!(session = %session_ref, error = %e, "Credential provisioning failed");
                None
            }
        }
    }

    async fn ensure_identity(
        &self,
        namespace: &str,
        identity: &str,
        owner: &OwnerReference,
    ) -> Result<(), CredentialError> {
        let account = ServiceAccount {
            name: identity.to_string(),
            namespace: namespace.to_string(),
            labels: BTreeMap::from([("app".to_string(), "ambient-runner".to_string())]),
            annotations: BTreeMap::new(),
            owner_references: vec![owner.clone()],
        };
        match self.cluster.create_service_account(&account).await {
            Ok(_) => {
                tracing::debug!(namespace, identity, "Created session identity");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_role(
        &self,
        namespace: &str,
        session: &str,
        owner: &OwnerReference,
    ) -> Result<(), CredentialError> {
        let required = required_rules(&self.resource);
        let role = Role {
            name: role_name(session),
            namespace: namespace.to_string(),
            rules: required.clone(),
            owner_references: vec![owner.clone()],
            resource_version: None,
        };
        match self.cluster.create_role(&role).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }

        let existing = self.cluster.get_role(namespace, &role.name).await?;
        if existing.rules == required {
            return Ok(());
        }
        let missing = missing_rules(&existing.rules, &required);
        tracing::info!(
            namespace,
            role = %role.name,
            missing = missing.len(),
            "Repairing session role to the required rule set"
        );
        let repaired = Role {
            resource_version: existing.resource_version,
            owner_references: if existing.owner_references.is_empty() {
                role.owner_references.clone()
            } else {
                existing.owner_references
            },
            ..role
        };
        self.cluster.update_role(&repaired).await?;
        Ok(())
    }

    async fn ensure_binding(
        &self,
        namespace: &str,
        session: &str,
        identity: &str,
        owner: &OwnerReference,
    ) -> Result<(), CredentialError> {
        let subject = Subject {
            kind: "ServiceAccount".to_string(),
            name: identity.to_string(),
            namespace: Some(namespace.to_string()),
        };
        let binding = RoleBinding {
            name: binding_name(session),
            namespace: namespace.to_string(),
            role_name: role_name(session),
            subjects: vec![subject.clone()],
            owner_references: vec![owner.clone()],
            resource_version: None,
        };
        match self.cluster.create_role_binding(&binding).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }

        let existing = self.cluster.get_role_binding(namespace, &binding.name).await?;
        if existing.subjects == binding.subjects {
            return Ok(());
        }
        tracing::info!(namespace, binding = %binding.name, "Repairing session role binding subjects");
        let repaired = RoleBinding {
            resource_version: existing.resource_version,
            role_name: existing.role_name,
            ..binding
        };
        self.cluster.update_role_binding(&repaired).await?;
        Ok(())
    }
}
