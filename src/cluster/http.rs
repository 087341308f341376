//! Cluster API client over HTTPS.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cluster::{
    AccessCheck, AccessDecision, ClusterApi, ClusterConnector, MintedToken, OwnerReference,
    PolicyRule, Propagation, Role, RoleBinding, SecretObject, ServiceAccount, Subject,
    TokenReview,
};
use crate::config::{ClusterConfig, SessionResource};
use crate::error::ClusterError;
use crate::session::Session;

const RBAC_API: &str = "/apis/rbac.authorization.k8s.io/v1";
const MERGE_PATCH: &str = "application/merge-patch+json";

/// How a client authenticates to the API server.
#[derive(Clone)]
pub enum AuthMode {
    /// A fixed bearer token. The only mode a request-scoped client may carry.
    Bearer(SecretString),
    /// Bearer read from a file on every request, so rotated tokens are picked up.
    TokenFile(PathBuf),
    /// Token issued by a named auth provider and cached in the client.
    AuthProvider { name: String, token: SecretString },
    /// External command printing an `ExecCredential` document on stdout.
    ExecHelper { command: String, args: Vec<String> },
    Basic {
        username: String,
        password: SecretString,
    },
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => f.write_str("Bearer([REDACTED])"),
            Self::TokenFile(path) => f.debug_tuple("TokenFile").field(path).finish(),
            Self::AuthProvider { name, .. } => f
                .debug_struct("AuthProvider")
                .field("name", name)
                .field("token", &"[REDACTED]")
                .finish(),
            Self::ExecHelper { command, .. } => f
                .debug_struct("ExecHelper")
                .field("command", command)
                .finish_non_exhaustive(),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

impl AuthMode {
    pub fn is_bearer(&self) -> bool {
        matches!(self, Self::Bearer(_))
    }
}

#[derive(Deserialize)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

#[derive(Deserialize)]
struct ExecCredentialStatus {
    token: String,
}

/// [`ClusterApi`] backed by the cluster's REST API.
#[derive(Clone, Debug)]
pub struct HttpCluster {
    client: Client,
    base_url: String,
    auth: AuthMode,
    timeout: Duration,
    resource: SessionResource,
}

impl HttpCluster {
    /// Client for the platform's own identity, authenticated from the
    /// configured token file.
    pub fn from_config(config: &ClusterConfig) -> Result<Self, ClusterError> {
        let mut builder = Client::builder().timeout(config.timeout);
        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(ca_file).map_err(|e| {
                ClusterError::Transport(format!("failed to read {}: {e}", ca_file.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ClusterError::Transport(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| ClusterError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self::new(
            client,
            &config.api_url,
            AuthMode::TokenFile(config.token_file.clone()),
            config.timeout,
            config.session_resource.clone(),
        ))
    }

    pub fn new(
        client: Client,
        base_url: &str,
        auth: AuthMode,
        timeout: Duration,
        resource: SessionResource,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            timeout,
            resource,
        }
    }

    pub fn auth_mode(&self) -> &AuthMode {
        &self.auth
    }

    /// Copy of this client that authenticates with `token` only. Every
    /// ambient mechanism (token file, provider, exec helper, basic auth) is
    /// dropped with the old `AuthMode`.
    pub fn scoped_to(&self, token: &str) -> Self {
        Self {
            auth: AuthMode::Bearer(SecretString::from(token.to_string())),
            ..self.clone()
        }
    }

    fn session_path(&self, namespace: &str, name: &str) -> String {
        format!(
            "/apis/{}/{}/namespaces/{namespace}/{}/{name}",
            self.resource.group, self.resource.version, self.resource.plural
        )
    }

    async fn bearer(&self) -> Result<Option<String>, ClusterError> {
        match &self.auth {
            AuthMode::Bearer(token) | AuthMode::AuthProvider { token, .. } => {
                Ok(Some(token.expose_secret().to_string()))
            }
            AuthMode::TokenFile(path) => tokio::fs::read_to_string(path)
                .await
                .map(|t| Some(t.trim().to_string()))
                .map_err(|e| {
                    ClusterError::Transport(format!("failed to read {}: {e}", path.display()))
                }),
            AuthMode::ExecHelper { command, args } => {
                let output = tokio::time::timeout(
                    self.timeout,
                    tokio::process::Command::new(command).args(args).output(),
                )
                .await
                .map_err(|_| ClusterError::Timeout {
                    operation: "exec credential helper",
                    after: self.timeout,
                })?
                .map_err(|e| ClusterError::Transport(format!("exec helper failed: {e}")))?;
                if !output.status.success() {
                    return Err(ClusterError::Transport(format!(
                        "exec helper exited with {}",
                        output.status
                    )));
                }
                let cred: ExecCredential = serde_json::from_slice(&output.stdout)
                    .map_err(|e| ClusterError::Transport(format!("bad exec credential: {e}")))?;
                Ok(Some(cred.status.token))
            }
            AuthMode::Basic { .. } => Ok(None),
        }
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ClusterError> {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .timeout(self.timeout)
            .header("Accept", "application/json");
        Ok(match (&self.auth, self.bearer().await?) {
            (_, Some(token)) => builder.bearer_auth(token),
            (AuthMode::Basic { username, password }, None) => {
                builder.basic_auth(username, Some(password.expose_secret()))
            }
            (_, None) => builder,
        })
    }

    async fn send(
        &self,
        operation: &'static str,
        kind: &'static str,
        name: &str,
        builder: RequestBuilder,
    ) -> Result<Response, ClusterError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ClusterError::Timeout {
                    operation,
                    after: self.timeout,
                }
            } else {
                ClusterError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body, kind, name))
    }

    async fn json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        kind: &'static str,
        name: &str,
        builder: RequestBuilder,
    ) -> Result<T, ClusterError> {
        let response = self.send(operation, kind, name, builder).await?;
        response
            .json()
            .await
            .map_err(|e| ClusterError::Transport(format!("{operation}: invalid response: {e}")))
    }
}

#[derive(Deserialize)]
struct StatusBody {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// Map an error response onto [`ClusterError`].
fn status_error(status: StatusCode, body: &str, kind: &'static str, name: &str) -> ClusterError {
    let parsed: Option<StatusBody> = serde_json::from_str(body).ok();
    let (reason, message) = parsed
        .map(|b| (b.reason, b.message))
        .unwrap_or_else(|| (String::new(), body.chars().take(200).collect()));
    let name = name.to_string();
    match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound { kind, name },
        StatusCode::CONFLICT if reason == "AlreadyExists" => {
            ClusterError::AlreadyExists { kind, name }
        }
        StatusCode::CONFLICT => ClusterError::Conflict { kind, name },
        StatusCode::UNAUTHORIZED => ClusterError::Unauthorized,
        StatusCode::FORBIDDEN => ClusterError::Forbidden { reason: message },
        other => ClusterError::Api {
            status: other.as_u16(),
            message,
        },
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMeta {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
}

#[derive(Deserialize)]
struct WireServiceAccount {
    metadata: WireMeta,
}

impl From<WireServiceAccount> for ServiceAccount {
    fn from(w: WireServiceAccount) -> Self {
        Self {
            name: w.metadata.name,
            namespace: w.metadata.namespace,
            labels: w.metadata.labels,
            annotations: w.metadata.annotations,
            owner_references: w.metadata.owner_references,
        }
    }
}

#[derive(Deserialize)]
struct WireRole {
    metadata: WireMeta,
    #[serde(default)]
    rules: Vec<PolicyRule>,
}

impl From<WireRole> for Role {
    fn from(w: WireRole) -> Self {
        Self {
            name: w.metadata.name,
            namespace: w.metadata.namespace,
            rules: w.rules,
            owner_references: w.metadata.owner_references,
            resource_version: w.metadata.resource_version,
        }
    }
}

fn role_body(role: &Role) -> serde_json::Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "Role",
        "metadata": WireMeta {
            name: role.name.clone(),
            namespace: role.namespace.clone(),
            owner_references: role.owner_references.clone(),
            resource_version: role.resource_version.clone(),
            ..Default::default()
        },
        "rules": role.rules,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRoleBinding {
    metadata: WireMeta,
    role_ref: WireRoleRef,
    #[serde(default)]
    subjects: Vec<Subject>,
}

#[derive(Deserialize)]
struct WireRoleRef {
    name: String,
}

impl From<WireRoleBinding> for RoleBinding {
    fn from(w: WireRoleBinding) -> Self {
        Self {
            name: w.metadata.name,
            namespace: w.metadata.namespace,
            role_name: w.role_ref.name,
            subjects: w.subjects,
            owner_references: w.metadata.owner_references,
            resource_version: w.metadata.resource_version,
        }
    }
}

fn role_binding_body(binding: &RoleBinding) -> serde_json::Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "RoleBinding",
        "metadata": WireMeta {
            name: binding.name.clone(),
            namespace: binding.namespace.clone(),
            owner_references: binding.owner_references.clone(),
            resource_version: binding.resource_version.clone(),
            ..Default::default()
        },
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "Role",
            "name": binding.role_name,
        },
        "subjects": binding.subjects,
    })
}

#[derive(Deserialize)]
struct WireSecret {
    metadata: WireMeta,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

impl TryFrom<WireSecret> for SecretObject {
    type Error = ClusterError;

    fn try_from(w: WireSecret) -> Result<Self, Self::Error> {
        let mut data = BTreeMap::new();
        for (k, v) in w.data {
            let bytes = STANDARD.decode(v.as_bytes()).map_err(|e| {
                ClusterError::Transport(format!("secret key {k} is not valid base64: {e}"))
            })?;
            data.insert(k, bytes);
        }
        Ok(Self {
            name: w.metadata.name,
            namespace: w.metadata.namespace,
            labels: w.metadata.labels,
            data,
            owner_references: w.metadata.owner_references,
            resource_version: w.metadata.resource_version,
        })
    }
}

fn secret_body(secret: &SecretObject) -> serde_json::Value {
    let data: BTreeMap<&String, String> = secret
        .data
        .iter()
        .map(|(k, v)| (k, STANDARD.encode(v)))
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": WireMeta {
            name: secret.name.clone(),
            namespace: secret.namespace.clone(),
            labels: secret.labels.clone(),
            owner_references: secret.owner_references.clone(),
            resource_version: secret.resource_version.clone(),
            ..Default::default()
        },
        "data": data,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequestStatus {
    token: String,
    expiration_timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenRequestResponse {
    status: TokenRequestStatus,
}

#[derive(Deserialize, Default)]
struct TokenReviewUser {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Deserialize, Default)]
struct TokenReviewStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    user: TokenReviewUser,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct TokenReviewResponse {
    #[serde(default)]
    status: TokenReviewStatus,
}

#[derive(Deserialize, Default)]
struct AccessReviewStatus {
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct AccessReviewResponse {
    #[serde(default)]
    status: AccessReviewStatus,
}

fn annotations_patch(annotations: &BTreeMap<String, String>) -> Result<Vec<u8>, ClusterError> {
    serde_json::to_vec(&json!({ "metadata": { "annotations": annotations } }))
        .map_err(|e| ClusterError::Transport(format!("failed to encode patch: {e}")))
}

#[async_trait]
impl ClusterApi for HttpCluster {
    async fn get_session(&self, namespace: &str, name: &str) -> Result<Session, ClusterError> {
        let req = self
            .request(Method::GET, &self.session_path(namespace, name))
            .await?;
        self.json("get session", "AgenticSession", name, req).await
    }

    async fn patch_session_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Session, ClusterError> {
        let req = self
            .request(Method::PATCH, &self.session_path(namespace, name))
            .await?
            .header("Content-Type", MERGE_PATCH)
            .body(annotations_patch(annotations)?);
        self.json("patch session", "AgenticSession", name, req).await
    }

    async fn update_session(&self, session: &Session) -> Result<Session, ClusterError> {
        let (namespace, name) = (&session.metadata.namespace, &session.metadata.name);
        let req = self
            .request(Method::PUT, &self.session_path(namespace, name))
            .await?
            .json(session);
        self.json("update session", "AgenticSession", name, req).await
    }

    async fn update_session_status(&self, session: &Session) -> Result<Session, ClusterError> {
        let (namespace, name) = (&session.metadata.namespace, &session.metadata.name);
        let path = format!("{}/status", self.session_path(namespace, name));
        let req = self.request(Method::PUT, &path).await?.json(session);
        self.json("update session status", "AgenticSession", name, req)
            .await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, ClusterError> {
        let path = format!("/api/v1/namespaces/{namespace}/serviceaccounts/{name}");
        let req = self.request(Method::GET, &path).await?;
        let wire: WireServiceAccount = self
            .json("get service account", "ServiceAccount", name, req)
            .await?;
        Ok(wire.into())
    }

    async fn create_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, ClusterError> {
        let path = format!("/api/v1/namespaces/{}/serviceaccounts", account.namespace);
        let body = json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": WireMeta {
                name: account.name.clone(),
                namespace: account.namespace.clone(),
                labels: account.labels.clone(),
                annotations: account.annotations.clone(),
                owner_references: account.owner_references.clone(),
                resource_version: None,
            },
        });
        let req = self.request(Method::POST, &path).await?.json(&body);
        let wire: WireServiceAccount = self
            .json("create service account", "ServiceAccount", &account.name, req)
            .await?;
        Ok(wire.into())
    }

    async fn patch_service_account_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let path = format!("/api/v1/namespaces/{namespace}/serviceaccounts/{name}");
        let req = self
            .request(Method::PATCH, &path)
            .await?
            .header("Content-Type", MERGE_PATCH)
            .body(annotations_patch(annotations)?);
        self.send("patch service account", "ServiceAccount", name, req)
            .await
            .map(|_| ())
    }

    async fn create_token(
        &self,
        namespace: &str,
        account: &str,
        ttl: Duration,
    ) -> Result<MintedToken, ClusterError> {
        let path = format!("/api/v1/namespaces/{namespace}/serviceaccounts/{account}/token");
        let body = json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "TokenRequest",
            "spec": { "expirationSeconds": ttl.as_secs() },
        });
        let req = self.request(Method::POST, &path).await?.json(&body);
        let resp: TokenRequestResponse = self
            .json("create token", "ServiceAccount", account, req)
            .await?;
        Ok(MintedToken {
            token: SecretString::from(resp.status.token),
            expires_at: resp.status.expiration_timestamp,
        })
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Role, ClusterError> {
        let path = format!("{RBAC_API}/namespaces/{namespace}/roles/{name}");
        let req = self.request(Method::GET, &path).await?;
        let wire: WireRole = self.json("get role", "Role", name, req).await?;
        Ok(wire.into())
    }

    async fn create_role(&self, role: &Role) -> Result<Role, ClusterError> {
        let path = format!("{RBAC_API}/namespaces/{}/roles", role.namespace);
        let req = self
            .request(Method::POST, &path)
            .await?
            .json(&role_body(role));
        let wire: WireRole = self.json("create role", "Role", &role.name, req).await?;
        Ok(wire.into())
    }

    async fn update_role(&self, role: &Role) -> Result<Role, ClusterError> {
        let path = format!("{RBAC_API}/namespaces/{}/roles/{}", role.namespace, role.name);
        let req = self.request(Method::PUT, &path).await?.json(&role_body(role));
        let wire: WireRole = self.json("update role", "Role", &role.name, req).await?;
        Ok(wire.into())
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<RoleBinding, ClusterError> {
        let path = format!("{RBAC_API}/namespaces/{namespace}/rolebindings/{name}");
        let req = self.request(Method::GET, &path).await?;
        let wire: WireRoleBinding = self
            .json("get role binding", "RoleBinding", name, req)
            .await?;
        Ok(wire.into())
    }

    async fn create_role_binding(
        &self,
        binding: &RoleBinding,
    ) -> Result<RoleBinding, ClusterError> {
        let path = format!("{RBAC_API}/namespaces/{}/rolebindings", binding.namespace);
        let req = self
            .request(Method::POST, &path)
            .await?
            .json(&role_binding_body(binding));
        let wire: WireRoleBinding = self
            .json("create role binding", "RoleBinding", &binding.name, req)
            .await?;
        Ok(wire.into())
    }

    async fn update_role_binding(
        &self,
        binding: &RoleBinding,
    ) -> Result<RoleBinding, ClusterError> {
        let path = format!(
            "{RBAC_API}/namespaces/{}/rolebindings/{}",
            binding.namespace, binding.name
        );
        let req = self
            .request(Method::PUT, &path)
            .await?
            .json(&role_binding_body(binding));
        let wire: WireRoleBinding = self
            .json("update role binding", "RoleBinding", &binding.name, req)
            .await?;
        Ok(wire.into())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretObject, ClusterError> {
        let path = format!("/api/v1/namespaces/{namespace}/secrets/{name}");
        let req = self.request(Method::GET, &path).await?;
        let wire: WireSecret = self.json("get secret", "Secret", name, req).await?;
        wire.try_into()
    }

    async fn create_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError> {
        let path = format!("/api/v1/namespaces/{}/secrets", secret.namespace);
        let req = self
            .request(Method::POST, &path)
            .await?
            .json(&secret_body(secret));
        let wire: WireSecret = self
            .json("create secret", "Secret", &secret.name, req)
            .await?;
        wire.try_into()
    }

    async fn update_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError> {
        let path = format!(
            "/api/v1/namespaces/{}/secrets/{}",
            secret.namespace, secret.name
        );
        let req = self
            .request(Method::PUT, &path)
            .await?
            .json(&secret_body(secret));
        let wire: WireSecret = self
            .json("update secret", "Secret", &secret.name, req)
            .await?;
        wire.try_into()
    }

    async fn review_token(&self, token: &str) -> Result<TokenReview, ClusterError> {
        let body = json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "TokenReview",
            "spec": { "token": token },
        });
        let req = self
            .request(Method::POST, "/apis/authentication.k8s.io/v1/tokenreviews")
            .await?
            .json(&body);
        let resp: TokenReviewResponse = self
            .json("token review", "TokenReview", "", req)
            .await?;
        Ok(TokenReview {
            authenticated: resp.status.authenticated,
            username: resp.status.user.username,
            error: resp.status.error.filter(|e| !e.is_empty()),
        })
    }

    async fn check_access(&self, check: &AccessCheck) -> Result<AccessDecision, ClusterError> {
        let body = json!({
            "apiVersion": "authorization.k8s.io/v1",
            "kind": "SelfSubjectAccessReview",
            "spec": {
                "resourceAttributes": {
                    "group": check.group,
                    "resource": check.resource,
                    "verb": check.verb,
                    "namespace": check.namespace,
                }
            },
        });
        let req = self
            .request(
                Method::POST,
                "/apis/authorization.k8s.io/v1/selfsubjectaccessreviews",
            )
            .await?
            .json(&body);
        let resp: AccessReviewResponse = self
            .json("access review", "SelfSubjectAccessReview", "", req)
            .await?;
        Ok(AccessDecision {
            allowed: resp.status.allowed,
            reason: resp.status.reason,
        })
    }

    async fn delete_job(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), ClusterError> {
        let path = format!("/apis/batch/v1/namespaces/{namespace}/jobs/{name}");
        let req = self
            .request(Method::DELETE, &path)
            .await?
            .query(&[("propagationPolicy", propagation.as_str())]);
        self.send("delete job", "Job", name, req).await.map(|_| ())
    }

    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> Result<(), ClusterError> {
        let path = format!("/api/v1/namespaces/{namespace}/pods");
        let req = self
            .request(Method::DELETE, &path)
            .await?
            .query(&[("labelSelector", label_selector)]);
        self.send("delete pods", "Pod", label_selector, req)
            .await
            .map(|_| ())
    }
}

impl ClusterConnector for HttpCluster {
    fn with_bearer(&self, token: &str) -> Result<Arc<dyn ClusterApi>, ClusterError> {
        Ok(Arc::new(self.scoped_to(token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(auth: AuthMode) -> HttpCluster {
        HttpCluster::new(
            Client::new(),
            "https://api.example:6443/",
            auth,
            Duration::from_secs(5),
            SessionResource::default(),
        )
    }

    #[test]
    fn test_scoped_to_drops_ambient_auth() {
        for ambient in [
            AuthMode::TokenFile("/var/run/token".into()),
            AuthMode::AuthProvider {
                name: "oidc".into(),
                token: SecretString::from("provider-token".to_string()),
            },
            AuthMode::ExecHelper {
                command: "cred-helper".into(),
                args: vec!["get".into()],
            },
            AuthMode::Basic {
                username: "admin".into(),
                password: SecretString::from("pw".to_string()),
            },
        ] {
            let scoped = cluster(ambient).scoped_to("user-token");
            assert!(scoped.auth_mode().is_bearer());
            match scoped.auth_mode() {
                AuthMode::Bearer(t) => assert_eq!(t.expose_secret(), "user-token"),
                other => panic!("expected bearer, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_debug_redacts() {
        let rendered = format!(
            "{:?}",
            AuthMode::Basic {
                username: "admin".into(),
                password: SecretString::from("hunter2".to_string()),
            }
        );
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_session_path() {
        let c = cluster(AuthMode::TokenFile("/t".into()));
        assert_eq!(
            format!("{}{}", c.base_url, c.session_path("proj-a", "s1")),
            "https://api.example:6443/apis/vteam.ambient-code/v1alpha1/namespaces/proj-a/agenticsessions/s1"
        );
    }

    #[test]
    fn test_status_error_mapping() {
        let exists = r#"{"kind":"Status","reason":"AlreadyExists","message":"exists"}"#;
        assert!(status_error(StatusCode::CONFLICT, exists, "Role", "r").is_already_exists());
        let conflict = r#"{"kind":"Status","reason":"Conflict","message":"modified"}"#;
        assert!(status_error(StatusCode::CONFLICT, conflict, "Secret", "s").is_conflict());
        assert!(status_error(StatusCode::NOT_FOUND, "", "Job", "j").is_not_found());
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, r#"{"message":"denied"}"#, "Pod", ""),
            ClusterError::Forbidden { reason } if reason == "denied"
        ));
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "down", "Pod", ""),
            ClusterError::Api { status: 503, .. }
        ));
    }

    #[test]
    fn test_secret_wire_round_trip() {
        let secret = SecretObject {
            name: "ambient-runner-token-s1".into(),
            namespace: "proj-a".into(),
            data: BTreeMap::from([("k8s-token".to_string(), b"abc".to_vec())]),
            ..Default::default()
        };
        let body = secret_body(&secret);
        assert_eq!(body["data"]["k8s-token"], "YWJj");
        let wire: WireSecret = serde_json::from_value(body).unwrap();
        let back = SecretObject::try_from(wire).unwrap();
        assert_eq!(back.data, secret.data);
    }
}
