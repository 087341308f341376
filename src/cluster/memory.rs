//! In-process cluster used by tests and local development.
//!
//! Objects live in a shared map guarded by a mutex. Clients obtained through
//! [`ClusterConnector::with_bearer`] act as the identity their token was
//! registered for and are authorized against role bindings and explicit
//! grants, the same way the real API server would. The root handle acts as
//! the platform identity and may do anything.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;

use crate::cluster::{
    AccessCheck, AccessDecision, ClusterApi, ClusterConnector, MintedToken, PolicyRule,
    Propagation, Role, RoleBinding, SecretObject, ServiceAccount, TokenReview,
};
use crate::config::SessionResource;
use crate::error::ClusterError;
use crate::session::Session;

/// Username of the root handle.
pub const PLATFORM_USER: &str = "system:platform";

const SA_PREFIX: &str = "system:serviceaccount:";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Username the call was made as.
    pub caller: String,
    pub operation: &'static str,
    /// `namespace/name` or selector of the target.
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct MemoryPod {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    resource: SessionResource,
    revision: u64,
    sessions: HashMap<Key, Session>,
    service_accounts: HashMap<Key, ServiceAccount>,
    roles: HashMap<Key, Role>,
    role_bindings: HashMap<Key, RoleBinding>,
    secrets: HashMap<Key, SecretObject>,
    jobs: HashMap<Key, Option<Propagation>>,
    pods: Vec<MemoryPod>,
    /// bearer token -> username
    tokens: HashMap<String, String>,
    /// username -> (namespace or "*", rule)
    grants: HashMap<String, Vec<(String, PolicyRule)>>,
    injected: HashMap<&'static str, VecDeque<ClusterError>>,
    calls: Vec<RecordedCall>,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn rules_for(&self, username: &str, namespace: &str) -> Vec<PolicyRule> {
        let mut rules: Vec<PolicyRule> = self
            .grants
            .get(username)
            .into_iter()
            .flatten()
            .filter(|(ns, _)| ns == "*" || ns == namespace)
            .map(|(_, rule)| rule.clone())
            .collect();

        if let Some((sa_ns, sa_name)) = username
            .strip_prefix(SA_PREFIX)
            .and_then(|rest| rest.split_once(':'))
        {
            for binding in self.role_bindings.values() {
                if binding.namespace != namespace {
                    continue;
                }
                let bound = binding.subjects.iter().any(|s| {
                    s.kind == "ServiceAccount"
                        && s.name == sa_name
                        && s.namespace.as_deref().unwrap_or(&binding.namespace) == sa_ns
                });
                if bound
                    && let Some(role) = self.roles.get(&key(namespace, &binding.role_name))
                {
                    rules.extend(role.rules.iter().cloned());
                }
            }
        }
        rules
    }
}

#[derive(Clone)]
enum Caller {
    Platform,
    Bearer(String),
}

/// In-memory [`ClusterApi`].
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
    caller: Caller,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::with_resource(SessionResource::default())
    }

    pub fn with_resource(resource: SessionResource) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                resource,
                ..State::default()
            })),
            caller: Caller::Platform,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Test fixtures ───────────────────────────────────────────────

    /// Store a session, filling in uid and resource version when absent.
    pub fn insert_session(&self, mut session: Session) -> Session {
        let mut state = self.lock();
        if session.metadata.uid.is_empty() {
            session.metadata.uid = uuid::Uuid::new_v4().to_string();
        }
        if session.api_version.is_empty() {
            session.api_version = state.resource.api_version();
        }
        if session.kind.is_empty() {
            session.kind = "AgenticSession".to_string();
        }
        session.metadata.resource_version = Some(state.next_revision());
        let k = key(&session.metadata.namespace, &session.metadata.name);
        state.sessions.insert(k, session.clone());
        session
    }

    pub fn session(&self, namespace: &str, name: &str) -> Option<Session> {
        self.lock().sessions.get(&key(namespace, name)).cloned()
    }

    pub fn remove_session(&self, namespace: &str, name: &str) {
        self.lock().sessions.remove(&key(namespace, name));
    }

    pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.lock().service_accounts.get(&key(namespace, name)).cloned()
    }

    pub fn insert_service_account(&self, account: ServiceAccount) {
        let k = key(&account.namespace, &account.name);
        self.lock().service_accounts.insert(k, account);
    }

    pub fn role(&self, namespace: &str, name: &str) -> Option<Role> {
        self.lock().roles.get(&key(namespace, name)).cloned()
    }

    pub fn insert_role(&self, mut role: Role) {
        let mut state = self.lock();
        role.resource_version = Some(state.next_revision());
        state.roles.insert(key(&role.namespace, &role.name), role);
    }

    pub fn role_binding(&self, namespace: &str, name: &str) -> Option<RoleBinding> {
        self.lock().role_bindings.get(&key(namespace, name)).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<SecretObject> {
        self.lock().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn secrets_in(&self, namespace: &str) -> Vec<SecretObject> {
        self.lock()
            .secrets
            .values()
            .filter(|s| s.namespace == namespace)
            .cloned()
            .collect()
    }

    pub fn add_job(&self, namespace: &str, name: &str) {
        self.lock().jobs.insert(key(namespace, name), None);
    }

    pub fn has_job(&self, namespace: &str, name: &str) -> bool {
        self.lock().jobs.contains_key(&key(namespace, name))
    }

    pub fn add_pod(&self, namespace: &str, name: &str, labels: &[(&str, &str)]) {
        self.lock().pods.push(MemoryPod {
            namespace: namespace.to_string(),
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }

    pub fn pods(&self) -> Vec<MemoryPod> {
        self.lock().pods.clone()
    }

    /// Make `token` authenticate as `username`.
    pub fn register_token(&self, token: &str, username: &str) {
        self.lock()
            .tokens
            .insert(token.to_string(), username.to_string());
    }

    /// Grant `rule` to `username` in `namespace` (`"*"` for every namespace).
    pub fn grant(&self, username: &str, namespace: &str, rule: PolicyRule) {
        self.lock()
            .grants
            .entry(username.to_string())
            .or_default()
            .push((namespace.to_string(), rule));
    }

    /// Fail the next call to `operation` with `error`.
    pub fn fail_next(&self, operation: &'static str, error: ClusterError) {
        self.lock()
            .injected
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, operation: &str) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    // ── Request plumbing ────────────────────────────────────────────

    /// Record the call, authenticate and authorize the caller, and apply any
    /// injected failure. Returns the locked state on success.
    fn begin(
        &self,
        operation: &'static str,
        target: String,
        access: Option<(&str, &str, &str, &str)>,
    ) -> Result<MutexGuard<'_, State>, ClusterError> {
        let mut state = self.lock();
        let username = match &self.caller {
            Caller::Platform => Some(PLATFORM_USER.to_string()),
            Caller::Bearer(token) => state.tokens.get(token).cloned(),
        };
        state.calls.push(RecordedCall {
            caller: username.clone().unwrap_or_else(|| "<anonymous>".to_string()),
            operation,
            target,
        });

        if let Some(err) = state.injected.get_mut(operation).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        let Some(username) = username else {
            return Err(ClusterError::Unauthorized);
        };

        if let (Caller::Bearer(_), Some((group, resource, verb, namespace))) =
            (&self.caller, access)
        {
            let allowed = state
                .rules_for(&username, namespace)
                .iter()
                .any(|r| r.allows(group, resource, verb));
            if !allowed {
                return Err(ClusterError::Forbidden {
                    reason: format!(
                        "{username} cannot {verb} {resource} in namespace {namespace}"
                    ),
                });
            }
        }
        Ok(state)
    }

    fn session_group(&self) -> (String, String) {
        let state = self.lock();
        (state.resource.group.clone(), state.resource.plural.clone())
    }
}

fn not_found(kind: &'static str, namespace: &str, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind,
        name: format!("{namespace}/{name}"),
    }
}

/// Session updates must name the version they were read at.
fn check_session_version(
    namespace: &str,
    name: &str,
    expected: Option<&str>,
    current: Option<&str>,
) -> Result<(), ClusterError> {
    if expected.is_none() {
        return Err(ClusterError::Api {
            status: 422,
            message: "metadata.resourceVersion: must be specified for an update".into(),
        });
    }
    check_version("AgenticSession", namespace, name, expected, current)
}

fn check_version(
    kind: &'static str,
    namespace: &str,
    name: &str,
    expected: Option<&str>,
    current: Option<&str>,
) -> Result<(), ClusterError> {
    match expected {
        Some(v) if Some(v) != current => Err(ClusterError::Conflict {
            kind,
            name: format!("{namespace}/{name}"),
        }),
        _ => Ok(()),
    }
}

fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).is_some_and(|l| l == v.trim()),
            None => labels.contains_key(term.trim()),
        }
    })
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get_session(&self, namespace: &str, name: &str) -> Result<Session, ClusterError> {
        let (group, plural) = self.session_group();
        let state = self.begin(
            "get_session",
            format!("{namespace}/{name}"),
            Some((&group, &plural, "get", namespace)),
        )?;
        state
            .sessions
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("AgenticSession", namespace, name))
    }

    async fn patch_session_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Session, ClusterError> {
        let (group, plural) = self.session_group();
        let mut state = self.begin(
            "patch_session_annotations",
            format!("{namespace}/{name}"),
            Some((&group, &plural, "patch", namespace)),
        )?;
        let revision = state.next_revision();
        let session = state
            .sessions
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found("AgenticSession", namespace, name))?;
        for (k, v) in annotations {
            session.metadata.annotations.insert(k.clone(), v.clone());
        }
        session.metadata.resource_version = Some(revision);
        Ok(session.clone())
    }

    async fn update_session(&self, session: &Session) -> Result<Session, ClusterError> {
        let (group, plural) = self.session_group();
        let (namespace, name) = (&session.metadata.namespace, &session.metadata.name);
        let mut state = self.begin(
            "update_session",
            format!("{namespace}/{name}"),
            Some((&group, &plural, "update", namespace)),
        )?;
        let revision = state.next_revision();
        let stored = state
            .sessions
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found("AgenticSession", namespace, name))?;
        check_session_version(
            namespace,
            name,
            session.metadata.resource_version.as_deref(),
            stored.metadata.resource_version.as_deref(),
        )?;
        stored.metadata = session.metadata.clone();
        stored.spec = session.spec.clone();
        stored.metadata.resource_version = Some(revision);
        Ok(stored.clone())
    }

    async fn update_session_status(&self, session: &Session) -> Result<Session, ClusterError> {
        let (group, plural) = self.session_group();
        let (namespace, name) = (&session.metadata.namespace, &session.metadata.name);
        let status_resource = format!("{plural}/status");
        let mut state = self.begin(
            "update_session_status",
            format!("{namespace}/{name}"),
            Some((&group, &status_resource, "update", namespace)),
        )?;
        let revision = state.next_revision();
        let stored = state
            .sessions
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found("AgenticSession", namespace, name))?;
        check_session_version(
            namespace,
            name,
            session.metadata.resource_version.as_deref(),
            stored.metadata.resource_version.as_deref(),
        )?;
        stored.status = session.status.clone();
        stored.metadata.resource_version = Some(revision);
        Ok(stored.clone())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, ClusterError> {
        let state = self.begin(
            "get_service_account",
            format!("{namespace}/{name}"),
            Some(("", "serviceaccounts", "get", namespace)),
        )?;
        state
            .service_accounts
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("ServiceAccount", namespace, name))
    }

    async fn create_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, ClusterError> {
        let mut state = self.begin(
            "create_service_account",
            format!("{}/{}", account.namespace, account.name),
            Some(("", "serviceaccounts", "create", &account.namespace)),
        )?;
        let k = key(&account.namespace, &account.name);
        if state.service_accounts.contains_key(&k) {
            return Err(ClusterError::AlreadyExists {
                kind: "ServiceAccount",
                name: account.name.clone(),
            });
        }
        state.service_accounts.insert(k, account.clone());
        Ok(account.clone())
    }

    async fn patch_service_account_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let mut state = self.begin(
            "patch_service_account_annotations",
            format!("{namespace}/{name}"),
            Some(("", "serviceaccounts", "patch", namespace)),
        )?;
        let account = state
            .service_accounts
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found("ServiceAccount", namespace, name))?;
        for (k, v) in annotations {
            account.annotations.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn create_token(
        &self,
        namespace: &str,
        account: &str,
        ttl: Duration,
    ) -> Result<MintedToken, ClusterError> {
        let mut state = self.begin(
            "create_token",
            format!("{namespace}/{account}"),
            Some(("", "serviceaccounts/token", "create", namespace)),
        )?;
        if !state.service_accounts.contains_key(&key(namespace, account)) {
            return Err(not_found("ServiceAccount", namespace, account));
        }
        let token = format!("mem.{}", uuid::Uuid::new_v4().simple());
        state
            .tokens
            .insert(token.clone(), format!("{SA_PREFIX}{namespace}:{account}"));
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        Ok(MintedToken {
            token: SecretString::from(token),
            expires_at: Utc::now() + ttl,
        })
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Role, ClusterError> {
        let state = self.begin(
            "get_role",
            format!("{namespace}/{name}"),
            Some(("rbac.authorization.k8s.io", "roles", "get", namespace)),
        )?;
        state
            .roles
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("Role", namespace, name))
    }

    async fn create_role(&self, role: &Role) -> Result<Role, ClusterError> {
        let mut state = self.begin(
            "create_role",
            format!("{}/{}", role.namespace, role.name),
            Some(("rbac.authorization.k8s.io", "roles", "create", &role.namespace)),
        )?;
        let k = key(&role.namespace, &role.name);
        if state.roles.contains_key(&k) {
            return Err(ClusterError::AlreadyExists {
                kind: "Role",
                name: role.name.clone(),
            });
        }
        let mut stored = role.clone();
        stored.resource_version = Some(state.next_revision());
        state.roles.insert(k, stored.clone());
        Ok(stored)
    }

    async fn update_role(&self, role: &Role) -> Result<Role, ClusterError> {
        let mut state = self.begin(
            "update_role",
            format!("{}/{}", role.namespace, role.name),
            Some(("rbac.authorization.k8s.io", "roles", "update", &role.namespace)),
        )?;
        let revision = state.next_revision();
        let stored = state
            .roles
            .get_mut(&key(&role.namespace, &role.name))
            .ok_or_else(|| not_found("Role", &role.namespace, &role.name))?;
        check_version(
            "Role",
            &role.namespace,
            &role.name,
            role.resource_version.as_deref(),
            stored.resource_version.as_deref(),
        )?;
        *stored = role.clone();
        stored.resource_version = Some(revision);
        Ok(stored.clone())
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<RoleBinding, ClusterError> {
        let state = self.begin(
            "get_role_binding",
            format!("{namespace}/{name}"),
            Some(("rbac.authorization.k8s.io", "rolebindings", "get", namespace)),
        )?;
        state
            .role_bindings
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("RoleBinding", namespace, name))
    }

    async fn create_role_binding(
        &self,
        binding: &RoleBinding,
    ) -> Result<RoleBinding, ClusterError> {
        let mut state = self.begin(
            "create_role_binding",
            format!("{}/{}", binding.namespace, binding.name),
            Some((
                "rbac.authorization.k8s.io",
                "rolebindings",
                "create",
                &binding.namespace,
            )),
        )?;
        let k = key(&binding.namespace, &binding.name);
        if state.role_bindings.contains_key(&k) {
            return Err(ClusterError::AlreadyExists {
                kind: "RoleBinding",
                name: binding.name.clone(),
            });
        }
        let mut stored = binding.clone();
        stored.resource_version = Some(state.next_revision());
        state.role_bindings.insert(k, stored.clone());
        Ok(stored)
    }

    async fn update_role_binding(
        &self,
        binding: &RoleBinding,
    ) -> Result<RoleBinding, ClusterError> {
        let mut state = self.begin(
            "update_role_binding",
            format!("{}/{}", binding.namespace, binding.name),
            Some((
                "rbac.authorization.k8s.io",
                "rolebindings",
                "update",
                &binding.namespace,
            )),
        )?;
        let revision = state.next_revision();
        let stored = state
            .role_bindings
            .get_mut(&key(&binding.namespace, &binding.name))
            .ok_or_else(|| not_found("RoleBinding", &binding.namespace, &binding.name))?;
        check_version(
            "RoleBinding",
            &binding.namespace,
            &binding.name,
            binding.resource_version.as_deref(),
            stored.resource_version.as_deref(),
        )?;
        *stored = binding.clone();
        stored.resource_version = Some(revision);
        Ok(stored.clone())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretObject, ClusterError> {
        let state = self.begin(
            "get_secret",
            format!("{namespace}/{name}"),
            Some(("", "secrets", "get", namespace)),
        )?;
        state
            .secrets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("Secret", namespace, name))
    }

    async fn create_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError> {
        let mut state = self.begin(
            "create_secret",
            format!("{}/{}", secret.namespace, secret.name),
            Some(("", "secrets", "create", &secret.namespace)),
        )?;
        let k = key(&secret.namespace, &secret.name);
        if state.secrets.contains_key(&k) {
            return Err(ClusterError::AlreadyExists {
                kind: "Secret",
                name: secret.name.clone(),
            });
        }
        let mut stored = secret.clone();
        stored.resource_version = Some(state.next_revision());
        state.secrets.insert(k, stored.clone());
        Ok(stored)
    }

    async fn update_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError> {
        let mut state = self.begin(
            "update_secret",
            format!("{}/{}", secret.namespace, secret.name),
            Some(("", "secrets", "update", &secret.namespace)),
        )?;
        let revision = state.next_revision();
        let stored = state
            .secrets
            .get_mut(&key(&secret.namespace, &secret.name))
            .ok_or_else(|| not_found("Secret", &secret.namespace, &secret.name))?;
        check_version(
            "Secret",
            &secret.namespace,
            &secret.name,
            secret.resource_version.as_deref(),
            stored.resource_version.as_deref(),
        )?;
        *stored = secret.clone();
        stored.resource_version = Some(revision);
        Ok(stored.clone())
    }

    async fn review_token(&self, token: &str) -> Result<TokenReview, ClusterError> {
        let state = self.begin(
            "review_token",
            "tokenreviews".to_string(),
            Some(("authentication.k8s.io", "tokenreviews", "create", "")),
        )?;
        Ok(match state.tokens.get(token) {
            Some(username) => TokenReview {
                authenticated: true,
                username: Some(username.clone()),
                error: None,
            },
            None => TokenReview::default(),
        })
    }

    async fn check_access(&self, check: &AccessCheck) -> Result<AccessDecision, ClusterError> {
        let state = self.begin(
            "check_access",
            format!("{}/{}:{}", check.namespace, check.resource, check.verb),
            None,
        )?;
        let username = match &self.caller {
            Caller::Platform => {
                return Ok(AccessDecision {
                    allowed: true,
                    reason: "platform identity".to_string(),
                });
            }
            Caller::Bearer(token) => state.tokens.get(token).cloned().unwrap_or_default(),
        };
        let allowed = state
            .rules_for(&username, &check.namespace)
            .iter()
            .any(|r| r.allows(&check.group, &check.resource, &check.verb));
        Ok(AccessDecision {
            allowed,
            reason: if allowed {
                "allowed by policy".to_string()
            } else {
                "no matching rule".to_string()
            },
        })
    }

    async fn delete_job(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), ClusterError> {
        let mut state = self.begin(
            "delete_job",
            format!("{namespace}/{name}:{}", propagation.as_str()),
            Some(("batch", "jobs", "delete", namespace)),
        )?;
        state
            .jobs
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found("Job", namespace, name))
    }

    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> Result<(), ClusterError> {
        let mut state = self.begin(
            "delete_pods",
            format!("{namespace}?{label_selector}"),
            Some(("", "pods", "deletecollection", namespace)),
        )?;
        state
            .pods
            .retain(|p| !(p.namespace == namespace && selector_matches(label_selector, &p.labels)));
        Ok(())
    }
}

impl ClusterConnector for MemoryCluster {
    fn with_bearer(&self, token: &str) -> Result<Arc<dyn ClusterApi>, ClusterError> {
        Ok(Arc::new(Self {
            state: Arc::clone(&self.state),
            caller: Caller::Bearer(token.to_string()),
        }))
    }
}
