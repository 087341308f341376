//! Request-scoped cluster clients.
//!
//! User-initiated writes must run with the caller's own permissions. The
//! resolver builds a client from the caller's bearer and nothing else; when
//! no bearer is present it returns `None` and the caller must reject the
//! request. Substituting the platform identity is never an option.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use tokio::task::JoinHandle;

use crate::cluster::{AccessCheck, AccessDecision, ClusterApi, ClusterConnector};
use crate::config::TelemetryConfig;
use crate::error::{ClusterError, CredentialError};
use crate::verify::parse_identity_subject;

/// Label value marking identities issued as long-lived access keys.
pub const ACCESS_KEY_LABEL_VALUE: &str = "ambient-access-key";
/// Annotation stamped with the last time an access key was used.
pub const ANNOTATION_LAST_USED: &str = "ambient-code.io/last-used-at";

/// A cluster client authenticated as the caller.
#[derive(Clone)]
pub struct ScopedClient {
    api: Arc<dyn ClusterApi>,
}

impl ScopedClient {
    pub fn api(&self) -> &dyn ClusterApi {
        self.api.as_ref()
    }

    /// Ask the cluster whether the caller may perform `check`.
    pub async fn check_access(&self, check: &AccessCheck) -> Result<AccessDecision, ClusterError> {
        self.api.check_access(check).await
    }

    /// `Forbidden` unless the caller may `verb` secrets in `namespace`.
    pub async fn ensure_secret_access(
        &self,
        namespace: &str,
        verb: &str,
    ) -> Result<(), CredentialError> {
        self.ensure_access(AccessCheck {
            group: String::new(),
            resource: "secrets".to_string(),
            verb: verb.to_string(),
            namespace: namespace.to_string(),
        })
        .await
    }

    pub async fn ensure_access(&self, check: AccessCheck) -> Result<(), CredentialError> {
        let decision = self.check_access(&check).await?;
        if decision.allowed {
            return Ok(());
        }
        Err(CredentialError::Forbidden(format!(
            "{} {} in {} denied: {}",
            check.verb, check.resource, check.namespace, decision.reason
        )))
    }
}

/// Trim and drop a case-insensitive `Bearer ` prefix. A value without the
/// prefix is taken as the raw token.
pub fn normalize_bearer(value: &str) -> &str {
    let value = value.trim();
    if value.eq_ignore_ascii_case("bearer") {
        return "";
    }
    match value.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
        _ => value,
    }
}

/// `sub` claim of a JWT, read without verifying the signature. Only used for
/// best-effort telemetry; never for an authorization decision.
pub fn unverified_subject(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = crate::BASE64URL.decode(payload.as_bytes()).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("sub")?.as_str().map(str::to_string)
}

/// Builds [`ScopedClient`]s from request credentials.
pub struct ClientResolver {
    connector: Arc<dyn ClusterConnector>,
    /// Used only for the access-key usage stamp.
    platform: Arc<dyn ClusterApi>,
    telemetry: TelemetryConfig,
}

impl ClientResolver {
    pub fn new(
        connector: Arc<dyn ClusterConnector>,
        platform: Arc<dyn ClusterApi>,
        telemetry: TelemetryConfig,
    ) -> Self {
        Self {
            connector,
            platform,
            telemetry,
        }
    }

    /// Client for the request's bearer, from `authorization` or else the
    /// forwarded access token. `None` when neither carries a token.
    pub fn resolve(
        &self,
        authorization: Option<&str>,
        forwarded: Option<&str>,
    ) -> Option<ScopedClient> {
        let token = authorization
            .map(normalize_bearer)
            .filter(|t| !t.is_empty())
            .or_else(|| forwarded.map(str::trim).filter(|t| !t.is_empty()))?;

        let api = match self.connector.with_bearer(token) {
            Ok(api) => api,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build request-scoped client");
                return None;
            }
        };

        if self.telemetry.stamp_access_keys {
            let _ = self.spawn_usage_stamp(token);
        }
        Some(ScopedClient { api })
    }

    /// Record last use on access-key identities, detached from the request.
    /// Errors and timeouts are logged at debug and otherwise ignored.
    pub(crate) fn spawn_usage_stamp(&self, token: &str) -> Option<JoinHandle<()>> {
        let subject = unverified_subject(token)?;
        let (namespace, name) = parse_identity_subject(&subject)?;
        let (namespace, name) = (namespace.to_string(), name.to_string());
        // Only when a runtime is active (skipped in sync callers).
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let platform = Arc::clone(&self.platform);
        let timeout = self.telemetry.stamp_timeout;

        Some(handle.spawn(async move {
            let stamp = async {
                let account = platform.get_service_account(&namespace, &name).await?;
                if account.labels.get("app").map(String::as_str) != Some(ACCESS_KEY_LABEL_VALUE) {
                    return Ok::<(), ClusterError>(());
                }
                let annotations = BTreeMap::from([(
                    ANNOTATION_LAST_USED.to_string(),
                    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                )]);
                platform
                    .patch_service_account_annotations(&namespace, &name, &annotations)
                    .await
            };
            match tokio::time::timeout(timeout, stamp).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(namespace = %namespace, identity = %name, error = %e, "Access key usage stamp failed")
                }
                Err(_) => {
                    tracing::debug!(namespace = %namespace, identity = %name, "Access key usage stamp timed out")
                }
            }
        }))
    }
}
