//! The OAuth authorization flow for session-scoped third-party credentials.
//!
//! `begin` runs with the caller's scoped client and returns a provider URL
//! carrying a signed state. `complete` runs on the public callback: the state
//! is verified before the code is exchanged and before anything is written,
//! so a forged or replayed callback leaves no trace.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::cluster::ClusterApi;
use crate::error::{CredentialError, StateError};
use crate::oauth::provider::{ProviderKind, ProviderRegistry};
use crate::oauth::state::{StatePayload, StateSigner};
use crate::resolver::ScopedClient;
use crate::session::SessionRef;
use crate::store::{CredentialStore, SecretRef, StoredOAuthCredential};

/// Lifetime assumed when a provider omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

pub fn oauth_secret_name(session: &str, provider: ProviderKind) -> String {
    format!("{session}-{provider}-oauth")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Query parameters delivered to the callback.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Stored {
        session: SessionRef,
        provider: ProviderKind,
        secret: SecretRef,
    },
    /// The user declined or the provider reported an error.
    ProviderDenied {
        error: String,
        description: Option<String>,
    },
}

pub struct OAuthFlow {
    signer: Option<StateSigner>,
    providers: ProviderRegistry,
    store: CredentialStore,
    /// Platform client for the session lookup behind the public callback.
    platform: Arc<dyn ClusterApi>,
}

impl OAuthFlow {
    pub fn new(
        signer: Option<StateSigner>,
        providers: ProviderRegistry,
        platform: Arc<dyn ClusterApi>,
    ) -> Self {
        Self {
            signer,
            providers,
            store: CredentialStore::new(Arc::clone(&platform)),
            platform,
        }
    }

    fn signer(&self) -> Result<&StateSigner, CredentialError> {
        self.signer
            .as_ref()
            .ok_or_else(|| StateError::NotConfigured.into())
    }

    /// Start a flow for `session`. The caller must be able to read the session.
    pub async fn begin(
        &self,
        caller: &ScopedClient,
        session: &SessionRef,
        provider: &str,
    ) -> Result<AuthorizationRequest, CredentialError> {
        let signer = self.signer()?;
        let provider = self.providers.get(provider)?;
        caller
            .api()
            .get_session(&session.namespace, &session.name)
            .await?;

        let state = signer.sign(&StatePayload::new(
            provider.kind.as_str(),
            &session.namespace,
            &session.name,
        ))?;
        let url = self.providers.authorization_url(provider, &state)?;
        tracing::info!(session = %session, provider = %provider.kind, "OAuth flow started");
        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
        })
    }

    /// Handle the provider's redirect.
    pub async fn complete(
        &self,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, CredentialError> {
        if let Some(error) = params.error.as_deref().filter(|e| !e.is_empty()) {
            tracing::info!(error, "OAuth provider returned an error");
            return Ok(CallbackOutcome::ProviderDenied {
                error: error.to_string(),
                description: params.error_description.clone(),
            });
        }
        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CredentialError::InvalidInput("missing authorization code".into()))?;
        let state = params
            .state
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CredentialError::Tamper("missing state".into()))?;

        let payload = match self.signer()?.verify(state) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, security_event = true, "OAuth state rejected");
                return Err(e.into());
            }
        };
        if payload.project_name.is_empty() || payload.session_name.is_empty() {
            return Err(CredentialError::InvalidInput("state carries no session".into()));
        }
        let session_ref = SessionRef::new(&payload.project_name, &payload.session_name);
        let provider = self.providers.get(&payload.provider)?;

        let session = self
            .platform
            .get_session(&session_ref.namespace, &session_ref.name)
            .await?;

        let tokens = self.providers.exchange_code(provider, code).await?;

        let expires_in = tokens.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let credential = StoredOAuthCredential {
            token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone().unwrap_or_default(),
            token_uri: provider.token_url.clone(),
            client_id: provider.client_id.clone(),
            client_secret: secrecy::ExposeSecret::expose_secret(&provider.client_secret)
                .to_string(),
            scopes: provider.scopes.clone(),
            expiry: StoredOAuthCredential::format_expiry(
                Utc::now() + chrono::Duration::seconds(expires_in),
            ),
        };

        let secret = SecretRef::new(
            session_ref.namespace.as_str(),
            oauth_secret_name(&session_ref.name, provider.kind),
        );
        let labels = BTreeMap::from([
            ("app".to_string(), "ambient-code".to_string()),
            ("ambient-code.io/session".to_string(), session_ref.name.clone()),
            ("ambient-code.io/provider".to_string(), provider.kind.to_string()),
            ("ambient-code.io/oauth".to_string(), "true".to_string()),
        ]);
        self.store
            .write_oauth(&secret, &session.owner_reference(), &labels, &credential)
            .await?;

        tracing::info!(session = %session_ref, provider = %provider.kind, "OAuth credentials stored");
        Ok(CallbackOutcome::Stored {
            session: session_ref,
            provider: provider.kind,
            secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;

    use super::*;
    use crate::cluster::memory::MemoryCluster;

    fn flow(cluster: &MemoryCluster, signer: Option<StateSigner>) -> OAuthFlow {
        OAuthFlow::new(
            signer,
            ProviderRegistry::new("http://localhost/oauth2callback", Duration::from_secs(10)),
            Arc::new(cluster.clone()),
        )
    }

    #[test]
    fn test_secret_name() {
        assert_eq!(oauth_secret_name("s1", ProviderKind::Google), "s1-google-oauth");
    }

    #[tokio::test]
    async fn test_provider_error_is_reported_not_stored() {
        let cluster = MemoryCluster::new();
        let outcome = flow(&cluster, None)
            .complete(&CallbackParams {
                error: Some("access_denied".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(matches!(outcome, CallbackOutcome::ProviderDenied { .. }));
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_state_is_tamper() {
        let cluster = MemoryCluster::new();
        let signer = StateSigner::new(SecretString::from("k".to_string()));
        let err = flow(&cluster, Some(signer))
            .complete(&CallbackParams {
                code: Some("code".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Tamper(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_secret_is_internal() {
        let cluster = MemoryCluster::new();
        let err = flow(&cluster, None)
            .complete(&CallbackParams {
                code: Some("code".into()),
                state: Some("a.b".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Internal(_)));
    }
}
