//! Third-party OAuth providers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::config::{OAuthClientCredentials, OAuthConfig};
use crate::error::OAuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Google,
    Github,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Github => "github",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = OAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "github" => Ok(Self::Github),
            other => Err(OAuthError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// A configured provider.
#[derive(Clone)]
pub struct OAuthProvider {
    pub kind: ProviderKind,
    pub client_id: String,
    pub client_secret: SecretString,
    pub authorize_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    /// Extra query parameters on the authorization URL.
    pub authorize_params: Vec<(&'static str, &'static str)>,
}

impl fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthProvider")
            .field("kind", &self.kind)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

impl OAuthProvider {
    pub fn google(creds: &OAuthClientCredentials) -> Self {
        Self {
            kind: ProviderKind::Google,
            client_id: creds.client_id.clone(),
            client_secret: creds.client_secret.clone(),
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes: [
                "openid",
                "https://www.googleapis.com/auth/userinfo.email",
                "https://www.googleapis.com/auth/userinfo.profile",
                "https://www.googleapis.com/auth/drive",
                "https://www.googleapis.com/auth/drive.readonly",
                "https://www.googleapis.com/auth/drive.file",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            // A refresh token is only issued with offline access and a fresh consent.
            authorize_params: vec![("access_type", "offline"), ("prompt", "consent")],
        }
    }

    pub fn github(creds: &OAuthClientCredentials) -> Self {
        Self {
            kind: ProviderKind::Github,
            client_id: creds.client_id.clone(),
            client_secret: creds.client_secret.clone(),
            authorize_url: "https://github.com/login/oauth/authorize".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
            scopes: vec!["repo".to_string(), "user".to_string()],
            authorize_params: Vec::new(),
        }
    }

    /// Point the token exchange somewhere else.
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }
}

/// Token endpoint response.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Configured providers plus the shared redirect URI and HTTP client.
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, OAuthProvider>,
    redirect_uri: String,
    http: Client,
    timeout: Duration,
}

impl ProviderRegistry {
    pub fn new(redirect_uri: impl Into<String>, timeout: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            redirect_uri: redirect_uri.into(),
            http: Client::new(),
            timeout,
        }
    }

    pub fn from_config(config: &OAuthConfig) -> Self {
        let mut registry = Self::new(config.redirect_uri(), config.exchange_timeout);
        if let Some(creds) = &config.google {
            registry.register(OAuthProvider::google(creds));
        }
        if let Some(creds) = &config.github {
            registry.register(OAuthProvider::github(creds));
        }
        registry
    }

    pub fn register(&mut self, provider: OAuthProvider) {
        self.providers.insert(provider.kind, provider);
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn get(&self, name: &str) -> Result<&OAuthProvider, OAuthError> {
        let kind: ProviderKind = name.parse()?;
        self.providers
            .get(&kind)
            .ok_or_else(|| OAuthError::NotConfigured(kind.to_string()))
    }

    /// URL the user is sent to, carrying `state`.
    pub fn authorization_url(&self, provider: &OAuthProvider, state: &str) -> Result<Url, OAuthError> {
        let mut url = Url::parse(&provider.authorize_url).map_err(|e| {
            OAuthError::InvalidResponse {
                provider: provider.kind.to_string(),
                reason: format!("bad authorize URL: {e}"),
            }
        })?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &provider.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &provider.scopes.join(" "))
                .append_pair("state", state);
            for (k, v) in &provider.authorize_params {
                query.append_pair(k, v);
            }
        }
        Ok(url)
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        provider: &OAuthProvider,
        code: &str,
    ) -> Result<TokenResponse, OAuthError> {
        let name = provider.kind.to_string();
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.expose_secret()),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];

        let response = self
            .http
            .post(&provider.token_url)
            .header("Accept", "application/json")
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OAuthError::Timeout {
                        provider: name.clone(),
                    }
                } else {
                    OAuthError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            tracing::warn!(provider = %name, status = status.as_u16(), "OAuth token exchange rejected");
            return Err(OAuthError::ExchangeFailed {
                provider: name,
                status: status.as_u16(),
                detail,
            });
        }

        let tokens: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| OAuthError::InvalidResponse {
                    provider: name.clone(),
                    reason: e.to_string(),
                })?;
        // GitHub reports errors with a 200 status.
        if let Some(error) = &tokens.error {
            return Err(OAuthError::ExchangeFailed {
                provider: name,
                status: status.as_u16(),
                detail: tokens
                    .error_description
                    .clone()
                    .unwrap_or_else(|| error.clone()),
            });
        }
        if tokens.access_token.is_empty() {
            return Err(OAuthError::InvalidResponse {
                provider: name,
                reason: "no access token in response".to_string(),
            });
        }
        Ok(tokens)
    }
}
