use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Client id/secret pair registered with a third-party provider.
#[derive(Debug, Clone)]
pub struct OAuthClientCredentials {
    pub client_id: String,
    pub client_secret: SecretString,
}

/// OAuth callback configuration.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// HMAC key for state tokens. `None` disables the OAuth flow.
    pub state_secret: Option<SecretString>,
    /// Public base URL of this service; the redirect URI is `{backend_url}/oauth2callback`.
    pub backend_url: String,
    pub google: Option<OAuthClientCredentials>,
    pub github: Option<OAuthClientCredentials>,
    /// Timeout for the cross-network code exchange.
    pub exchange_timeout: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_secret: None,
            backend_url: "http://localhost:8080".to_string(),
            google: None,
            github: None,
            exchange_timeout: Duration::from_secs(15),
        }
    }
}

impl OAuthConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let exchange_secs: u64 = parse_optional_env("OAUTH_EXCHANGE_TIMEOUT_SECS", 15)?;

        Ok(Self {
            state_secret: optional_env("OAUTH_STATE_SECRET")?.map(SecretString::from),
            backend_url: parse_string_env("BACKEND_URL", "http://localhost:8080")?
                .trim_end_matches('/')
                .to_string(),
            google: client_pair("GOOGLE_OAUTH_CLIENT_ID", "GOOGLE_OAUTH_CLIENT_SECRET")?,
            github: client_pair("GITHUB_CLIENT_ID", "GITHUB_CLIENT_SECRET")?,
            exchange_timeout: Duration::from_secs(exchange_secs.clamp(10, 30)),
        })
    }

    /// Redirect URI registered with every provider.
    pub fn redirect_uri(&self) -> String {
        format!("{}/oauth2callback", self.backend_url)
    }
}

/// Both halves must be present for a provider to count as configured.
fn client_pair(
    id_key: &str,
    secret_key: &str,
) -> Result<Option<OAuthClientCredentials>, ConfigError> {
    match (optional_env(id_key)?, optional_env(secret_key)?) {
        (Some(client_id), Some(secret)) => Ok(Some(OAuthClientCredentials {
            client_id,
            client_secret: SecretString::from(secret),
        })),
        (Some(_), None) => Err(ConfigError::MissingRequired {
            key: secret_key.to_string(),
            hint: format!("{id_key} is set but its secret is not"),
        }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_uri() {
        let config = OAuthConfig {
            backend_url: "https://gate.example.com".to_string(),
            ..OAuthConfig::default()
        };
        assert_eq!(config.redirect_uri(), "https://gate.example.com/oauth2callback");
    }
}
