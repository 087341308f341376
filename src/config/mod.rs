//! Configuration for sessiongate.
//!
//! Everything comes from env vars. `.env` in the working directory is loaded
//! first via dotenvy, which never overwrites variables already set.

mod cluster;
pub(crate) mod helpers;
mod oauth;

use std::time::Duration;

use crate::config::helpers::{parse_bool_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

pub use self::cluster::{ClusterConfig, SessionResource};
pub use self::oauth::{OAuthClientCredentials, OAuthConfig};

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl ApiConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            host: parse_string_env("API_HOST", "0.0.0.0")?,
            port: parse_optional_env("API_PORT", 8080)?,
        })
    }
}

/// Identity provisioning settings.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Lifetime requested for each minted runner credential.
    pub token_ttl: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(3600),
        }
    }
}

impl ProvisionConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let ttl: u64 = parse_optional_env("RUNNER_TOKEN_TTL_SECS", 3600)?;
        // The cluster refuses token requests shorter than ten minutes.
        if ttl < 600 {
            return Err(ConfigError::InvalidValue {
                key: "RUNNER_TOKEN_TTL_SECS".to_string(),
                message: format!("must be at least 600, got {ttl}"),
            });
        }
        Ok(Self {
            token_ttl: Duration::from_secs(ttl),
        })
    }
}

/// Best-effort access-key telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Stamp last-used time on access-key identities seen by the resolver.
    pub stamp_access_keys: bool,
    pub stamp_timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            stamp_access_keys: true,
            stamp_timeout: Duration::from_secs(3),
        }
    }
}

impl TelemetryConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            stamp_access_keys: parse_bool_env("ACCESS_KEY_STAMP_ENABLED", true)?,
            stamp_timeout: Duration::from_secs(parse_optional_env(
                "ACCESS_KEY_STAMP_TIMEOUT_SECS",
                3,
            )?),
        })
    }
}

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub cluster: ClusterConfig,
    pub provision: ProvisionConfig,
    pub oauth: OAuthConfig,
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from env vars (and `./.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let config = Self {
            api: ApiConfig::resolve()?,
            cluster: ClusterConfig::resolve()?,
            provision: ProvisionConfig::resolve()?,
            oauth: OAuthConfig::resolve()?,
            telemetry: TelemetryConfig::resolve()?,
        };

        if config.oauth.state_secret.is_none() {
            tracing::warn!("OAUTH_STATE_SECRET not set, OAuth callback flow is disabled");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_default_ttl() {
        assert_eq!(ProvisionConfig::default().token_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_session_resource_api_version() {
        assert_eq!(
            SessionResource::default().api_version(),
            "vteam.ambient-code/v1alpha1"
        );
    }
}
