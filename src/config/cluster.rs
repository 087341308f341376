use std::path::PathBuf;
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Group/version/plural of the session custom resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResource {
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl Default for SessionResource {
    fn default() -> Self {
        Self {
            group: "vteam.ambient-code".to_string(),
            version: "v1alpha1".to_string(),
            plural: "agenticsessions".to_string(),
        }
    }
}

impl SessionResource {
    /// `apiVersion` value written on owner references.
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

/// Connection settings for the cluster API.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Base URL of the cluster API server.
    pub api_url: String,
    /// Token file for the platform's own (elevated) identity.
    pub token_file: PathBuf,
    /// PEM bundle used to verify the API server certificate.
    pub ca_file: Option<PathBuf>,
    /// Per-call timeout. Cluster calls are expected to answer in single-digit seconds.
    pub timeout: Duration,
    pub session_resource: SessionResource,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            token_file: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            ca_file: None,
            timeout: Duration::from_secs(5),
            session_resource: SessionResource::default(),
        }
    }
}

impl ClusterConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let timeout_secs: u64 = parse_optional_env("CLUSTER_API_TIMEOUT_SECS", 5)?;
        if timeout_secs == 0 || timeout_secs > 9 {
            return Err(ConfigError::InvalidValue {
                key: "CLUSTER_API_TIMEOUT_SECS".to_string(),
                message: format!("must be between 1 and 9 seconds, got {timeout_secs}"),
            });
        }

        Ok(Self {
            api_url: parse_string_env("CLUSTER_API_URL", &defaults.api_url)?,
            token_file: optional_env("CLUSTER_TOKEN_FILE")?
                .map(PathBuf::from)
                .unwrap_or(defaults.token_file),
            ca_file: optional_env("CLUSTER_CA_FILE")?.map(PathBuf::from),
            timeout: Duration::from_secs(timeout_secs),
            session_resource: SessionResource {
                group: parse_string_env("SESSION_RESOURCE_GROUP", &defaults.session_resource.group)?,
                version: parse_string_env(
                    "SESSION_RESOURCE_VERSION",
                    &defaults.session_resource.version,
                )?,
                plural: parse_string_env(
                    "SESSION_RESOURCE_PLURAL",
                    &defaults.session_resource.plural,
                )?,
            },
        })
    }
}
