//! Error types for sessiongate.
//!
//! `CredentialError` is the taxonomy every public operation returns. The
//! narrower enums (`ClusterError`, `StateError`, `OAuthError`) describe a
//! single seam and convert into it.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Errors from the cluster API seam.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Conflict writing {kind} {name}: object was modified")]
    Conflict { kind: &'static str, name: String },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Unauthorized: credential rejected by the cluster")]
    Unauthorized,

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Cluster API returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// OAuth state token verification failures.
///
/// Every variant except `NotConfigured` is a tamper or replay signal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("state token must be '<payload>.<signature>'")]
    Malformed,

    #[error("state token {part} is not valid base64url")]
    Encoding { part: &'static str },

    #[error("state signature mismatch")]
    BadSignature,

    #[error("state token expired (age {age_secs}s)")]
    Expired { age_secs: i64 },

    #[error("state token timestamp is in the future")]
    FutureTimestamp,

    #[error("state payload is not valid: {0}")]
    Payload(String),

    #[error("OAuth state secret is not configured")]
    NotConfigured,
}

/// Errors talking to third-party OAuth providers.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("Unsupported OAuth provider: {0}")]
    UnsupportedProvider(String),

    #[error("{0} OAuth is not configured")]
    NotConfigured(String),

    #[error("Token exchange with {provider} failed with status {status}: {detail}")]
    ExchangeFailed {
        provider: String,
        status: u16,
        detail: String,
    },

    #[error("Token exchange with {provider} timed out")]
    Timeout { provider: String },

    #[error("Invalid token response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// The error taxonomy shared by every credential operation.
///
/// The `String` payloads are diagnostic detail for logs. Responses for the
/// security variants never include them.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Tamper or replay detected: {0}")]
    Tamper(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CredentialError {
    /// Operational failures a caller may retry. Security rejections are never
    /// retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::UpstreamUnavailable(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::Tamper(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body text safe to show a caller.
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthenticated(_) => "unauthenticated".to_string(),
            Self::Forbidden(_) => "forbidden".to_string(),
            Self::Tamper(_) => "invalid or expired state".to_string(),
            Self::NotFound(what) => format!("{what} not found"),
            Self::Conflict(_) => "conflict, retry the request".to_string(),
            Self::UpstreamUnavailable(_) => "upstream unavailable, retry later".to_string(),
            Self::InvalidInput(msg) => msg.clone(),
            Self::Internal(_) => "internal error".to_string(),
        }
    }
}

impl From<ClusterError> for CredentialError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NotFound { kind, name } => Self::NotFound(format!("{kind} {name}")),
            ClusterError::Conflict { .. } | ClusterError::AlreadyExists { .. } => {
                Self::Conflict(e.to_string())
            }
            ClusterError::Forbidden { reason } => Self::Forbidden(reason),
            ClusterError::Unauthorized => Self::Unauthenticated(e.to_string()),
            ClusterError::Timeout { .. } | ClusterError::Transport(_) => {
                Self::UpstreamUnavailable(e.to_string())
            }
            ClusterError::Api { status, .. } if status >= 500 => {
                Self::UpstreamUnavailable(e.to_string())
            }
            ClusterError::Api { .. } => Self::Internal(e.to_string()),
        }
    }
}

impl From<StateError> for CredentialError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotConfigured => Self::Internal(e.to_string()),
            other => Self::Tamper(other.to_string()),
        }
    }
}

impl From<OAuthError> for CredentialError {
    fn from(e: OAuthError) -> Self {
        match e {
            OAuthError::UnsupportedProvider(_) => Self::InvalidInput(e.to_string()),
            OAuthError::NotConfigured(_) => Self::UpstreamUnavailable(e.to_string()),
            other => Self::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl IntoResponse for CredentialError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::Internal(_) => tracing::error!(error = %self, "Internal error"),
            Self::Tamper(_) | Self::Forbidden(_) => {
                tracing::warn!(error = %self, security_event = true, "Request rejected")
            }
            _ => tracing::debug!(error = %self, "Request failed"),
        }
        let body = serde_json::json!({ "error": self.public_message() });
        (status, axum::Json(body)).into_response()
    }
}
