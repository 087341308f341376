//! Typed view of the session custom resource.
//!
//! The resource is owned by an external reconciler, so fields this crate
//! never touches round-trip untouched through the `extra` maps.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cluster::OwnerReference;

/// Annotation naming the session's machine identity.
pub const ANNOTATION_IDENTITY: &str = "ambient-code.io/runner-sa";
/// Annotation naming the secret that holds the session credential.
pub const ANNOTATION_CREDENTIAL_SECRET: &str = "ambient-code.io/runner-token-secret";
/// Lineage annotation stamped when a terminal session is continued.
pub const ANNOTATION_PARENT_SESSION: &str = "vteam.ambient-code/parent-session-id";

/// `(namespace, name)` address of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionRef {
    pub namespace: String,
    pub name: String,
}

impl SessionRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lifecycle phase reported in the session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Pending,
    Creating,
    Running,
    Completed,
    Failed,
    Stopped,
    Error,
}

impl SessionPhase {
    /// Terminal phases end a session; starting one again is a continuation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Creating => "Creating",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Creating" => Ok(Self::Creating),
            "Running" => Ok(Self::Running),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            "Stopped" => Ok(Self::Stopped),
            "Error" => Ok(Self::Error),
            other => Err(format!("unknown session phase '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_context: Option<UserContext>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A session resource as read from the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SessionSpec,
    #[serde(default)]
    pub status: SessionStatus,
}

impl Session {
    pub fn session_ref(&self) -> SessionRef {
        SessionRef::new(&self.metadata.namespace, &self.metadata.name)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Identity name recorded by the last successful provisioning.
    pub fn identity_name(&self) -> Option<&str> {
        self.annotation(ANNOTATION_IDENTITY)
    }

    pub fn credential_secret(&self) -> Option<&str> {
        self.annotation(ANNOTATION_CREDENTIAL_SECRET)
    }

    pub fn parent_session_id(&self) -> Option<&str> {
        self.annotation(ANNOTATION_PARENT_SESSION)
    }

    pub fn set_parent_session_id(&mut self, parent: &str) {
        self.metadata
            .annotations
            .insert(ANNOTATION_PARENT_SESSION.to_string(), parent.to_string());
    }

    /// Owning user, trimmed. `None` when absent or blank.
    pub fn user_id(&self) -> Option<&str> {
        self.spec
            .user_context
            .as_ref()
            .and_then(|ctx| ctx.user_id.as_deref())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Parsed phase. Unknown or missing phases read as `None`.
    pub fn phase(&self) -> Option<SessionPhase> {
        self.status.phase.as_deref().and_then(|p| p.parse().ok())
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_some_and(|p| p.is_terminal())
    }

    pub fn is_interactive(&self) -> bool {
        self.spec.interactive.unwrap_or(false)
    }

    pub fn set_interactive(&mut self, interactive: bool) {
        self.spec.interactive = Some(interactive);
    }

    /// Compute job backing this session: the name the reconciler recorded,
    /// or `{name}-job`.
    pub fn job_name(&self) -> String {
        match self.status.job_name.as_deref().map(str::trim) {
            Some(job) if !job.is_empty() => job.to_string(),
            _ => format!("{}-job", self.metadata.name),
        }
    }

    pub fn set_phase(&mut self, phase: SessionPhase, message: &str) {
        self.status.phase = Some(phase.as_str().to_string());
        self.status.message = Some(message.to_string());
    }

    /// Owner link for objects whose lifetime is bound to this session.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            controller: Some(true),
        }
    }
}
