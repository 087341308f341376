//! Inbound runner token verification.
//!
//! A runner proves which session it belongs to by presenting the credential
//! provisioned for that session. Verification fails closed: every check that
//! cannot positively confirm the binding rejects the request.

use std::sync::Arc;

use crate::cluster::ClusterApi;
use crate::error::CredentialError;
use crate::session::SessionRef;

const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// The authenticated principal behind a runner request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRunner {
    pub session: SessionRef,
    pub identity_name: String,
    /// User the session acts for.
    pub user_id: String,
}

/// Split a service-account subject into `(namespace, identity)`.
pub fn parse_identity_subject(subject: &str) -> Option<(&str, &str)> {
    let rest = subject.strip_prefix(SERVICE_ACCOUNT_PREFIX)?;
    let (namespace, name) = rest.split_once(':')?;
    if namespace.is_empty() || name.is_empty() || name.contains(':') {
        return None;
    }
    Some((namespace, name))
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_from_header(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Checks that a bearer token belongs to the identity recorded on a session.
pub struct TokenVerifier {
    /// Platform client; introspection and the session read are trusted lookups.
    cluster: Arc<dyn ClusterApi>,
}

impl TokenVerifier {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    pub async fn verify_inbound(
        &self,
        token: &str,
        session: &SessionRef,
    ) -> Result<VerifiedRunner, CredentialError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(CredentialError::Unauthenticated("missing bearer token".into()));
        }

        let review = self.cluster.review_token(token).await?;
        if !review.authenticated || review.error.is_some() {
            tracing::warn!(
                session = %session,
                error = review.error.as_deref().unwrap_or(""),
                security_event = true,
                "Runner token not authenticated"
            );
            return Err(CredentialError::Unauthenticated("token review rejected token".into()));
        }

        let subject = review.username.unwrap_or_default();
        let Some((namespace, identity)) = parse_identity_subject(&subject) else {
            tracing::warn!(session = %session, subject = %subject, security_event = true, "Runner token is not a session identity");
            return Err(CredentialError::Forbidden("subject is not a service account".into()));
        };

        if namespace != session.namespace {
            tracing::warn!(
                session = %session,
                token_namespace = namespace,
                security_event = true,
                "Runner token namespace mismatch"
            );
            return Err(CredentialError::Forbidden(format!(
                "namespace mismatch: {namespace} != {}",
                session.namespace
            )));
        }

        let record = self
            .cluster
            .get_session(&session.namespace, &session.name)
            .await?;

        let Some(expected) = record.identity_name() else {
            tracing::warn!(session = %session, security_event = true, "Session has no recorded identity");
            return Err(CredentialError::Forbidden("session has no recorded identity".into()));
        };
        if expected != identity {
            tracing::warn!(
                session = %session,
                token_identity = identity,
                security_event = true,
                "Runner token identity does not match session"
            );
            return Err(CredentialError::Forbidden(format!(
                "identity mismatch: {identity} != {expected}"
            )));
        }

        let Some(user_id) = record.user_id() else {
            return Err(CredentialError::InvalidInput("session missing user context".into()));
        };

        Ok(VerifiedRunner {
            session: session.clone(),
            identity_name: identity.to_string(),
            user_id: user_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_subject() {
        assert_eq!(
            parse_identity_subject("system:serviceaccount:proj-a:id-s1"),
            Some(("proj-a", "id-s1"))
        );
        assert_eq!(parse_identity_subject("system:serviceaccount:proj-a"), None);
        assert_eq!(parse_identity_subject("system:serviceaccount::id-s1"), None);
        assert_eq!(parse_identity_subject("system:serviceaccount:a:b:c"), None);
        assert_eq!(parse_identity_subject("alice@example.com"), None);
    }

    #[test]
    fn test_bearer_from_header() {
        assert_eq!(bearer_from_header("Bearer abc"), Some("abc"));
        assert_eq!(bearer_from_header("bearer  abc "), Some("abc"));
        assert_eq!(bearer_from_header("Basic abc"), None);
        assert_eq!(bearer_from_header("Bearer "), None);
        assert_eq!(bearer_from_header("abc"), None);
    }
}
