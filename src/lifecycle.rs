//! Session start, stop and continuation.
//!
//! Transitions are driven with the caller's request-scoped client, so a user
//! can only start or stop sessions they are allowed to modify. Credential
//! rotation on continuation goes through the provisioner, which holds the
//! platform identity.
//!
//! There is no lock between Start and Stop. Each transition reads the phase
//! immediately before mutating and deletes are idempotent. Status writes carry
//! the resourceVersion of the last read; on a conflict the session is re-read
//! and the phase change reapplied.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};

use crate::cluster::{ClusterApi, Propagation};
use crate::error::{ClusterError, CredentialError};
use crate::provision::{IdentityProvisioner, IssuedCredential};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::session::{Session, SessionPhase, SessionRef};

pub const RESTART_MESSAGE: &str = "Session restart requested";
pub const STOP_MESSAGE: &str = "Session stopped by user";

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug)]
pub struct StartOutcome {
    pub session: Session,
    /// The session was terminal and has been continued.
    pub continuation: bool,
    /// Set when a continuation rotated the credential.
    pub credential: Option<IssuedCredential>,
}

#[derive(Debug)]
pub enum StopOutcome {
    Stopped(Session),
    /// Already stopped; nothing changed.
    AlreadyStopped(Session),
    /// The session disappeared while stopping.
    Gone,
}

pub struct LifecycleController {
    provisioner: Arc<IdentityProvisioner>,
    policy: RetryPolicy,
}

impl LifecycleController {
    pub fn new(provisioner: Arc<IdentityProvisioner>) -> Self {
        Self {
            provisioner,
            policy: RetryPolicy::new(3, Duration::from_millis(50), Duration::from_millis(500)),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Move the session back to Pending. A terminal session is continued:
    /// it is switched to interactive, its lineage is stamped, its credential
    /// rotated and its old compute job deleted.
    pub async fn start(
        &self,
        client: &dyn ClusterApi,
        session_ref: &SessionRef,
    ) -> Result<StartOutcome, CredentialError> {
        let mut session = client
            .get_session(&session_ref.namespace, &session_ref.name)
            .await?;
        let continuation = session.is_terminal();
        let mut credential = None;

        if continuation {
            tracing::info!(
                session = %session_ref,
                phase = session.status.phase.as_deref().unwrap_or(""),
                "Continuing terminal session"
            );
            session.set_parent_session_id(&session_ref.name);
            if !session.is_interactive() {
                session.set_interactive(true);
            }
            client.update_session(&session).await?;

            credential = self.provisioner.provision_best_effort(session_ref).await;
            if credential.is_some() {
                let job = session.job_name();
                match client
                    .delete_job(&session_ref.namespace, &job, Propagation::Background)
                    .await
                {
                    Ok(()) => tracing::info!(session = %session_ref, job = %job, "Deleted previous job"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        tracing::warn!(session = %session_ref, job = %job, error = %e, "Failed to delete previous job")
                    }
                }
            }

            // Provisioning patched annotations; work from the current object.
            session = client
                .get_session(&session_ref.namespace, &session_ref.name)
                .await?;
        }

        let started = now_rfc3339();
        let session = self
            .write_status(client, session_ref, session, |s| {
                s.set_phase(SessionPhase::Pending, RESTART_MESSAGE);
                s.status.completion_time = None;
                s.status.start_time = Some(started.clone());
            })
            .await?;

        tracing::info!(session = %session_ref, continuation, "Session start requested");
        Ok(StartOutcome {
            session,
            continuation,
            credential,
        })
    }

    /// Stop a running session and tear down its compute job.
    ///
    /// Stopping an already-stopped session succeeds without changes. Other
    /// terminal phases are rejected.
    pub async fn stop(
        &self,
        client: &dyn ClusterApi,
        session_ref: &SessionRef,
    ) -> Result<StopOutcome, CredentialError> {
        let SessionRef { namespace, name } = session_ref;
        let mut session = client.get_session(namespace, name).await?;

        match session.phase() {
            Some(SessionPhase::Stopped) => {
                tracing::debug!(session = %session_ref, "Session already stopped");
                return Ok(StopOutcome::AlreadyStopped(session));
            }
            Some(phase) if phase.is_terminal() => {
                return Err(CredentialError::InvalidInput(format!(
                    "cannot stop session in {phase} state"
                )));
            }
            _ => {}
        }

        let job = session.job_name();
        log_cleanup(
            session_ref,
            "job",
            &job,
            client.delete_job(namespace, &job, Propagation::Foreground).await,
        );
        for selector in [format!("job-name={job}"), format!("agentic-session={name}")] {
            log_cleanup(
                session_ref,
                "pods",
                &selector,
                client.delete_pods(namespace, &selector).await,
            );
        }

        if !session.is_interactive() {
            session.set_interactive(true);
            match client.update_session(&session).await {
                Ok(updated) => session = updated,
                Err(e) => {
                    tracing::warn!(session = %session_ref, error = %e, "Failed to mark session interactive")
                }
            }
        }

        let completed = now_rfc3339();
        let written = self
            .write_status(client, session_ref, session, |s| {
                s.set_phase(SessionPhase::Stopped, STOP_MESSAGE);
                s.status.completion_time = Some(completed.clone());
            })
            .await;
        match written {
            Ok(updated) => {
                tracing::info!(session = %session_ref, job = %job, "Session stopped");
                Ok(StopOutcome::Stopped(updated))
            }
            Err(e) if e.is_not_found() => {
                tracing::info!(session = %session_ref, "Session deleted while stopping");
                Ok(StopOutcome::Gone)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply `change` to the session and write its status, starting from
    /// `current`. A conflicting write re-reads the session and tries again.
    async fn write_status(
        &self,
        client: &dyn ClusterApi,
        session_ref: &SessionRef,
        current: Session,
        change: impl Fn(&mut Session) + Sync,
    ) -> Result<Session, ClusterError> {
        let current = &current;
        let change = &change;
        retry_with_backoff(
            &self.policy,
            std::future::pending::<()>(),
            ClusterError::is_conflict,
            |attempt| async move {
                let mut session = if attempt == 0 {
                    current.clone()
                } else {
                    tracing::debug!(session = %session_ref, attempt, "Re-reading after conflict");
                    client
                        .get_session(&session_ref.namespace, &session_ref.name)
                        .await?
                };
                change(&mut session);
                client.update_session_status(&session).await
            },
        )
        .await
        .map_err(|e| {
            e.into_inner(|attempts| ClusterError::Conflict {
                kind: "AgenticSession",
                name: format!("{session_ref} (cancelled after {attempts} attempts)"),
            })
        })
    }
}

fn log_cleanup(session: &SessionRef, what: &str, target: &str, result: Result<(), ClusterError>) {
    match result {
        Ok(()) => tracing::debug!(session = %session, what, target, "Deleted"),
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            tracing::warn!(session = %session, what, target, error = %e, "Cleanup failed, continuing")
        }
    }
}
