//! HTTP routes.
//!
//! User routes sit behind a middleware that resolves the caller's
//! request-scoped client; a request without credentials never reaches a
//! handler. The runner verification endpoint authenticates with the runner's
//! own bearer, and the OAuth callback is public and protected by the signed
//! state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Extension, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::error::CredentialError;
use crate::lifecycle::{LifecycleController, StopOutcome};
use crate::oauth::{CallbackOutcome, CallbackParams, OAuthFlow};
use crate::resolver::{ClientResolver, ScopedClient};
use crate::session::SessionRef;
use crate::verify::{TokenVerifier, bearer_from_header};

/// Header carrying the user's token when an auth proxy sits in front.
pub const FORWARDED_TOKEN_HEADER: &str = "x-forwarded-access-token";

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<ClientResolver>,
    pub verifier: Arc<TokenVerifier>,
    pub lifecycle: Arc<LifecycleController>,
    pub oauth: Arc<OAuthFlow>,
}

pub fn router(state: AppState) -> Router {
    let user_routes = Router::new()
        .route(
            "/api/projects/{project}/sessions/{session}/start",
            post(start_session),
        )
        .route(
            "/api/projects/{project}/sessions/{session}/stop",
            post(stop_session),
        )
        .route(
            "/api/projects/{project}/sessions/{session}/oauth/{provider}/url",
            get(oauth_url),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            scoped_client_middleware,
        ));

    Router::new()
        .merge(user_routes)
        .route(
            "/api/projects/{project}/sessions/{session}/runner/verify",
            post(verify_runner),
        )
        .route("/oauth2callback", get(oauth_callback))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn scoped_client_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let headers = req.headers();
    let client = state.resolver.resolve(
        header_str(headers, header::AUTHORIZATION),
        header_str(headers, FORWARDED_TOKEN_HEADER),
    );
    match client {
        Some(client) => {
            req.extensions_mut().insert(client);
            next.run(req).await
        }
        None => CredentialError::Unauthenticated("no user credentials on request".into())
            .into_response(),
    }
}

// -- Handlers --

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransitionResponse {
    message: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    continuation: Option<bool>,
}

async fn start_session(
    State(state): State<AppState>,
    Extension(client): Extension<ScopedClient>,
    Path((project, session)): Path<(String, String)>,
) -> Result<(StatusCode, Json<TransitionResponse>), CredentialError> {
    let session_ref = SessionRef::new(project, session);
    let outcome = state.lifecycle.start(client.api(), &session_ref).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TransitionResponse {
            message: crate::lifecycle::RESTART_MESSAGE.to_string(),
            name: session_ref.name,
            phase: outcome.session.status.phase,
            continuation: Some(outcome.continuation),
        }),
    ))
}

async fn stop_session(
    State(state): State<AppState>,
    Extension(client): Extension<ScopedClient>,
    Path((project, session)): Path<(String, String)>,
) -> Result<Json<TransitionResponse>, CredentialError> {
    let session_ref = SessionRef::new(project, session);
    let (message, phase) = match state.lifecycle.stop(client.api(), &session_ref).await? {
        StopOutcome::Stopped(s) => (crate::lifecycle::STOP_MESSAGE, s.status.phase),
        StopOutcome::AlreadyStopped(s) => ("Session already stopped", s.status.phase),
        StopOutcome::Gone => ("Session no longer exists", None),
    };
    Ok(Json(TransitionResponse {
        message: message.to_string(),
        name: session_ref.name,
        phase,
        continuation: None,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    user_id: String,
    identity: String,
}

async fn verify_runner(
    State(state): State<AppState>,
    Path((project, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<VerifyResponse>, CredentialError> {
    let token = header_str(&headers, header::AUTHORIZATION)
        .and_then(bearer_from_header)
        .ok_or_else(|| CredentialError::Unauthenticated("missing bearer token".into()))?;
    let runner = state
        .verifier
        .verify_inbound(token, &SessionRef::new(project, session))
        .await?;
    Ok(Json(VerifyResponse {
        user_id: runner.user_id,
        identity: runner.identity_name,
    }))
}

#[derive(Serialize)]
struct OAuthUrlResponse {
    url: String,
    state: String,
}

async fn oauth_url(
    State(state): State<AppState>,
    Extension(client): Extension<ScopedClient>,
    Path((project, session, provider)): Path<(String, String, String)>,
) -> Result<Json<OAuthUrlResponse>, CredentialError> {
    let request = state
        .oauth
        .begin(&client, &SessionRef::new(project, session), &provider)
        .await?;
    Ok(Json(OAuthUrlResponse {
        url: request.url,
        state: request.state,
    }))
}

fn callback_page(status: StatusCode, title: &str, body: &str) -> Response {
    let page = format!(
        "<!doctype html><html><head><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{body}</p><p>You can close this window.</p></body></html>"
    );
    (status, Html(page)).into_response()
}

async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    match state.oauth.complete(&params).await {
        Ok(CallbackOutcome::Stored { provider, .. }) => callback_page(
            StatusCode::OK,
            "Authorization complete",
            &format!("Your {provider} account is connected to the session."),
        ),
        Ok(CallbackOutcome::ProviderDenied { .. }) => callback_page(
            StatusCode::BAD_REQUEST,
            "Authorization failed",
            "The provider did not grant access.",
        ),
        Err(e) => {
            let status = e.status_code();
            if matches!(e, CredentialError::Tamper(_)) {
                tracing::warn!(error = %e, security_event = true, "OAuth callback rejected");
            } else {
                tracing::warn!(error = %e, "OAuth callback failed");
            }
            callback_page(status, "Authorization failed", &e.public_message())
        }
    }
}
