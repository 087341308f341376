//! OAuth flow against a local token endpoint.
//!
//! The fake provider runs on an ephemeral port and records every exchange it
//! receives, so tests can assert that a rejected callback never reached it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{NaiveDateTime, Utc};
use secrecy::SecretString;
use serde_json::{Value, json};

use sessiongate::cluster::memory::MemoryCluster;
use sessiongate::cluster::{ClusterApi, PolicyRule};
use sessiongate::config::{OAuthClientCredentials, TelemetryConfig};
use sessiongate::error::CredentialError;
use sessiongate::oauth::{
    CallbackOutcome, CallbackParams, OAuthFlow, OAuthProvider, ProviderKind, ProviderRegistry,
    StateSigner,
};
use sessiongate::resolver::ClientResolver;
use sessiongate::session::{Session, SessionRef};
use sessiongate::store::{EXPIRY_FORMAT, OAUTH_CREDENTIALS_KEY, StoredOAuthCredential};

const STATE_SECRET: &str = "oauth-flow-secret";
const USER_TOKEN: &str = "alice-token";

// ---------------------------------------------------------------------------
// Fake token endpoint
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct FakeProvider {
    exchanges: Arc<Mutex<Vec<HashMap<String, String>>>>,
    reply: Arc<Mutex<(StatusCode, Value)>>,
}

impl FakeProvider {
    fn exchanges(&self) -> Vec<HashMap<String, String>> {
        self.exchanges.lock().unwrap().clone()
    }

    fn reply_with(&self, status: StatusCode, body: Value) {
        *self.reply.lock().unwrap() = (status, body);
    }
}

async fn token_endpoint(
    State(fake): State<FakeProvider>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    fake.exchanges.lock().unwrap().push(form);
    let (status, body) = fake.reply.lock().unwrap().clone();
    (status, Json(body))
}

async fn start_fake_provider() -> (FakeProvider, SocketAddr) {
    let fake = FakeProvider {
        exchanges: Arc::default(),
        reply: Arc::new(Mutex::new((
            StatusCode::OK,
            json!({
                "access_token": "ya29.access",
                "refresh_token": "1//refresh",
                "expires_in": 3599,
                "token_type": "Bearer"
            }),
        ))),
    };
    let app = Router::new()
        .route("/token", post(token_endpoint))
        .with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (fake, addr)
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    cluster: MemoryCluster,
    fake: FakeProvider,
    flow: OAuthFlow,
    resolver: ClientResolver,
}

async fn harness() -> Harness {
    let (fake, addr) = start_fake_provider().await;

    let cluster = MemoryCluster::new();
    cluster.register_token(USER_TOKEN, "alice");
    cluster.grant("alice", "proj-a", PolicyRule::new("*", "*", &["*"]));
    let session: Session = serde_json::from_value(json!({
        "metadata": { "name": "s1", "namespace": "proj-a" },
        "spec": { "userContext": { "userId": "alice" } },
        "status": { "phase": "Running" }
    }))
    .unwrap();
    cluster.insert_session(session);

    let mut providers =
        ProviderRegistry::new("http://localhost:8080/oauth2callback", Duration::from_secs(5));
    providers.register(
        OAuthProvider::google(&OAuthClientCredentials {
            client_id: "cid".into(),
            client_secret: SecretString::from("csecret".to_string()),
        })
        .with_token_url(format!("http://{addr}/token")),
    );

    let platform: Arc<dyn ClusterApi> = Arc::new(cluster.clone());
    Harness {
        flow: OAuthFlow::new(
            Some(StateSigner::new(SecretString::from(STATE_SECRET.to_string()))),
            providers,
            Arc::clone(&platform),
        ),
        resolver: ClientResolver::new(
            Arc::new(cluster.clone()),
            platform,
            TelemetryConfig::default(),
        ),
        cluster,
        fake,
    }
}

impl Harness {
    async fn begin(&self) -> String {
        let client = self
            .resolver
            .resolve(Some(&format!("Bearer {USER_TOKEN}")), None)
            .unwrap();
        self.flow
            .begin(&client, &SessionRef::new("proj-a", "s1"), "google")
            .await
            .unwrap()
            .state
    }

    async fn callback(&self, code: &str, state: &str) -> Result<CallbackOutcome, CredentialError> {
        self.flow
            .complete(&CallbackParams {
                code: Some(code.to_string()),
                state: Some(state.to_string()),
                ..Default::default()
            })
            .await
    }

    fn stored(&self) -> Option<StoredOAuthCredential> {
        let secret = self.cluster.secret("proj-a", "s1-google-oauth")?;
        Some(serde_json::from_slice(&secret.data[OAUTH_CREDENTIALS_KEY]).unwrap())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_callback_stores_credentials_for_session() {
    let h = harness().await;
    let state = h.begin().await;

    let outcome = h.callback("auth-code-1", &state).await.unwrap();
    let (session, provider) = match outcome {
        CallbackOutcome::Stored {
            session, provider, ..
        } => (session, provider),
        other => panic!("expected stored outcome, got {other:?}"),
    };
    assert_eq!(session, SessionRef::new("proj-a", "s1"));
    assert_eq!(provider, ProviderKind::Google);

    let exchanges = h.fake.exchanges();
    assert_eq!(exchanges.len(), 1);
    assert_eq!(exchanges[0]["code"], "auth-code-1");
    assert_eq!(exchanges[0]["grant_type"], "authorization_code");
    assert_eq!(exchanges[0]["redirect_uri"], "http://localhost:8080/oauth2callback");

    let secret = h.cluster.secret("proj-a", "s1-google-oauth").unwrap();
    let session_uid = h.cluster.session("proj-a", "s1").unwrap().metadata.uid;
    assert_eq!(secret.owner_references[0].uid, session_uid);
    assert_eq!(secret.labels["ambient-code.io/provider"], "google");
    assert_eq!(secret.data["access_token"], b"ya29.access");
    assert_eq!(secret.data["refresh_token"], b"1//refresh");

    let stored = h.stored().unwrap();
    assert_eq!(stored.token, "ya29.access");
    assert_eq!(stored.refresh_token, "1//refresh");
    assert_eq!(stored.client_id, "cid");
    assert_eq!(stored.client_secret, "csecret");
    assert!(stored.token_uri.ends_with("/token"));
    assert!(stored.scopes.iter().any(|s| s.ends_with("/drive")));

    let expiry = NaiveDateTime::parse_from_str(&stored.expiry, EXPIRY_FORMAT).unwrap();
    let remaining = expiry.and_utc() - Utc::now();
    assert!(remaining.num_seconds() > 3500 && remaining.num_seconds() <= 3600);
}

#[tokio::test]
async fn test_tampered_state_writes_nothing() {
    let h = harness().await;
    let state = h.begin().await;

    let mut tampered: Vec<char> = state.chars().collect();
    let last = tampered.len() - 1;
    tampered[last] = if tampered[last] == 'A' { 'B' } else { 'A' };
    let tampered: String = tampered.into_iter().collect();

    let err = h.callback("auth-code-1", &tampered).await.unwrap_err();
    assert!(matches!(err, CredentialError::Tamper(_)));
    assert!(h.fake.exchanges().is_empty());
    assert!(h.cluster.secrets_in("proj-a").is_empty());
}

#[tokio::test]
async fn test_state_from_other_secret_rejected() {
    let h = harness().await;
    let forged = StateSigner::new(SecretString::from("attacker".to_string()))
        .sign(&sessiongate::oauth::StatePayload::new("google", "proj-a", "s1"))
        .unwrap();

    let err = h.callback("auth-code-1", &forged).await.unwrap_err();
    assert!(matches!(err, CredentialError::Tamper(_)));
    assert!(h.fake.exchanges().is_empty());
}

#[tokio::test]
async fn test_provider_rejection_stores_nothing() {
    let h = harness().await;
    h.fake
        .reply_with(StatusCode::BAD_REQUEST, json!({ "error": "invalid_grant" }));
    let state = h.begin().await;

    let err = h.callback("stale-code", &state).await.unwrap_err();
    assert!(matches!(err, CredentialError::UpstreamUnavailable(_)));
    assert!(h.stored().is_none());
}

#[tokio::test]
async fn test_missing_refresh_token_and_lifetime() {
    let h = harness().await;
    h.fake
        .reply_with(StatusCode::OK, json!({ "access_token": "ya29.short" }));
    let state = h.begin().await;

    h.callback("auth-code-2", &state).await.unwrap();
    let secret = h.cluster.secret("proj-a", "s1-google-oauth").unwrap();
    assert_eq!(secret.data["refresh_token"], b"");

    let stored = h.stored().unwrap();
    assert_eq!(stored.refresh_token, "");
    let expiry = NaiveDateTime::parse_from_str(&stored.expiry, EXPIRY_FORMAT).unwrap();
    let remaining = (expiry.and_utc() - Utc::now()).num_seconds();
    assert!((3590..=3600).contains(&remaining));
}

#[tokio::test]
async fn test_second_callback_overwrites_in_place() {
    let h = harness().await;
    let state = h.begin().await;
    h.callback("auth-code-1", &state).await.unwrap();

    h.fake.reply_with(
        StatusCode::OK,
        json!({ "access_token": "ya29.second", "expires_in": 60 }),
    );
    let state = h.begin().await;
    h.callback("auth-code-2", &state).await.unwrap();

    assert_eq!(h.cluster.secrets_in("proj-a").len(), 1);
    let stored = h.stored().unwrap();
    assert_eq!(stored.token, "ya29.second");
    assert_eq!(stored.refresh_token, "");

    // Raw keys agree with the document; the first grant's refresh token is gone.
    let secret = h.cluster.secret("proj-a", "s1-google-oauth").unwrap();
    assert_eq!(secret.data["access_token"], b"ya29.second");
    assert_eq!(secret.data["refresh_token"], stored.refresh_token.as_bytes());
}

#[tokio::test]
async fn test_session_deleted_before_callback() {
    let h = harness().await;
    let state = h.begin().await;
    h.cluster.remove_session("proj-a", "s1");

    let err = h.callback("auth-code-1", &state).await.unwrap_err();
    assert!(matches!(err, CredentialError::NotFound(_)));
    assert!(h.fake.exchanges().is_empty());
}

#[tokio::test]
async fn test_provider_denial() {
    let h = harness().await;
    let outcome = h
        .flow
        .complete(&CallbackParams {
            error: Some("access_denied".into()),
            error_description: Some("user said no".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CallbackOutcome::ProviderDenied {
            error: "access_denied".into(),
            description: Some("user said no".into()),
        }
    );
    assert!(h.fake.exchanges().is_empty());
}
