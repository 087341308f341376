//! Session transitions through `HttpCluster` against a local API server.
//!
//! The fake server enforces optimistic concurrency the way the real one does
//! for custom resources: an update without `metadata.resourceVersion` is
//! rejected with 422, and a stale one with 409.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use reqwest::Client;
use secrecy::SecretString;
use serde_json::{Value, json};

use sessiongate::cluster::ClusterApi;
use sessiongate::cluster::http::{AuthMode, HttpCluster};
use sessiongate::config::{ProvisionConfig, SessionResource};
use sessiongate::lifecycle::{LifecycleController, StopOutcome};
use sessiongate::provision::IdentityProvisioner;
use sessiongate::session::SessionRef;

const SESSION_PATH: &str =
    "/apis/vteam.ambient-code/v1alpha1/namespaces/{namespace}/agenticsessions/{name}";

// ---------------------------------------------------------------------------
// Fake API server
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct FakeApi {
    session: Arc<Mutex<Value>>,
    status_writes: Arc<Mutex<Vec<Value>>>,
    /// Bump the stored version just before the next status write lands.
    race_next_status: Arc<AtomicBool>,
}

impl FakeApi {
    fn new(phase: &str) -> Self {
        Self {
            session: Arc::new(Mutex::new(json!({
                "apiVersion": "vteam.ambient-code/v1alpha1",
                "kind": "AgenticSession",
                "metadata": {
                    "name": "s1",
                    "namespace": "proj-a",
                    "uid": "u",
                    "resourceVersion": "5"
                },
                "spec": { "interactive": false, "userContext": { "userId": "alice" } },
                "status": { "phase": phase }
            }))),
            status_writes: Arc::default(),
            race_next_status: Arc::default(),
        }
    }

    fn status_writes(&self) -> Vec<Value> {
        self.status_writes.lock().unwrap().clone()
    }

    fn stored(&self) -> Value {
        self.session.lock().unwrap().clone()
    }
}

fn status_body(code: StatusCode, reason: &str, message: &str) -> (StatusCode, Json<Value>) {
    (
        code,
        Json(json!({
            "kind": "Status",
            "status": "Failure",
            "reason": reason,
            "message": message,
            "code": code.as_u16()
        })),
    )
}

fn bump(stored: &mut Value) {
    let next = stored["metadata"]["resourceVersion"]
        .as_str()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    stored["metadata"]["resourceVersion"] = json!(next.to_string());
}

/// Apply the update rule shared by the main resource and its status.
fn check_version(stored: &Value, body: &Value) -> Result<(), (StatusCode, Json<Value>)> {
    match body["metadata"]["resourceVersion"].as_str() {
        None => Err(status_body(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Invalid",
            "metadata.resourceVersion: Invalid value: 0x0: must be specified for an update",
        )),
        Some(v) if Some(v) != stored["metadata"]["resourceVersion"].as_str() => Err(status_body(
            StatusCode::CONFLICT,
            "Conflict",
            "the object has been modified; please apply your changes to the latest version",
        )),
        Some(_) => Ok(()),
    }
}

async fn get_session(State(api): State<FakeApi>) -> Json<Value> {
    Json(api.stored())
}

async fn put_session(
    State(api): State<FakeApi>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut stored = api.session.lock().unwrap();
    check_version(&stored, &body)?;
    stored["metadata"] = body["metadata"].clone();
    stored["spec"] = body["spec"].clone();
    bump(&mut stored);
    Ok(Json(stored.clone()))
}

async fn put_status(
    State(api): State<FakeApi>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    api.status_writes.lock().unwrap().push(body.clone());
    let mut stored = api.session.lock().unwrap();
    if api.race_next_status.swap(false, Ordering::SeqCst) {
        bump(&mut stored);
    }
    check_version(&stored, &body)?;
    stored["status"] = body["status"].clone();
    bump(&mut stored);
    Ok(Json(stored.clone()))
}

async fn delete_job(Path((_, name)): Path<(String, String)>) -> (StatusCode, Json<Value>) {
    status_body(
        StatusCode::NOT_FOUND,
        "NotFound",
        &format!("jobs.batch \"{name}\" not found"),
    )
}

async fn delete_pods() -> Json<Value> {
    Json(json!({ "kind": "PodList", "items": [] }))
}

async fn start_fake_api(api: FakeApi) -> SocketAddr {
    let app = Router::new()
        .route(SESSION_PATH, get(get_session).put(put_session))
        .route(&format!("{SESSION_PATH}/status"), put(put_status))
        .route("/apis/batch/v1/namespaces/{namespace}/jobs/{name}", delete(delete_job))
        .route("/api/v1/namespaces/{namespace}/pods", delete(delete_pods))
        .with_state(api);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

async fn harness(phase: &str) -> (FakeApi, HttpCluster, LifecycleController) {
    let api = FakeApi::new(phase);
    let addr = start_fake_api(api.clone()).await;
    let cluster = HttpCluster::new(
        Client::new(),
        &format!("http://{addr}"),
        AuthMode::Bearer(SecretString::from("user-token".to_string())),
        Duration::from_secs(5),
        SessionResource::default(),
    );
    let platform: Arc<dyn ClusterApi> = Arc::new(cluster.clone());
    let provisioner = Arc::new(IdentityProvisioner::new(
        platform,
        SessionResource::default(),
        ProvisionConfig::default(),
    ));
    (api, cluster, LifecycleController::new(provisioner))
}

fn s1() -> SessionRef {
    SessionRef::new("proj-a", "s1")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stop_status_write_carries_resource_version() {
    let (api, cluster, lifecycle) = harness("Running").await;

    let outcome = lifecycle.stop(&cluster, &s1()).await.unwrap();
    let session = match outcome {
        StopOutcome::Stopped(session) => session,
        other => panic!("expected stopped outcome, got {other:?}"),
    };
    assert_eq!(session.status.phase.as_deref(), Some("Stopped"));

    // Marking the session interactive moved it from 5 to 6.
    let writes = api.status_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0]["metadata"]["resourceVersion"], "6");
    assert_eq!(writes[0]["status"]["phase"], "Stopped");

    let stored = api.stored();
    assert_eq!(stored["status"]["phase"], "Stopped");
    assert_eq!(stored["spec"]["interactive"], true);
}

#[tokio::test]
async fn test_start_status_write_carries_resource_version() {
    let (api, cluster, lifecycle) = harness("Running").await;

    let outcome = lifecycle.start(&cluster, &s1()).await.unwrap();
    assert!(!outcome.continuation);
    assert_eq!(outcome.session.status.phase.as_deref(), Some("Pending"));

    let writes = api.status_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0]["metadata"]["resourceVersion"], "5");
    assert!(writes[0]["status"]["startTime"].is_string());
}

#[tokio::test]
async fn test_stop_retries_after_concurrent_write() {
    let (api, cluster, lifecycle) = harness("Running").await;
    api.race_next_status.store(true, Ordering::SeqCst);

    let outcome = lifecycle.stop(&cluster, &s1()).await.unwrap();
    assert!(matches!(outcome, StopOutcome::Stopped(_)));

    // First write lost the race at 6; the retry re-read 7.
    let writes = api.status_writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0]["metadata"]["resourceVersion"], "6");
    assert_eq!(writes[1]["metadata"]["resourceVersion"], "7");
    assert_eq!(api.stored()["status"]["phase"], "Stopped");
}
