use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use cmux_termd::auth_state::{AuthMode, AuthStateFile};
use cmux_termd::config::{GatewayConfig, ManagerConfig};
use cmux_termd::services::{SessionIdentityService, StaticEnvService};
use cmux_termd::{
    build_router, AppState, ClientEvent, ClientHandlers, NativePtySpawner, ServiceRegistry,
    SessionId, SessionManager,
};
use serde_json::{json, Value};
use tower::ServiceExt;

struct Harness {
    app: Router,
    manager: Arc<SessionManager>,
    auth_dir: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let auth_dir = dir.path().join("auth");
    let config = ManagerConfig {
        shell: "/bin/sh".into(),
        default_cwd: "/tmp".into(),
        auth_state_dir: Some(auth_dir.clone()),
        inherit_env: false,
        base_env: BTreeMap::from([
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            (
                "DATABRICKS_HOST".to_string(),
                "https://ambient.example".to_string(),
            ),
            ("DATABRICKS_CLIENT_ID".to_string(), "sp-client".to_string()),
        ]),
        ..ManagerConfig::default()
    };
    let services = Arc::new(
        ServiceRegistry::default()
            .with_service(SessionIdentityService)
            .with_service(StaticEnvService::parse_pairs(["TEAM=infra"]).unwrap()),
    );
    let manager = SessionManager::new(config, Arc::new(NativePtySpawner), services.clone());
    let app = build_router(AppState::new(
        manager.clone(),
        services,
        GatewayConfig::default(),
    ));
    Harness {
        app,
        manager,
        auth_dir,
        _dir: dir,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Collect session output until it contains `needle`.
async fn wait_for_output(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
    needle: &str,
) -> String {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mut output = String::new();
        while !output.contains(needle) {
            match rx.recv().await {
                Some(ClientEvent::Data(data)) => output.push_str(&data),
                Some(_) => {}
                None => panic!("session ended before {needle:?} appeared: {output:?}"),
            }
        }
        output
    })
    .await
    .expect("timed out waiting for output")
}

#[tokio::test]
async fn shell_sees_enriched_environment_and_auth_file() {
    let h = harness();
    let id = SessionId::generate().to_string();

    let (status, created) = call(
        &h.app,
        "POST",
        "/sessions",
        Some(json!({ "id": id, "actor": "alice", "env": { "EXTRA": "yes" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["client_id"], "sp-client");

    let (handlers, mut rx) = ClientHandlers::channel();
    let _detach = h.manager.attach_session(&id, handlers).unwrap();

    let (status, _) = call(
        &h.app,
        "POST",
        &format!("/sessions/{id}/input"),
        Some(json!({
            "data": "echo \"[$TERMD_ACTOR|$TEAM|$EXTRA|$TERM|$DATABRICKS_CLIENT_ID]\"\n"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_output(&mut rx, "[alice|infra|yes|xterm-256color|sp-client]").await;

    let (status, _) = call(
        &h.app,
        "POST",
        &format!("/sessions/{id}/input"),
        Some(json!({ "data": "cat \"$TERMD_AUTH_STATE_FILE\"\n" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_output(&mut rx, "\"mode\": \"m2m\"").await;
}

#[tokio::test]
async fn auth_mode_round_trip_updates_state_file() {
    let h = harness();
    let (_, created) = call(&h.app, "POST", "/sessions", Some(json!({ "id": SessionId::generate().to_string() }))).await;
    let id = created["id"].as_str().unwrap().to_string();
    let file = AuthStateFile::for_session(&h.auth_dir, &SessionId::parse(&id).unwrap());

    let (status, info) = call(
        &h.app,
        "POST",
        &format!("/sessions/{id}/auth-mode"),
        Some(json!({
            "mode": "user",
            "user_token": "tok",
            "delegated_host": "https://user.example"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["auth_mode"], "user");
    assert_eq!(info["credential_host"], "https://user.example");
    assert_eq!(file.load().unwrap().token.as_deref(), Some("tok"));

    let (status, info) = call(
        &h.app,
        "POST",
        &format!("/sessions/{id}/auth-mode"),
        Some(json!({ "mode": "m2m" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["auth_mode"], "m2m");
    assert_eq!(info["credential_host"], "https://ambient.example");
    assert_eq!(info["client_id"], "sp-client");

    let doc = file.load().unwrap();
    assert_eq!(doc.mode, AuthMode::M2m);
    assert_eq!(doc.token, None);

    let (status, _) = call(&h.app, "DELETE", &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!file.path().exists());
}

#[tokio::test]
async fn oversized_input_is_rejected_whole() {
    let h = harness();
    let (_, created) = call(&h.app, "POST", "/sessions", Some(json!({ "id": SessionId::generate().to_string() }))).await;
    let id = created["id"].as_str().unwrap().to_string();

    let data = "x".repeat(65_537);
    let (status, body) = call(
        &h.app,
        "POST",
        &format!("/sessions/{id}/input"),
        Some(json!({ "data": data })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "input_too_large");
    assert_eq!(body["error"]["details"]["actual"], 65_537);
}

#[tokio::test]
async fn spawn_failure_is_reported_as_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let config = ManagerConfig {
        shell: "/nonexistent/shell".into(),
        default_cwd: "/tmp".into(),
        auth_state_dir: Some(dir.path().to_path_buf()),
        inherit_env: false,
        ..ManagerConfig::default()
    };
    let services = Arc::new(ServiceRegistry::default());
    let manager = SessionManager::new(config, Arc::new(NativePtySpawner), services.clone());
    let app = build_router(AppState::new(manager, services, GatewayConfig::default()));

    let (status, body) = call(&app, "POST", "/sessions", Some(json!({ "id": SessionId::generate().to_string() }))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "spawn_failed");
    assert_eq!(body["error"]["retryable"], true);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
