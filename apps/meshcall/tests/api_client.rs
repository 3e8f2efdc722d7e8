use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;

use meshcall_core::api::ApiClient;
use meshcall_core::rtc_config::NetworkConfigProvider;
use meshcall_core::signaling::Credentials;
use meshcall_core::{MeshError, ParticipantId};

const TOKEN: &str = "token-for-12";

#[derive(Clone, Default)]
struct Backend {
    joined: Arc<Mutex<Vec<String>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TOKEN}"))
}

async fn join_room(
    State(backend): State<Backend>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if slug != "standup" && slug != "a b" {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "Room not found"}))).into_response();
    }
    backend.joined.lock().push(slug);
    Json(json!({"ok": true})).into_response()
}

async fn me(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"id": 12, "email": "twelve@example.com", "created_at": "2026-01-01T00:00:00"}))
        .into_response()
}

async fn rtc_config() -> Json<serde_json::Value> {
    Json(json!({
        "iceServers": [
            {"urls": "stun:stun.l.google.com:19302"},
            {"urls": "turn:turn.example.com:3478", "username": "u", "credential": "p"}
        ]
    }))
}

async fn start_backend() -> (String, Backend) {
    let backend = Backend::default();
    let router = Router::new()
        .route("/api/rooms/:slug/join", post(join_room))
        .route("/api/me", get(me))
        .route("/api/rtc/config", get(rtc_config))
        .with_state(backend.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (format!("http://{addr}/api"), backend)
}

#[test_timeout::tokio_timeout_test(20)]
async fn joining_a_room_registers_membership() {
    let (base, backend) = start_backend().await;
    let api = ApiClient::new(&base).unwrap();

    api.join_room("standup", &Credentials::token(TOKEN))
        .await
        .expect("join succeeds");
    api.join_room("a b", &Credentials::token(TOKEN))
        .await
        .expect("escaped room id");
    assert_eq!(*backend.joined.lock(), vec!["standup".to_string(), "a b".to_string()]);

    let missing = api.join_room("nowhere", &Credentials::token(TOKEN)).await;
    assert!(matches!(missing, Err(MeshError::Setup(reason)) if reason.contains("not found")));

    let rejected = api.join_room("standup", &Credentials::token("wrong")).await;
    assert!(matches!(rejected, Err(MeshError::Setup(_))));
    assert_eq!(backend.joined.lock().len(), 2);
}

#[test_timeout::tokio_timeout_test(20)]
async fn identity_and_ice_servers_come_from_the_api() {
    let (base, _backend) = start_backend().await;
    let api = ApiClient::new(&base).unwrap();

    let me = api.me(&Credentials::token(TOKEN)).await.unwrap();
    assert_eq!(me.id, ParticipantId::from(12));
    assert!(api.me(&Credentials::token("wrong")).await.is_err());

    let servers = api.ice_servers().await.unwrap();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
    assert_eq!(servers[1].username.as_deref(), Some("u"));
}
