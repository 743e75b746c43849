//! Shared helpers: a mock management API and in-memory clients.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};

use courier::{
    BrokerConfig, ClientSettings, InMemoryBroker, MessagingClient, NamespaceConfig,
    ServiceIdentity, TenantId, TopologyResolver, VirtualHostAdmin,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const SHORT: Duration = Duration::from_millis(50);

/// `guest:guest`
const GUEST_AUTH: &str = "Basic Z3Vlc3Q6Z3Vlc3Q=";

// ── Mock management API ──────────────────────────────────────────────

#[derive(Default)]
pub struct ManagementState {
    pub vhosts: Mutex<BTreeSet<String>>,
    pub permissions: Mutex<Vec<(String, String, serde_json::Value)>>,
    pub lists: AtomicUsize,
    pub creates: AtomicUsize,
    pub grants: AtomicUsize,
    pub deletes: AtomicUsize,
    pub fail_grants: AtomicBool,
}

impl ManagementState {
    pub fn vhost_names(&self) -> Vec<String> {
        self.vhosts.lock().unwrap().iter().cloned().collect()
    }

    pub fn seed(&self, vhost: &str) {
        self.vhosts.lock().unwrap().insert(vhost.to_string());
    }

    pub fn requests(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
            + self.creates.load(Ordering::SeqCst)
            + self.grants.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
    }
}

type Shared = Arc<ManagementState>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == GUEST_AUTH)
}

async fn list_vhosts(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.lists.fetch_add(1, Ordering::SeqCst);
    let names: Vec<serde_json::Value> = state
        .vhost_names()
        .into_iter()
        .map(|name| serde_json::json!({ "name": name }))
        .collect();
    Json(names).into_response()
}

async fn create_vhost(
    State(state): State<Shared>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.creates.fetch_add(1, Ordering::SeqCst);
    if state.vhosts.lock().unwrap().insert(name) {
        StatusCode::CREATED.into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn delete_vhost(
    State(state): State<Shared>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.deletes.fetch_add(1, Ordering::SeqCst);
    if state.vhosts.lock().unwrap().remove(&name) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn grant_permissions(
    State(state): State<Shared>,
    Path((vhost, user)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.grants.fetch_add(1, Ordering::SeqCst);
    if state.fail_grants.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "grant failed").into_response();
    }
    if !state.vhosts.lock().unwrap().contains(&vhost) {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.permissions.lock().unwrap().push((vhost, user, body));
    StatusCode::CREATED.into_response()
}

/// Serve a mock RabbitMQ management API on an ephemeral port.
pub async fn spawn_management() -> (String, Arc<ManagementState>) {
    let state = Arc::new(ManagementState::default());
    let app = Router::new()
        .route("/api/vhosts", get(list_vhosts))
        .route("/api/vhosts/{name}", put(create_vhost).delete(delete_vhost))
        .route("/api/permissions/{vhost}/{user}", put(grant_permissions))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

pub fn admin_for(base_url: &str) -> VirtualHostAdmin {
    admin_with_password(base_url, "guest")
}

pub fn admin_with_password(base_url: &str, password: &str) -> VirtualHostAdmin {
    let broker = BrokerConfig {
        management_url_override: Some(base_url.to_string()),
        password: password.to_string(),
        connection_timeout_secs: 2,
        ..BrokerConfig::default()
    };
    VirtualHostAdmin::new(&broker, &NamespaceConfig::default()).unwrap()
}

// ── In-memory clients ────────────────────────────────────────────────

pub fn tenant(name: &str) -> TenantId {
    TenantId::new(name).unwrap()
}

pub fn settings() -> ClientSettings {
    ClientSettings {
        poll_interval: Duration::from_millis(5),
        default_timeout: SHORT,
        ..ClientSettings::default()
    }
}

/// A client for `service`/`instance` sharing `broker` with every other
/// client built from it.
pub fn client(broker: &InMemoryBroker, service: &str, instance: &str) -> Arc<MessagingClient> {
    Arc::new(MessagingClient::new(
        TopologyResolver::new("courier", ServiceIdentity::new(service, instance)),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        settings(),
    ))
}
