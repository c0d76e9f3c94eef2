use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::dispatcher::Dispatcher;
use crate::entity_registry::EntityRegistry;
use crate::integrations::nmap_tracker::{NmapDevice, NmapTrackedDevices};
use crate::services::ServiceRegistry;
use crate::state::{EntityState, EventBus, StateMachine};

const STATE_CHANNEL_CAPACITY: usize = 4096;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const DISPATCHER_CAPACITY: usize = 64;

/// Shared application state
pub struct AppState {
    pub state_machine: StateMachine,
    pub event_bus: EventBus,
    pub dispatcher: Arc<Dispatcher>,
    pub entity_registry: Arc<EntityRegistry>,
    pub nmap_devices: Arc<NmapTrackedDevices>,
    pub services: Arc<RwLock<ServiceRegistry>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(entity_registry: EntityRegistry) -> Self {
        Self {
            state_machine: StateMachine::new(STATE_CHANNEL_CAPACITY),
            event_bus: EventBus::new(EVENT_CHANNEL_CAPACITY),
            dispatcher: Arc::new(Dispatcher::new(DISPATCHER_CAPACITY)),
            entity_registry: Arc::new(entity_registry),
            nmap_devices: Arc::new(NmapTrackedDevices::new()),
            services: Arc::new(RwLock::new(ServiceRegistry::new())),
            started_at: Instant::now(),
        }
    }

    /// In-memory registry, fresh everything.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::new(EntityRegistry::open_in_memory().unwrap())
    }
}

/// GET /api/ response
#[derive(Serialize)]
struct ApiStatus {
    message: String,
}

/// POST /api/events/{event_type} response
#[derive(Serialize)]
struct EventResponse {
    message: String,
}

/// POST /api/services/{domain}/{service} response
#[derive(Serialize)]
struct ServiceResponse {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    changed_states: Vec<EntityState>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/", get(api_status))
        .route("/api/states", get(get_states))
        .route("/api/states/:entity_id", get(get_state))
        .route("/api/events/:event_type", post(fire_event))
        .route("/api/services", get(list_services))
        .route("/api/services/:domain/:service", post(call_service))
        .route("/api/nmap_tracker/devices", get(nmap_devices))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /api/: API running check
async fn api_status() -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "API running.".to_string(),
    })
}

/// GET /api/states: return all entity states
async fn get_states(State(app): State<Arc<AppState>>) -> Json<Vec<EntityState>> {
    Json(app.state_machine.get_all())
}

/// GET /api/states/{entity_id}: return single entity state
async fn get_state(
    State(app): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityState>, StatusCode> {
    app.state_machine
        .get(&entity_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/events/{event_type}: fire an event
async fn fire_event(
    State(app): State<Arc<AppState>>,
    Path(event_type): Path<String>,
    body: Bytes,
) -> Result<Json<EventResponse>, StatusCode> {
    // Event data is optional
    let data = if body.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };
    let listeners = app.event_bus.fire(&event_type, data);
    tracing::info!(event_type = %event_type, listeners, "Event fired");
    Ok(Json(EventResponse {
        message: format!("Event {} fired.", event_type),
    }))
}

/// GET /api/services: registered services by domain
async fn list_services(State(app): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let services = app.services.read().unwrap_or_else(|e| e.into_inner()).list_services();
    let list: Vec<serde_json::Value> = services
        .into_iter()
        .map(|(domain, services)| serde_json::json!({"domain": domain, "services": services}))
        .collect();
    Json(serde_json::Value::Array(list))
}

/// POST /api/services/{domain}/{service}: call a service
async fn call_service(
    State(app): State<Arc<AppState>>,
    Path((domain, service)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ServiceResponse>, StatusCode> {
    tracing::info!(domain = %domain, service = %service, "Service called");

    let registry = app.services.read().unwrap_or_else(|e| e.into_inner());
    if !registry.has_handler(&domain, &service) {
        return Err(StatusCode::BAD_REQUEST);
    }

    // entity_id at the top level or under target
    let entity_ids: Vec<String> = match body
        .get("entity_id")
        .or_else(|| body.get("target").and_then(|t| t.get("entity_id")))
    {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(arr)) => {
            arr.iter().filter_map(|v| v.as_str().map(String::from)).collect()
        }
        _ => vec![],
    };

    let changed = registry.call(&domain, &service, &entity_ids, &body, &app.state_machine);
    Ok(Json(ServiceResponse {
        changed_states: changed,
    }))
}

/// GET /api/nmap_tracker/devices: every device the scanners track
async fn nmap_devices(State(app): State<Arc<AppState>>) -> Json<Vec<NmapDevice>> {
    let mut devices: Vec<NmapDevice> = app
        .nmap_devices
        .tracked
        .iter()
        .map(|d| d.value().clone())
        .collect();
    devices.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
    Json(devices)
}

/// GET /api/health: health check with metrics
async fn health(State(app): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let pid = std::process::id();
    let rss_kb = read_rss_kb(pid).unwrap_or(0);

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "entity_count": app.state_machine.len(),
        "nmap_device_count": app.nmap_devices.tracked.len(),
        "memory_rss_kb": rss_kb,
        "uptime_seconds": app.started_at.elapsed().as_secs(),
    }))
}

/// Read RSS from /proc/self/status on Linux
fn read_rss_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            return parts.get(1)?.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::state::Attributes;

    fn app() -> Arc<AppState> {
        Arc::new(AppState::for_tests())
    }

    #[tokio::test]
    async fn test_get_state() {
        let app = app();
        app.state_machine.set("sensor.ombi_movie_requests".into(), "4".into(), Attributes::new());

        let Json(state) = get_state(State(app.clone()), Path("sensor.ombi_movie_requests".into()))
            .await
            .unwrap();
        assert_eq!(state.state, "4");

        let missing = get_state(State(app.clone()), Path("sensor.nothing".into())).await;
        assert_eq!(missing.err(), Some(StatusCode::NOT_FOUND));

        let Json(all) = get_states(State(app)).await;
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_fire_event_reaches_bus() {
        let app = app();
        let mut rx = app.event_bus.subscribe();
        fire_event(State(app.clone()), Path("test_event1".into()), Bytes::from(r#"{"a": 1}"#))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "test_event1");
        assert_eq!(event.data["a"], 1);

        fire_event(State(app.clone()), Path("test_event2".into()), Bytes::new()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().data, json!({}));

        let bad = fire_event(State(app), Path("test_event3".into()), Bytes::from("not json")).await;
        assert_eq!(bad.err(), Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn test_call_service() {
        let app = app();
        let result = call_service(
            State(app.clone()),
            Path(("persistent_notification".into(), "create".into())),
            Json(json!({"notification_id": "scan", "message": "nmap finished"})),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(
            app.state_machine.get("persistent_notification.scan").unwrap().state,
            "notifying"
        );

        let unknown = call_service(
            State(app),
            Path(("device_tracker".into(), "see".into())),
            Json(json!({"dev_id": "phone"})),
        )
        .await;
        assert_eq!(unknown.err(), Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn test_nmap_devices_sorted() {
        let app = app();
        for mac in ["bb:00:00:00:00:02", "aa:00:00:00:00:01"] {
            app.nmap_devices.tracked.insert(
                mac.to_string(),
                NmapDevice {
                    mac_address: mac.to_string(),
                    hostname: None,
                    name: mac.to_string(),
                    ipv4: Some("192.168.1.2".to_string()),
                    manufacturer: None,
                    reason: "arp-response".to_string(),
                    last_update: Utc::now(),
                    offline_scans: 0,
                },
            );
        }
        let Json(devices) = nmap_devices(State(app.clone())).await;
        assert_eq!(devices[0].mac_address, "aa:00:00:00:00:01");

        let Json(health) = health(State(app)).await;
        assert_eq!(health["nmap_device_count"], 2);
        assert_eq!(health["status"], "ok");
    }
}
