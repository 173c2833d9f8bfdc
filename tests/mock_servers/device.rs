//! Mock room-control device for testing
//!
//! Responses are registered per path; unregistered paths answer 404.

use axum::{
    extract::State,
    http::{Method, StatusCode, Uri},
    Router,
};
use device_dash::config::DeviceConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Canned answer for one path
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl MockResponse {
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn json(value: Value) -> Self {
        Self::text(200, &value.to_string())
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct MockDeviceState {
    responses: HashMap<String, MockResponse>,
    /// "METHOD /path" -> hits
    hits: HashMap<String, usize>,
}

/// Mock device server
pub struct MockDevice {
    addr: SocketAddr,
    state: Arc<RwLock<MockDeviceState>>,
    handle: JoinHandle<()>,
}

impl MockDevice {
    /// Start a mock device on a random port
    pub async fn start() -> Self {
        let state = Arc::new(RwLock::new(MockDeviceState::default()));

        let app = Router::new()
            .fallback(handle_request)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    /// Start with a healthy ITB-1101 room registered
    pub async fn start_with_room() -> Self {
        let device = Self::start().await;
        device.load_room().await;
        device
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Client config pointing every port at this server
    pub fn device_config(&self) -> DeviceConfig {
        let port = self.addr.port();
        DeviceConfig {
            base_url: self.base_url(),
            via_port: port,
            divider_port: port,
            config_db_port: port,
            request_timeout_ms: 2000,
        }
    }

    pub async fn respond(&self, path: &str, response: MockResponse) {
        self.state
            .write()
            .await
            .responses
            .insert(path.to_string(), response);
    }

    pub async fn respond_json(&self, path: &str, value: Value) {
        self.respond(path, MockResponse::json(value)).await;
    }

    pub async fn remove(&self, path: &str) {
        self.state.write().await.responses.remove(path);
    }

    /// Requests seen for `"METHOD /path"`
    pub async fn hits(&self, request: &str) -> usize {
        self.state
            .read()
            .await
            .hits
            .get(request)
            .copied()
            .unwrap_or(0)
    }

    async fn load_room(&self) {
        self.respond_json(
            "/device",
            json!({
                "hostname": "ITB-1101-CP1",
                "id": "ITB-1101-CP1",
                "ip": "10.5.34.12",
                "internet-connectivity": true,
                "dhcp": {"enabled": false, "toggleable": true}
            }),
        )
        .await;
        self.respond("/device/id", MockResponse::text(200, "ITB-1101-CP1\n"))
            .await;
        self.respond_json(
            "/device/hardwareinfo",
            json!({
                "host": {"os": {"uptime": 7200}, "temperature": {"cpu": 48.5, "board": 51.25}},
                "cpu": {"usage": {"avg": 12.5}},
                "memory": {"virtual": {"usedPercent": 40.0}},
                "docker": {"docker-containers": 1, "stats": [
                    {"containerID": "abc", "name": "av-api", "running": true, "status": "Up 2 hours"}
                ]}
            }),
        )
        .await;
        self.respond_json(
            "/room/ping",
            json!({
                "ITB-1101-CP1": {"ip": "10.5.34.12", "packets-sent": 3, "packets-received": 3},
                "ITB-1101-D1": {"ip": "10.5.34.20", "packets-sent": 3, "packets-received": 0}
            }),
        )
        .await;
        self.respond_json(
            "/room/health",
            json!({
                "ITB-1101-CP1": "healthy",
                "ITB-1101-SW1": "unreachable"
            }),
        )
        .await;
        self.respond_json(
            "/buildings/ITB/rooms/1101/configuration",
            json!({
                "_id": "ITB-1101",
                "devices": [
                    {"_id": "ITB-1101-CP1", "address": "ITB-1101-CP1.byu.edu", "roles": [{"_id": "ControlProcessor"}]},
                    {"_id": "ITB-1101-DS1", "address": "127.0.0.1", "roles": [{"_id": "DividerSensor"}]}
                ]
            }),
        )
        .await;
        self.respond_json("/divider/state", json!({"connected": ["ITB-1101-CP1"]}))
            .await;
        self.respond(
            "/divider/preset/ITB-1101-CP1",
            MockResponse::text(200, "ITB-1101-A"),
        )
        .await;
        self.respond_json("/divider/pins/127", json!([{"pin": 17}]))
            .await;
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_request(
    State(state): State<Arc<RwLock<MockDeviceState>>>,
    method: Method,
    uri: Uri,
) -> (StatusCode, String) {
    let path = uri.path().to_string();
    let response = {
        let mut state = state.write().await;
        *state.hits.entry(format!("{} {}", method, path)).or_insert(0) += 1;
        state.responses.get(&path).cloned()
    };

    let Some(response) = response else {
        return (StatusCode::NOT_FOUND, format!("no route for {}", path));
    };
    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, response.body)
}
