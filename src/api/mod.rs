//! On-device HTTP API client.
//!
//! `DeviceApi` is the capability the aggregator and dispatcher depend on;
//! `HttpDeviceApi` implements it over reqwest. Error bodies are kept in
//! `ApiError::Status` so callers can decide whether a payload is usable.

pub mod models;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::actions::DeviceAction;
use crate::config::DeviceConfig;
use models::{
    parse_health_map, parse_ping_map, DeviceInfo, DividerPin, HardwareInfo, HealthMap, PingMap,
    RoomConfiguration, RunnerInfo, SoftwareStatus, ViaInfo,
};

/// Errors from the device API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Client-side timeout fired before a response arrived
    #[error("Request timed out")]
    Timeout,

    /// Connection refused, reset or aborted
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-2xx response; the body is kept for callers that can use it
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Network-level failure (no HTTP status was received)
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, ApiError::Timeout | ApiError::Transport(_))
    }

    /// Body of a non-2xx response, if any
    pub fn payload(&self) -> Option<&str> {
        match self {
            ApiError::Status { body, .. } if !body.trim().is_empty() => Some(body),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Decode(e.to_string())
    }
}

/// Raw result of an action request. Any HTTP status lands here;
/// only transport failures and timeouts are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResponse {
    pub status: u16,
    pub body: String,
}

impl ActionResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Capability over the on-device REST API
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// `GET device`
    async fn device_info(&self) -> Result<DeviceInfo, ApiError>;

    /// `GET device/id` (plain text)
    async fn device_id(&self) -> Result<String, ApiError>;

    /// `GET device/status`
    async fn software_status(&self) -> Result<Vec<SoftwareStatus>, ApiError>;

    /// `GET device/runners`
    async fn runners(&self) -> Result<Vec<RunnerInfo>, ApiError>;

    /// `GET device/hardwareinfo`
    async fn hardware_info(&self) -> Result<HardwareInfo, ApiError>;

    /// `GET room/ping`
    async fn room_ping(&self) -> Result<PingMap, ApiError>;

    /// `GET room/health`
    async fn room_health(&self) -> Result<HealthMap, ApiError>;

    /// `GET room/viainfo`
    async fn via_info(&self) -> Result<Vec<ViaInfo>, ApiError>;

    /// Room configuration from the configuration database
    async fn room_configuration(
        &self,
        building: &str,
        room: &str,
    ) -> Result<RoomConfiguration, ApiError>;

    /// `GET divider/state` on the sensor itself; keys carry the state
    async fn divider_state(&self, address: &str) -> Result<Value, ApiError>;

    /// `GET divider/preset/{hostname}` on the sensor (plain text)
    async fn divider_preset(&self, address: &str, hostname: &str) -> Result<String, ApiError>;

    /// `GET divider/pins/{system_id}` on the device API
    async fn divider_pins(&self, system_id: &str) -> Result<Vec<DividerPin>, ApiError>;

    /// Issue an action request, aborted after `timeout`
    async fn perform(
        &self,
        action: &DeviceAction,
        timeout: Duration,
    ) -> Result<ActionResponse, ApiError>;
}

/// reqwest-backed `DeviceApi`
pub struct HttpDeviceApi {
    client: Client,
    base: Url,
    host: String,
    via_port: u16,
    divider_port: u16,
    config_db_port: u16,
    request_timeout: Duration,
}

impl HttpDeviceApi {
    pub fn new(config: &DeviceConfig) -> Result<Self, ApiError> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let host = base
            .host_str()
            .ok_or_else(|| ApiError::InvalidUrl(format!("{}: missing host", config.base_url)))?
            .to_string();

        let client = Client::builder()
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base,
            host,
            via_port: config.via_port,
            divider_port: config.divider_port,
            config_db_port: config.config_db_port,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        })
    }

    /// Host the device API is served from
    pub fn host(&self) -> &str {
        &self.host
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", path, e)))
    }

    fn external(&self, host: &str, port: u16, path: &str) -> Result<Url, ApiError> {
        let raw = format!("http://{}:{}/{}", host, port, path);
        Url::parse(&raw).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", raw, e)))
    }

    /// URL an action request is sent to
    pub fn action_url(&self, action: &DeviceAction) -> Result<Url, ApiError> {
        match action {
            DeviceAction::Reboot => self.endpoint("device/reboot"),
            DeviceAction::FlushDns => self.endpoint("/dns"),
            DeviceAction::ResyncDb => self.endpoint("/resyncDB"),
            DeviceAction::RefreshContainers => self.endpoint("/refreshContainers"),
            DeviceAction::ResetVia(address) => self.external(
                &self.host,
                self.via_port,
                &format!("via/{}/reset", urlencoding::encode(address)),
            ),
            DeviceAction::RebootVia(address) => self.external(
                &self.host,
                self.via_port,
                &format!("via/{}/reboot", urlencoding::encode(address)),
            ),
        }
    }

    async fn send(&self, method: Method, url: Url, timeout: Duration) -> Result<Response, ApiError> {
        debug!(%method, %url, "Device API request");
        let response = self
            .client
            .request(method, url)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        let response = self.send(Method::GET, url, self.request_timeout).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn get_text(&self, url: Url) -> Result<String, ApiError> {
        let response = self.send(Method::GET, url, self.request_timeout).await?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn device_info(&self) -> Result<DeviceInfo, ApiError> {
        self.get_json(self.endpoint("device")?).await
    }

    async fn device_id(&self) -> Result<String, ApiError> {
        let text = self.get_text(self.endpoint("device/id")?).await?;
        Ok(text.trim().trim_matches('"').to_string())
    }

    async fn software_status(&self) -> Result<Vec<SoftwareStatus>, ApiError> {
        // Older firmware answers with a single object
        let value: Value = self.get_json(self.endpoint("device/status")?).await?;
        match value {
            Value::Array(_) => Ok(serde_json::from_value(value)?),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![serde_json::from_value(other)?]),
        }
    }

    async fn runners(&self) -> Result<Vec<RunnerInfo>, ApiError> {
        let value: Value = self.get_json(self.endpoint("device/runners")?).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn hardware_info(&self) -> Result<HardwareInfo, ApiError> {
        self.get_json(self.endpoint("device/hardwareinfo")?).await
    }

    async fn room_ping(&self) -> Result<PingMap, ApiError> {
        let value: Value = self.get_json(self.endpoint("room/ping")?).await?;
        if value.is_null() {
            return Ok(PingMap::new());
        }
        Ok(parse_ping_map(value)?)
    }

    async fn room_health(&self) -> Result<HealthMap, ApiError> {
        let value: Value = self.get_json(self.endpoint("room/health")?).await?;
        if value.is_null() {
            return Ok(HealthMap::new());
        }
        Ok(parse_health_map(value)?)
    }

    async fn via_info(&self) -> Result<Vec<ViaInfo>, ApiError> {
        let value: Value = self.get_json(self.endpoint("room/viainfo")?).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn room_configuration(
        &self,
        building: &str,
        room: &str,
    ) -> Result<RoomConfiguration, ApiError> {
        let path = format!(
            "buildings/{}/rooms/{}/configuration",
            urlencoding::encode(building),
            urlencoding::encode(room)
        );
        self.get_json(self.external(&self.host, self.config_db_port, &path)?)
            .await
    }

    async fn divider_state(&self, address: &str) -> Result<Value, ApiError> {
        self.get_json(self.external(address, self.divider_port, "divider/state")?)
            .await
    }

    async fn divider_preset(&self, address: &str, hostname: &str) -> Result<String, ApiError> {
        let path = format!("divider/preset/{}", urlencoding::encode(hostname));
        let text = self
            .get_text(self.external(address, self.divider_port, &path)?)
            .await?;
        Ok(text.trim().to_string())
    }

    async fn divider_pins(&self, system_id: &str) -> Result<Vec<DividerPin>, ApiError> {
        let path = format!("divider/pins/{}", urlencoding::encode(system_id));
        let value: Value = self.get_json(self.endpoint(&path)?).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn perform(
        &self,
        action: &DeviceAction,
        timeout: Duration,
    ) -> Result<ActionResponse, ApiError> {
        let url = self.action_url(action)?;
        let method = if matches!(action, DeviceAction::Reboot) {
            Method::PUT
        } else {
            Method::GET
        };
        debug!(%method, %url, ?timeout, action = %action, "Device action request");

        let response = self
            .client
            .request(method, url)
            .timeout(timeout)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(ActionResponse { status, body })
    }
}
