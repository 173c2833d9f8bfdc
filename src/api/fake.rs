//! Scripted `DeviceApi` for unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;

use super::models::*;
use super::{ActionResponse, ApiError, DeviceApi};
use crate::actions::DeviceAction;

pub(crate) struct FakeDeviceApi {
    pub device_info: Result<DeviceInfo, ApiError>,
    pub device_id: Result<String, ApiError>,
    pub software_status: Result<Vec<SoftwareStatus>, ApiError>,
    pub runners: Result<Vec<RunnerInfo>, ApiError>,
    pub hardware: Result<HardwareInfo, ApiError>,
    pub ping: Result<PingMap, ApiError>,
    pub health: Result<HealthMap, ApiError>,
    pub vias: Result<Vec<ViaInfo>, ApiError>,
    pub room_config: Result<RoomConfiguration, ApiError>,
    pub divider_state: Result<Value, ApiError>,
    pub divider_preset: Result<String, ApiError>,
    pub divider_pins: Result<Vec<DividerPin>, ApiError>,
    pub action: Result<ActionResponse, ApiError>,
    /// Simulated latency of action requests
    pub action_delay: Duration,
    pub calls: Mutex<Vec<String>>,
}

impl Default for FakeDeviceApi {
    fn default() -> Self {
        Self {
            device_info: Ok(DeviceInfo::default()),
            device_id: Ok(String::new()),
            software_status: Ok(Vec::new()),
            runners: Ok(Vec::new()),
            hardware: Ok(HardwareInfo::default()),
            ping: Ok(PingMap::new()),
            health: Ok(HealthMap::new()),
            vias: Ok(Vec::new()),
            room_config: Ok(RoomConfiguration::default()),
            divider_state: Ok(Value::Null),
            divider_preset: Ok(String::new()),
            divider_pins: Ok(Vec::new()),
            action: Ok(ActionResponse {
                status: 200,
                body: "success".to_string(),
            }),
            action_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeDeviceApi {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl DeviceApi for FakeDeviceApi {
    async fn device_info(&self) -> Result<DeviceInfo, ApiError> {
        self.record("device_info");
        self.device_info.clone()
    }

    async fn device_id(&self) -> Result<String, ApiError> {
        self.record("device_id");
        self.device_id.clone()
    }

    async fn software_status(&self) -> Result<Vec<SoftwareStatus>, ApiError> {
        self.record("software_status");
        self.software_status.clone()
    }

    async fn runners(&self) -> Result<Vec<RunnerInfo>, ApiError> {
        self.record("runners");
        self.runners.clone()
    }

    async fn hardware_info(&self) -> Result<HardwareInfo, ApiError> {
        self.record("hardware_info");
        self.hardware.clone()
    }

    async fn room_ping(&self) -> Result<PingMap, ApiError> {
        self.record("room_ping");
        self.ping.clone()
    }

    async fn room_health(&self) -> Result<HealthMap, ApiError> {
        self.record("room_health");
        self.health.clone()
    }

    async fn via_info(&self) -> Result<Vec<ViaInfo>, ApiError> {
        self.record("via_info");
        self.vias.clone()
    }

    async fn room_configuration(
        &self,
        building: &str,
        room: &str,
    ) -> Result<RoomConfiguration, ApiError> {
        self.record(format!("room_configuration {} {}", building, room));
        self.room_config.clone()
    }

    async fn divider_state(&self, address: &str) -> Result<Value, ApiError> {
        self.record(format!("divider_state {}", address));
        self.divider_state.clone()
    }

    async fn divider_preset(&self, address: &str, hostname: &str) -> Result<String, ApiError> {
        self.record(format!("divider_preset {} {}", address, hostname));
        self.divider_preset.clone()
    }

    async fn divider_pins(&self, system_id: &str) -> Result<Vec<DividerPin>, ApiError> {
        self.record(format!("divider_pins {}", system_id));
        self.divider_pins.clone()
    }

    async fn perform(
        &self,
        action: &DeviceAction,
        _timeout: Duration,
    ) -> Result<ActionResponse, ApiError> {
        self.record(format!("perform {}", action.busy_key()));
        if !self.action_delay.is_zero() {
            tokio::time::sleep(self.action_delay).await;
        }
        self.action.clone()
    }
}
