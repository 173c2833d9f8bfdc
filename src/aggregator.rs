//! StatusAggregator - fetches device and room status and merges it into
//! view models.
//!
//! - Each refresh issues one request per endpoint
//! - Failures degrade to an empty value plus one notification
//! - Ping and health are merged by device id, never by arrival order

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::models::{
    is_healthy, DeviceInfo, DividerSensorInfo, DividerStatus, HardwareInfo, HealthMap, PingMap,
    PingResult, RunnerInfo, SoftwareStatus, ViaInfo,
};
use crate::api::{ApiError, DeviceApi};
use crate::bus::{BusEvent, Notification, SharedBus};
use crate::notify::NotificationSink;

/// Rendered for an empty divider preset or pin
pub const UNKNOWN_VALUE: &str = "unknown";

// =============================================================================
// Room status
// =============================================================================

/// Ping and health of one device; either may be missing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRow {
    pub device_id: String,
    pub ping: Option<PingResult>,
    pub health: Option<String>,
}

impl DeviceRow {
    pub fn is_reachable(&self) -> bool {
        self.ping.as_ref().is_some_and(PingResult::is_reachable)
    }

    /// Health reported and not "healthy"
    pub fn has_health_error(&self) -> bool {
        self.health.as_deref().is_some_and(|h| !is_healthy(h))
    }
}

/// Union of both maps' keys, one row per device, sorted by id
pub fn merge_rows(ping: &PingMap, health: &HealthMap) -> Vec<DeviceRow> {
    let ids: BTreeSet<&String> = ping.keys().chain(health.keys()).collect();
    ids.into_iter()
        .map(|id| DeviceRow {
            device_id: id.clone(),
            ping: ping.get(id).cloned(),
            health: health.get(id).cloned(),
        })
        .collect()
}

/// Derived room counts
///
/// Invariant: `reachable + unreachable == ping.len()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoomCounts {
    pub reachable: usize,
    pub unreachable: usize,
    pub health_errors: usize,
}

impl RoomCounts {
    pub fn from_ping(ping: &PingMap) -> Self {
        let reachable = ping.values().filter(|p| p.is_reachable()).count();
        Self {
            reachable,
            unreachable: ping.len() - reachable,
            health_errors: 0,
        }
    }

    pub fn with_health(mut self, health: &HealthMap) -> Self {
        self.health_errors = health.values().filter(|h| !is_healthy(h)).count();
        self
    }
}

/// What the room panel shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomView {
    Loaded,
    /// Both fetches succeeded and reported nothing
    NoDevices,
    /// Nothing to show and at least one fetch failed
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomStatus {
    pub rows: Vec<DeviceRow>,
    pub counts: RoomCounts,
    pub view: RoomView,
}

impl Default for RoomStatus {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            counts: RoomCounts::default(),
            view: RoomView::NoDevices,
        }
    }
}

impl RoomStatus {
    pub fn merge(ping: &PingMap, health: &HealthMap, any_failed: bool) -> Self {
        let rows = merge_rows(ping, health);
        let view = if !rows.is_empty() {
            RoomView::Loaded
        } else if any_failed {
            RoomView::Unavailable
        } else {
            RoomView::NoDevices
        };
        Self {
            rows,
            counts: RoomCounts::from_ping(ping).with_health(health),
            view,
        }
    }
}

/// Result of a full refresh pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub device: DeviceInfo,
    pub room: RoomStatus,
    pub hardware: HardwareInfo,
    /// Failed fetches in this pass
    pub failures: usize,
}

// =============================================================================
// Divider sensor
// =============================================================================

/// The divider endpoint encodes its state in object keys, not values.
/// The first key mentioning either state decides.
pub fn divider_status_from_keys(state: &Value) -> DividerStatus {
    let Some(map) = state.as_object() else {
        return DividerStatus::Unknown;
    };
    for key in map.keys() {
        if key.contains("disconnected") {
            return DividerStatus::Disconnected;
        }
        if key.contains("connected") {
            return DividerStatus::Connected;
        }
    }
    DividerStatus::Unknown
}

/// System id is the sensor address up to the first dot
pub fn divider_system_id(address: &str) -> &str {
    address.split('.').next().unwrap_or(address)
}

/// Device info endpoint quirk: a non-2xx response whose body parses as
/// device info is used as the result.
fn recover_device_info(result: Result<DeviceInfo, ApiError>) -> Result<DeviceInfo, ApiError> {
    let e = match result {
        Ok(info) => return Ok(info),
        Err(e) => e,
    };
    let recovered = e
        .payload()
        .and_then(|body| serde_json::from_str::<DeviceInfo>(body).ok());
    match recovered {
        Some(info) => {
            warn!(status = ?e.status(), "Device info returned an error with usable payload");
            Ok(info)
        }
        None => Err(e),
    }
}

// =============================================================================
// Aggregator
// =============================================================================

pub struct StatusAggregator {
    api: Arc<dyn DeviceApi>,
    notifier: Arc<dyn NotificationSink>,
    bus: SharedBus,
}

impl StatusAggregator {
    pub fn new(api: Arc<dyn DeviceApi>, notifier: Arc<dyn NotificationSink>, bus: SharedBus) -> Self {
        Self { api, notifier, bus }
    }

    fn report_failure(&self, what: &str, error: &ApiError) {
        warn!("Failed to load {}: {}", what, error);
        self.notifier.notify(Notification::error(
            format!("Failed to load {}", what),
            error.to_string(),
        ));
    }

    /// Unwrap a fetch result or fall back to the default value
    fn or_placeholder<T: Default>(&self, what: &str, result: Result<T, ApiError>) -> (T, usize) {
        match result {
            Ok(value) => (value, 0),
            Err(e) => {
                self.report_failure(what, &e);
                (T::default(), 1)
            }
        }
    }

    async fn load_device_info(&self) -> (DeviceInfo, usize) {
        let result = recover_device_info(self.api.device_info().await);
        let (info, failures) = self.or_placeholder("device info", result);
        self.bus.publish(BusEvent::DeviceInfoRefreshed { info: info.clone() });
        (info, failures)
    }

    async fn load_room_status(&self) -> (RoomStatus, usize) {
        let (ping, health) = tokio::join!(self.api.room_ping(), self.api.room_health());
        let (ping, ping_failed) = self.or_placeholder("room ping", ping);
        let (health, health_failed) = self.or_placeholder("room health", health);
        let failures = ping_failed + health_failed;

        let status = RoomStatus::merge(&ping, &health, failures > 0);
        debug!(
            reachable = status.counts.reachable,
            unreachable = status.counts.unreachable,
            view = ?status.view,
            "Room status merged"
        );
        self.bus.publish(BusEvent::RoomStatusRefreshed {
            status: status.clone(),
        });
        (status, failures)
    }

    async fn load_hardware_info(&self) -> (HardwareInfo, usize) {
        let result = self.api.hardware_info().await;
        let (info, failures) = self.or_placeholder("hardware info", result);
        self.bus.publish(BusEvent::HardwareInfoRefreshed { info: info.clone() });
        (info, failures)
    }

    pub async fn refresh_device_info(&self) -> DeviceInfo {
        self.load_device_info().await.0
    }

    pub async fn refresh_room_ping(&self) -> PingMap {
        let result = self.api.room_ping().await;
        self.or_placeholder("room ping", result).0
    }

    pub async fn refresh_room_health(&self) -> HealthMap {
        let result = self.api.room_health().await;
        self.or_placeholder("room health", result).0
    }

    /// Ping and health fetched concurrently, then merged
    pub async fn refresh_room_status(&self) -> RoomStatus {
        self.load_room_status().await.0
    }

    pub async fn refresh_hardware_info(&self) -> HardwareInfo {
        self.load_hardware_info().await.0
    }

    pub async fn refresh_device_id(&self) -> String {
        let result = self.api.device_id().await;
        let (id, _) = self.or_placeholder("device id", result);
        self.bus.publish(BusEvent::DeviceIdRefreshed { id: id.clone() });
        id
    }

    pub async fn refresh_software_status(&self) -> Vec<SoftwareStatus> {
        let result = self.api.software_status().await;
        let (statuses, _) = self.or_placeholder("software status", result);
        self.bus.publish(BusEvent::SoftwareStatusRefreshed {
            statuses: statuses.clone(),
        });
        statuses
    }

    pub async fn refresh_runners(&self) -> Vec<RunnerInfo> {
        let result = self.api.runners().await;
        let (runners, _) = self.or_placeholder("runners", result);
        self.bus.publish(BusEvent::RunnersRefreshed {
            runners: runners.clone(),
        });
        runners
    }

    pub async fn refresh_via_info(&self) -> Vec<ViaInfo> {
        let result = self.api.via_info().await;
        let (vias, _) = self.or_placeholder("via info", result);
        self.bus.publish(BusEvent::ViaInfoRefreshed { vias: vias.clone() });
        vias
    }

    /// Device info, room status and hardware, issued concurrently
    pub async fn refresh_all(&self) -> DashboardSnapshot {
        let ((device, f1), (room, f2), (hardware, f3)) = tokio::join!(
            self.load_device_info(),
            self.load_room_status(),
            self.load_hardware_info()
        );
        let failures = f1 + f2 + f3;
        info!(
            hostname = %device.hostname,
            devices = room.rows.len(),
            failures,
            "Status refreshed"
        );
        self.bus.publish(BusEvent::RefreshCompleted { failures });

        DashboardSnapshot {
            device,
            room,
            hardware,
            failures,
        }
    }

    /// Everything the dashboard shows, fetched in one concurrent pass
    pub async fn refresh_dashboard(&self) -> DashboardSnapshot {
        let (snapshot, _, _, _, _, _) = tokio::join!(
            self.refresh_all(),
            self.refresh_device_id(),
            self.refresh_software_status(),
            self.refresh_runners(),
            self.refresh_via_info(),
            self.refresh_divider_sensor(),
        );
        snapshot
    }

    /// Refresh once, then on every poll tick and whenever a refresh or
    /// reload is requested on the bus. `None` disables polling.
    /// Should be spawned as a task
    pub async fn run(&self, poll_interval: Option<Duration>, shutdown: CancellationToken) {
        let mut rx = self.bus.subscribe();
        let mut poll = poll_interval.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        info!(?poll_interval, "StatusAggregator refresh loop started");
        self.refresh_and_log("startup").await;

        loop {
            let reason = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = async {
                    match poll.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => "poll".to_string(),
                received = rx.recv() => match received {
                    Ok(BusEvent::RefreshRequested { reason }) => reason,
                    Ok(BusEvent::ReloadRequested { .. }) => "reload".to_string(),
                    Ok(BusEvent::ShuttingDown { .. }) => break,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Refresh loop lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            self.refresh_and_log(&reason).await;
        }

        info!("StatusAggregator refresh loop stopped");
    }

    async fn refresh_and_log(&self, reason: &str) {
        debug!("Refreshing ({})", reason);
        let snapshot = self.refresh_dashboard().await;
        let counts = &snapshot.room.counts;
        info!(
            reason,
            reachable = counts.reachable,
            unreachable = counts.unreachable,
            health_errors = counts.health_errors,
            failures = snapshot.failures,
            "Dashboard summary"
        );
    }

    /// Resolve the room's divider sensor. `None` when the room has none
    /// or any lookup in the chain fails.
    pub async fn refresh_divider_sensor(&self) -> Option<DividerSensorInfo> {
        let info = self.lookup_divider_sensor().await;
        self.bus.publish(BusEvent::DividerSensorRefreshed { info: info.clone() });
        info
    }

    async fn lookup_divider_sensor(&self) -> Option<DividerSensorInfo> {
        let device = recover_device_info(self.api.device_info().await)
            .map_err(|e| debug!("Divider lookup: no device info: {}", e))
            .ok()?;
        let Some((building, room)) = device.building_and_room() else {
            debug!(hostname = %device.hostname, "Divider lookup: hostname has no building/room");
            return None;
        };

        let config = self
            .api
            .room_configuration(building, room)
            .await
            .map_err(|e| debug!("Divider lookup: no room configuration: {}", e))
            .ok()?;
        let Some(address) = config.divider_sensor_address().map(str::to_string) else {
            debug!(building, room, "No divider sensor in room");
            return None;
        };

        let state = self
            .api
            .divider_state(&address)
            .await
            .map_err(|e| warn!(%address, "Divider state lookup failed: {}", e))
            .ok()?;
        let preset = self
            .api
            .divider_preset(&address, &device.hostname)
            .await
            .map_err(|e| warn!(%address, "Divider preset lookup failed: {}", e))
            .ok()?;
        let pins = self
            .api
            .divider_pins(divider_system_id(&address))
            .await
            .map_err(|e| warn!(%address, "Divider pin lookup failed: {}", e))
            .ok()?;

        Some(DividerSensorInfo {
            status: divider_status_from_keys(&state),
            preset: if preset.is_empty() {
                UNKNOWN_VALUE.to_string()
            } else {
                preset
            },
            pin: pins
                .first()
                .and_then(|p| p.label())
                .unwrap_or_else(|| UNKNOWN_VALUE.to_string()),
            address,
        })
    }
}
