//! Wire types of the on-device HTTP API and the live event channel.
//!
//! Every field tolerates being absent or `null`: a partial payload renders
//! as placeholders, never as a decode failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Device identifier used as key by the room endpoints (e.g. "ITB-1101-D1")
pub type DeviceId = String;

/// Ping results keyed by device identifier
pub type PingMap = BTreeMap<DeviceId, PingResult>;

/// Free-text health keyed by device identifier
pub type HealthMap = BTreeMap<DeviceId, String>;

/// Deserialize `null` as the type's default.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// =============================================================================
// Device
// =============================================================================

/// Snapshot returned by `GET device`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    #[serde(deserialize_with = "null_default")]
    pub hostname: String,
    #[serde(deserialize_with = "null_default")]
    pub id: String,
    #[serde(deserialize_with = "null_default")]
    pub ip: String,
    #[serde(rename = "internet-connectivity", deserialize_with = "null_default")]
    pub internet_connectivity: bool,
    #[serde(deserialize_with = "null_default")]
    pub dhcp: DhcpInfo,
    /// Software statuses the device embeds in its info response
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub status: Vec<SoftwareStatus>,
    /// Set on partial responses (non-2xx with a body)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl DeviceInfo {
    /// Split a `BLDG-ROOM-DEVICE` hostname into building and room number.
    pub fn building_and_room(&self) -> Option<(&str, &str)> {
        let mut parts = self.hostname.split('-');
        let building = parts.next().filter(|s| !s.is_empty())?;
        let room = parts.next().filter(|s| !s.is_empty())?;
        Some((building, room))
    }

    /// True when no identifying field was delivered
    pub fn is_empty(&self) -> bool {
        self.hostname.is_empty() && self.id.is_empty() && self.ip.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpInfo {
    #[serde(deserialize_with = "null_default")]
    pub enabled: bool,
    #[serde(deserialize_with = "null_default")]
    pub toggleable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// One microservice status entry (`GET device/status`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareStatus {
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub bin: String,
    #[serde(deserialize_with = "null_default")]
    pub statuscode: String,
    #[serde(deserialize_with = "null_default")]
    pub version: String,
    #[serde(deserialize_with = "null_default")]
    pub uptime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

// =============================================================================
// Runners / Via
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerTrigger {
    #[serde(rename = "type", deserialize_with = "null_default")]
    pub trigger_type: String,
    pub at: Option<String>,
    pub every: Option<String>,
    #[serde(rename = "match")]
    pub match_: Option<Value>,
}

/// Background job runner on the device (`GET device/runners`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerInfo {
    #[serde(deserialize_with = "null_default")]
    pub id: String,
    #[serde(deserialize_with = "null_default")]
    pub trigger: RunnerTrigger,
    pub context: Option<Value>,
    #[serde(rename = "last-run-start-time", deserialize_with = "lenient_timestamp")]
    pub last_run_start_time: Option<DateTime<Utc>>,
    #[serde(rename = "last-run-duration")]
    pub last_run_duration: Option<String>,
    #[serde(rename = "last-run-error")]
    pub last_run_error: Option<String>,
    #[serde(rename = "currently-running")]
    pub currently_running: Option<bool>,
    #[serde(rename = "run-count", deserialize_with = "null_default")]
    pub run_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViaInfo {
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub address: String,
}

// =============================================================================
// Room status
// =============================================================================

/// Wire shape of a ping entry; `packets-lost` is recomputed.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPingResult {
    error: Option<String>,
    ip: Option<String>,
    #[serde(rename = "packets-sent", deserialize_with = "null_default")]
    packets_sent: i64,
    #[serde(rename = "packets-received", deserialize_with = "null_default")]
    packets_received: i64,
    #[serde(rename = "average-round-trip")]
    average_round_trip: Option<String>,
}

fn clamp_count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// Ping result for one device.
///
/// Invariant: `packets_lost == packets_sent.saturating_sub(packets_received)`,
/// so `packets_lost <= packets_sent`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawPingResult")]
pub struct PingResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(rename = "packets-sent")]
    pub packets_sent: u32,
    #[serde(rename = "packets-received")]
    pub packets_received: u32,
    #[serde(rename = "packets-lost")]
    pub packets_lost: u32,
    /// Formatted by the device, shown as-is
    #[serde(rename = "average-round-trip", skip_serializing_if = "Option::is_none")]
    pub average_round_trip: Option<String>,
}

impl From<RawPingResult> for PingResult {
    fn from(raw: RawPingResult) -> Self {
        Self::new(
            raw.ip,
            clamp_count(raw.packets_sent),
            clamp_count(raw.packets_received),
        )
        .with_error(raw.error)
        .with_round_trip(raw.average_round_trip)
    }
}

impl PingResult {
    pub fn new(ip: Option<String>, packets_sent: u32, packets_received: u32) -> Self {
        Self {
            error: None,
            ip,
            packets_sent,
            packets_received,
            packets_lost: packets_sent.saturating_sub(packets_received),
            average_round_trip: None,
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error.filter(|e| !e.is_empty());
        self
    }

    pub fn with_round_trip(mut self, average_round_trip: Option<String>) -> Self {
        self.average_round_trip = average_round_trip.filter(|s| !s.is_empty());
        self
    }

    /// A device is reachable iff at least one packet came back
    pub fn is_reachable(&self) -> bool {
        self.packets_received > 0
    }
}

/// Build a ping map from the raw `room/ping` object.
///
/// Entries with an empty key or a `null` value are dropped, as are
/// entries that do not decode (logged).
pub fn parse_ping_map(value: Value) -> Result<PingMap, serde_json::Error> {
    let raw: BTreeMap<String, Value> = serde_json::from_value(value)?;
    let mut map = PingMap::new();
    for (key, val) in raw {
        if key.is_empty() || val.is_null() {
            continue;
        }
        match serde_json::from_value::<PingResult>(val) {
            Ok(result) => {
                map.insert(key, result);
            }
            Err(e) => warn!(device = %key, "Dropping undecodable ping entry: {}", e),
        }
    }
    Ok(map)
}

/// Build a health map from the raw `room/health` object.
///
/// Entries with an empty key or an empty/non-string value are dropped.
pub fn parse_health_map(value: Value) -> Result<HealthMap, serde_json::Error> {
    let raw: BTreeMap<String, Value> = serde_json::from_value(value)?;
    let mut map = HealthMap::new();
    for (key, val) in raw {
        if key.is_empty() {
            continue;
        }
        match val {
            Value::String(s) if !s.is_empty() => {
                map.insert(key, s);
            }
            Value::Null | Value::String(_) => {}
            other => debug!(device = %key, "Ignoring non-string health value: {}", other),
        }
    }
    Ok(map)
}

/// "healthy" (trimmed, any case) is the only non-error health state
pub fn is_healthy(health: &str) -> bool {
    health.trim().eq_ignore_ascii_case("healthy")
}

// =============================================================================
// Hardware
// =============================================================================

/// Nested hardware snapshot (`GET device/hardwareinfo`).
///
/// The device sends loosely typed maps (`host`, `cpu`, `memory`, `disk`,
/// `network`, `docker`, `procs`), so the snapshot stays JSON and is read
/// through dotted paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareInfo(pub Value);

impl HardwareInfo {
    /// Resolve a dotted path such as `memory.swap.usedPercent`.
    /// Numeric segments index into arrays (`docker.stats.0.name`).
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut current = &self.0;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    /// Numeric leaf; numeric strings are accepted
    pub fn number(&self, path: &str) -> Option<f64> {
        value_as_f64(self.field(path)?)
    }

    /// Highest finite reading under `host.temperature`
    pub fn highest_temperature(&self) -> Option<f64> {
        self.field("host.temperature")?
            .as_object()?
            .values()
            .filter_map(value_as_f64)
            .filter(|t| t.is_finite())
            .fold(None, |max, t| match max {
                Some(m) if m >= t => Some(m),
                _ => Some(t),
            })
    }

    /// Container rows from `docker.stats`
    pub fn docker_containers(&self) -> Vec<DockerContainer> {
        self.field("docker.stats")
            .and_then(Value::as_array)
            .map(|stats| {
                stats
                    .iter()
                    .filter_map(|s| serde_json::from_value(s.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Running container count reported by the device
    pub fn docker_container_count(&self) -> Option<u64> {
        self.field("docker.docker-containers")?.as_u64()
    }
}

pub(crate) fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// One row of `docker.stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerContainer {
    #[serde(alias = "containerID", deserialize_with = "null_default")]
    pub container_id: String,
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub running: bool,
    #[serde(deserialize_with = "null_default")]
    pub status: String,
}

impl DockerContainer {
    /// "running Up 3 hours" / "stopped Exited (1)"
    pub fn describe(&self) -> String {
        let state = if self.running { "running" } else { "stopped" };
        if self.status.is_empty() {
            state.to_string()
        } else {
            format!("{} {}", state, self.status)
        }
    }
}

// =============================================================================
// Divider sensor
// =============================================================================

/// Room configuration from the configuration database
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfiguration {
    #[serde(deserialize_with = "null_default")]
    pub devices: Vec<ConfiguredDevice>,
}

/// Role id marking the room's divider sensor
pub const DIVIDER_SENSOR_ROLE: &str = "DividerSensor";

impl RoomConfiguration {
    /// Address of the first device carrying the divider sensor role
    pub fn divider_sensor_address(&self) -> Option<&str> {
        self.devices
            .iter()
            .find(|d| d.roles.iter().any(|r| r.id == DIVIDER_SENSOR_ROLE))
            .map(|d| d.address.as_str())
            .filter(|a| !a.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfiguredDevice {
    #[serde(rename = "_id", deserialize_with = "null_default")]
    pub id: String,
    #[serde(deserialize_with = "null_default")]
    pub address: String,
    #[serde(deserialize_with = "null_default")]
    pub roles: Vec<DeviceRole>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRole {
    #[serde(rename = "_id", deserialize_with = "null_default")]
    pub id: String,
}

/// Entry of `divider/pins/{system}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DividerPin {
    pub pin: Option<Value>,
}

impl DividerPin {
    /// Pin rendered as text; numbers and strings only. Pin 0 counts as unset.
    pub fn label(&self) -> Option<String> {
        match self.pin.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DividerStatus {
    Connected,
    Disconnected,
    Unknown,
}

impl fmt::Display for DividerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DividerStatus::Connected => write!(f, "connected"),
            DividerStatus::Disconnected => write!(f, "disconnected"),
            DividerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Divider sensor summary, derived from four chained lookups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividerSensorInfo {
    pub address: String,
    pub status: DividerStatus,
    pub preset: String,
    pub pin: String,
}

// =============================================================================
// Live events
// =============================================================================

/// Accept RFC 3339 strings; anything else becomes `None`.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicRoomInfo {
    #[serde(rename = "buildingID", deserialize_with = "null_default")]
    pub building_id: String,
    #[serde(rename = "roomID", deserialize_with = "null_default")]
    pub room_id: String,
}

impl BasicRoomInfo {
    /// Build from "BLDG-ROOM"; other shapes yield an empty value
    pub fn from_room_id(room_id: &str) -> Self {
        let parts: Vec<&str> = room_id.split('-').collect();
        match parts.as_slice() {
            [building, room] => Self {
                building_id: building.to_string(),
                room_id: format!("{}-{}", building, room),
            },
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicDeviceInfo {
    #[serde(rename = "buildingID", deserialize_with = "null_default")]
    pub building_id: String,
    #[serde(rename = "roomID", deserialize_with = "null_default")]
    pub room_id: String,
    #[serde(rename = "deviceID", deserialize_with = "null_default")]
    pub device_id: String,
}

impl BasicDeviceInfo {
    /// Build from "BLDG-ROOM-DEVICE"; other shapes yield an empty value
    pub fn from_device_id(device_id: &str) -> Self {
        let parts: Vec<&str> = device_id.split('-').collect();
        match parts.as_slice() {
            [building, room, device] => Self {
                building_id: building.to_string(),
                room_id: format!("{}-{}", building, room),
                device_id: format!("{}-{}-{}", building, room, device),
            },
            _ => Self::default(),
        }
    }
}

/// JSON event envelope delivered by the live channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveEvent {
    #[serde(rename = "generating-system", deserialize_with = "null_default")]
    pub generating_system: String,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "event-tags", deserialize_with = "null_default")]
    pub event_tags: Vec<String>,
    #[serde(rename = "target-device", deserialize_with = "null_default")]
    pub target_device: BasicDeviceInfo,
    #[serde(rename = "affected-room", deserialize_with = "null_default")]
    pub affected_room: BasicRoomInfo,
    #[serde(deserialize_with = "null_default")]
    pub key: String,
    #[serde(deserialize_with = "null_default")]
    pub value: String,
    #[serde(deserialize_with = "null_default")]
    pub user: String,
    pub data: Option<Value>,
}

impl LiveEvent {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.event_tags.iter().any(|t| t == tag)
    }
}
