//! Event types carried on the dashboard bus.
//!
//! Status refreshes, action feedback, live channel signals and
//! user-facing notifications all travel as `BusEvent` variants so that
//! the store and the CLI observe a single ordered stream.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::actions::ActionReport;
use crate::aggregator::RoomStatus;
use crate::api::models::{
    DeviceInfo, DividerSensorInfo, HardwareInfo, LiveEvent, RunnerInfo, SoftwareStatus, ViaInfo,
};
use crate::live::ChannelState;

/// Default auto-dismiss delay for notifications
pub const DEFAULT_NOTIFICATION_TTL: Duration = Duration::from_secs(5);

static NEXT_NOTIFICATION_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Notifications
// =============================================================================

/// Severity of a user-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationLevel::Info => write!(f, "info"),
            NotificationLevel::Warning => write!(f, "warning"),
            NotificationLevel::Error => write!(f, "error"),
        }
    }
}

/// Transient, dismissible message shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Process-unique id, used for dismissal
    pub id: u64,
    pub level: NotificationLevel,
    /// Short headline (action label or failing endpoint)
    pub title: String,
    /// Status and response detail
    pub message: String,
    /// Auto-dismiss delay
    pub ttl: Duration,
}

impl Notification {
    pub fn new(level: NotificationLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: NEXT_NOTIFICATION_ID.fetch_add(1, Ordering::Relaxed),
            level,
            title: title.into(),
            message: message.into(),
            ttl: DEFAULT_NOTIFICATION_TTL,
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Warning, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Error, title, message)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.level, self.title, self.message)
    }
}

// =============================================================================
// Bus events
// =============================================================================

/// Event types that can be published on the bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum BusEvent {
    // Status aggregator
    DeviceInfoRefreshed { info: DeviceInfo },
    RoomStatusRefreshed { status: RoomStatus },
    HardwareInfoRefreshed { info: HardwareInfo },
    DeviceIdRefreshed { id: String },
    SoftwareStatusRefreshed { statuses: Vec<SoftwareStatus> },
    RunnersRefreshed { runners: Vec<RunnerInfo> },
    ViaInfoRefreshed { vias: Vec<ViaInfo> },
    DividerSensorRefreshed { info: Option<DividerSensorInfo> },
    /// A full refresh pass finished; `failures` counts failed fetches
    RefreshCompleted { failures: usize },

    // Action dispatcher
    ActionStarted { action: String },
    ActionFinished { report: ActionReport },
    /// The invocation was dropped before it finished; its busy flag is clear
    ActionCancelled { action: String },
    /// A delayed refresh was scheduled after a disruptive action
    RefreshScheduled { reason: String, delay: Duration },
    /// Status should be fetched again now
    RefreshRequested { reason: String },

    // Notifications
    Notification(Notification),
    NotificationDismissed { id: u64 },

    // Live update channel
    LiveChannelState { state: ChannelState },
    LiveChannelOpened,
    LiveEvent { event: LiveEvent },
    /// Server asked for a full dashboard reload
    ReloadRequested { url: String },
    ScreenOff,

    // Lifecycle
    ShuttingDown { reason: Option<String> },
}
