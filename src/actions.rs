//! Action dispatcher: runs device maintenance actions with per-action
//! busy flags and success / soft-success / failure classification.
//!
//! Reboot, database resync and container refresh interrupt the service
//! that would carry their own response. For those, a dropped connection
//! or a gateway error means the device is restarting and is reported as
//! a soft success.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{ActionResponse, ApiError, DeviceApi};
use crate::bus::{BusEvent, Notification, NotificationLevel, SharedBus};
use crate::config::ActionConfig;
use crate::notify::NotificationSink;

/// Body substring that marks a successful action (matched ignoring case)
pub const SUCCESS_MARKER: &str = "success";

/// Detail shown when the device sent no body
pub const NO_RESPONSE: &str = "No response";

// =============================================================================
// Actions
// =============================================================================

/// User-triggered device action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "action", content = "address", rename_all = "kebab-case")]
pub enum DeviceAction {
    Reboot,
    FlushDns,
    ResyncDb,
    RefreshContainers,
    ResetVia(String),
    RebootVia(String),
}

/// How an action's raw result maps to an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// 2xx with success marker, anything else fails
    Standard,
    /// Expected to interrupt its own connection
    Disruptive,
    /// Any 2xx counts
    FireAndForget,
}

impl DeviceAction {
    /// Parse a CLI action name
    pub fn from_name(name: &str, address: Option<&str>) -> Option<Self> {
        let address = address.filter(|a| !a.is_empty()).map(str::to_string);
        match name {
            "reboot" => Some(DeviceAction::Reboot),
            "flush-dns" => Some(DeviceAction::FlushDns),
            "resync-db" => Some(DeviceAction::ResyncDb),
            "refresh-containers" => Some(DeviceAction::RefreshContainers),
            "reset-via" => address.map(DeviceAction::ResetVia),
            "reboot-via" => address.map(DeviceAction::RebootVia),
            _ => None,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            DeviceAction::FlushDns => ActionKind::Standard,
            DeviceAction::Reboot | DeviceAction::ResyncDb | DeviceAction::RefreshContainers => {
                ActionKind::Disruptive
            }
            DeviceAction::ResetVia(_) | DeviceAction::RebootVia(_) => ActionKind::FireAndForget,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeviceAction::Reboot => "Reboot",
            DeviceAction::FlushDns => "Flush DNS",
            DeviceAction::ResyncDb => "Resync Database",
            DeviceAction::RefreshContainers => "Refresh Containers",
            DeviceAction::ResetVia(_) => "Reset Via",
            DeviceAction::RebootVia(_) => "Reboot Via",
        }
    }

    /// Re-entrancy key; via actions are gated per address
    pub fn busy_key(&self) -> String {
        match self {
            DeviceAction::Reboot => "reboot".to_string(),
            DeviceAction::FlushDns => "flush-dns".to_string(),
            DeviceAction::ResyncDb => "resync-db".to_string(),
            DeviceAction::RefreshContainers => "refresh-containers".to_string(),
            DeviceAction::ResetVia(address) => format!("reset-via:{}", address),
            DeviceAction::RebootVia(address) => format!("reboot-via:{}", address),
        }
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAction::ResetVia(address) | DeviceAction::RebootVia(address) => {
                write!(f, "{} {}", self.label(), address)
            }
            _ => write!(f, "{}", self.label()),
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionOutcome {
    Success,
    SoftSuccess,
    Failure,
}

impl ActionOutcome {
    pub fn is_failure(self) -> bool {
        self == ActionOutcome::Failure
    }

    pub fn level(self) -> NotificationLevel {
        match self {
            ActionOutcome::Success => NotificationLevel::Info,
            ActionOutcome::SoftSuccess => NotificationLevel::Warning,
            ActionOutcome::Failure => NotificationLevel::Error,
        }
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Success => write!(f, "success"),
            ActionOutcome::SoftSuccess => write!(f, "soft-success"),
            ActionOutcome::Failure => write!(f, "failure"),
        }
    }
}

pub fn contains_success_marker(body: &str) -> bool {
    body.to_lowercase().contains(SUCCESS_MARKER)
}

/// 502/503/504: the service is restarting behind its proxy
fn is_gateway_status(status: u16) -> bool {
    matches!(status, 502..=504)
}

/// Map a raw action result to an outcome
pub fn classify(kind: ActionKind, result: &Result<ActionResponse, ApiError>) -> ActionOutcome {
    match (kind, result) {
        (ActionKind::Standard, Ok(r)) if r.is_success() && contains_success_marker(&r.body) => {
            ActionOutcome::Success
        }
        (ActionKind::Standard, _) => ActionOutcome::Failure,

        (ActionKind::Disruptive, Ok(r)) if r.is_success() => {
            if contains_success_marker(&r.body) {
                ActionOutcome::Success
            } else {
                ActionOutcome::SoftSuccess
            }
        }
        (ActionKind::Disruptive, Ok(r)) if is_gateway_status(r.status) => ActionOutcome::SoftSuccess,
        (ActionKind::Disruptive, Ok(_)) => ActionOutcome::Failure,
        (ActionKind::Disruptive, Err(ApiError::InvalidUrl(_))) => ActionOutcome::Failure,
        (ActionKind::Disruptive, Err(_)) => ActionOutcome::SoftSuccess,

        (ActionKind::FireAndForget, Ok(r)) if r.is_success() => ActionOutcome::Success,
        (ActionKind::FireAndForget, _) => ActionOutcome::Failure,
    }
}

/// Result of one completed invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionReport {
    pub action: DeviceAction,
    pub outcome: ActionOutcome,
    /// HTTP status, absent when no response arrived
    pub status: Option<u16>,
    /// Short status text ("Success", "Request sent", "Failed (HTTP 500)")
    pub summary: String,
    /// Response text or error detail
    pub detail: String,
    pub elapsed: Duration,
}

impl ActionReport {
    pub fn from_result(
        action: DeviceAction,
        result: &Result<ActionResponse, ApiError>,
        elapsed: Duration,
    ) -> Self {
        let outcome = classify(action.kind(), result);
        let (status, detail) = match result {
            Ok(r) => (Some(r.status), response_detail(r)),
            Err(e) => (None, e.to_string()),
        };
        let summary = match (outcome, status) {
            (ActionOutcome::Success, _) => "Success".to_string(),
            (ActionOutcome::SoftSuccess, Some(s)) if is_gateway_status(s) => {
                format!("Request sent (HTTP {}, service restarting)", s)
            }
            (ActionOutcome::SoftSuccess, Some(_)) => "Request sent".to_string(),
            (ActionOutcome::SoftSuccess, None) => "Request sent, no response".to_string(),
            (ActionOutcome::Failure, Some(s)) => format!("Failed (HTTP {})", s),
            (ActionOutcome::Failure, None) => "Failed".to_string(),
        };

        Self {
            action,
            outcome,
            status,
            summary,
            detail,
            elapsed,
        }
    }

    /// The single user-facing notification for this invocation
    pub fn notification(&self) -> Notification {
        Notification::new(
            self.outcome.level(),
            self.action.to_string(),
            format!("{}: {}", self.summary, self.detail),
        )
    }
}

fn response_detail(response: &ActionResponse) -> String {
    let body = response.body.trim();
    if !body.is_empty() {
        body.to_string()
    } else if response.status == 202 {
        "Accepted (202)".to_string()
    } else {
        NO_RESPONSE.to_string()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Clears a busy key when dropped, whatever path the invocation took.
/// An invocation dropped before `finish` announces `ActionCancelled`.
struct BusyGuard<'a> {
    busy: &'a Mutex<HashSet<String>>,
    bus: &'a SharedBus,
    key: String,
    label: String,
    finished: bool,
}

impl BusyGuard<'_> {
    fn finish(mut self, report: ActionReport) {
        self.finished = true;
        let bus = self.bus;
        drop(self);
        bus.publish(BusEvent::ActionFinished { report });
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        if !self.finished {
            debug!(action = %self.label, "Action cancelled before completion");
            self.bus.publish(BusEvent::ActionCancelled {
                action: std::mem::take(&mut self.label),
            });
        }
    }
}

/// Runs device actions; at most one in flight per busy key
pub struct ActionDispatcher {
    api: Arc<dyn DeviceApi>,
    notifier: Arc<dyn NotificationSink>,
    bus: SharedBus,
    config: ActionConfig,
    busy: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl ActionDispatcher {
    pub fn new(
        api: Arc<dyn DeviceApi>,
        notifier: Arc<dyn NotificationSink>,
        bus: SharedBus,
        config: ActionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            api,
            notifier,
            bus,
            config,
            busy: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    pub fn is_busy(&self, action: &DeviceAction) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&action.busy_key())
    }

    /// Busy keys currently held, sorted
    pub fn busy_actions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn try_acquire(&self, action: &DeviceAction) -> Option<BusyGuard<'_>> {
        let key = action.busy_key();
        let inserted = self
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        if !inserted {
            return None;
        }
        Some(BusyGuard {
            busy: &self.busy,
            bus: &self.bus,
            key,
            label: action.to_string(),
            finished: false,
        })
    }

    /// Run an action. Returns `None` when the same action is already in
    /// flight: no request is made and no notification raised.
    pub async fn invoke(&self, action: DeviceAction) -> Option<ActionReport> {
        let Some(guard) = self.try_acquire(&action) else {
            debug!(action = %action, "Action already in progress, ignoring");
            return None;
        };
        self.bus.publish(BusEvent::ActionStarted {
            action: action.to_string(),
        });

        let timeout = self.config.timeout_for(&action);
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.api.perform(&action, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        };
        let report = ActionReport::from_result(action, &result, started.elapsed());
        info!(
            action = %report.action,
            outcome = %report.outcome,
            status = ?report.status,
            "Action finished"
        );

        self.notifier
            .notify(report.notification().with_ttl(self.config.notification_ttl()));

        if !report.outcome.is_failure() {
            if let Some(delay) = self.config.refresh_delay_for(&report.action) {
                self.schedule_refresh(report.action.to_string(), delay);
            }
        }

        guard.finish(report.clone());
        Some(report)
    }

    /// Publish `RefreshRequested` after `delay` unless shut down first
    fn schedule_refresh(&self, reason: String, delay: Duration) {
        debug!(%reason, ?delay, "Scheduling delayed refresh");
        self.bus.publish(BusEvent::RefreshScheduled {
            reason: reason.clone(),
            delay,
        });

        let bus = self.bus.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(%reason, "Delayed refresh cancelled by shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    bus.publish(BusEvent::RefreshRequested { reason });
                }
            }
        });
    }
}
