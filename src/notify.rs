//! Notification sinks injected into the aggregator and dispatcher.

use std::sync::{Mutex, PoisonError};
use tracing::{error, info, warn};

use crate::bus::{BusEvent, Notification, NotificationLevel, SharedBus};

/// Receives user-facing notifications
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Logs each notification and publishes it on the bus
pub struct BusNotifier {
    bus: SharedBus,
}

impl BusNotifier {
    pub fn new(bus: SharedBus) -> Self {
        Self { bus }
    }
}

impl NotificationSink for BusNotifier {
    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Info => info!(id = notification.id, "{}", notification),
            NotificationLevel::Warning => warn!(id = notification.id, "{}", notification),
            NotificationLevel::Error => error!(id = notification.id, "{}", notification),
        }
        self.bus.publish(BusEvent::Notification(notification));
    }
}

/// Keeps notifications in memory (one-shot CLI commands, tests)
#[derive(Default)]
pub struct RecordingNotifier {
    records: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn notifications(&self) -> Vec<Notification> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain recorded notifications
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}
