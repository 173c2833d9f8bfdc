//! DashboardStore - single source of truth for dashboard view state
//!
//! - Subscribes to bus events
//! - Applies refresh results, live channel signals and notifications
//! - Expires notifications after their TTL
//! - Provides query interface for the CLI

use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregator::RoomStatus;
use crate::api::models::{
    DeviceInfo, DividerSensorInfo, HardwareInfo, LiveEvent, RunnerInfo, SoftwareStatus, ViaInfo,
};
use crate::bus::{BusEvent, Notification, SharedBus};
use crate::live::ChannelState;

/// How often expired notifications are swept
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Notification with its dismissal deadline
#[derive(Debug, Clone, Serialize)]
pub struct ActiveNotification {
    #[serde(flatten)]
    pub notification: Notification,
    #[serde(skip)]
    pub expires_at: Instant,
}

/// View state of the dashboard, rebuilt from bus events
#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardState {
    pub device: DeviceInfo,
    pub room: RoomStatus,
    pub hardware: HardwareInfo,
    pub divider: Option<DividerSensorInfo>,
    pub device_id: String,
    pub software: Vec<SoftwareStatus>,
    pub runners: Vec<RunnerInfo>,
    pub vias: Vec<ViaInfo>,
    pub channel: ChannelState,
    pub screen_off: bool,
    /// Most recent live events, oldest first
    pub events: VecDeque<LiveEvent>,
    pub notifications: Vec<ActiveNotification>,
    /// Labels of actions in flight
    pub busy: BTreeSet<String>,
    /// A delayed refresh was scheduled and has not completed yet
    pub refresh_pending: bool,
    pub last_refresh_failures: Option<usize>,
    /// Set when the server asked for a reload
    pub reload_url: Option<String>,
}

impl DashboardState {
    /// Apply one bus event. Returns false for events that end the store.
    pub fn apply(&mut self, event: BusEvent, now: Instant, event_log_capacity: usize) -> bool {
        match event {
            BusEvent::DeviceInfoRefreshed { info } => self.device = info,
            BusEvent::RoomStatusRefreshed { status } => self.room = status,
            BusEvent::HardwareInfoRefreshed { info } => self.hardware = info,
            BusEvent::DeviceIdRefreshed { id } => self.device_id = id,
            BusEvent::SoftwareStatusRefreshed { statuses } => self.software = statuses,
            BusEvent::RunnersRefreshed { runners } => self.runners = runners,
            BusEvent::ViaInfoRefreshed { vias } => self.vias = vias,
            BusEvent::DividerSensorRefreshed { info } => self.divider = info,
            BusEvent::RefreshCompleted { failures } => {
                self.last_refresh_failures = Some(failures);
                self.refresh_pending = false;
            }

            BusEvent::ActionStarted { action } => {
                self.busy.insert(action);
            }
            BusEvent::ActionFinished { report } => {
                self.busy.remove(&report.action.to_string());
            }
            BusEvent::ActionCancelled { action } => {
                self.busy.remove(&action);
            }
            BusEvent::RefreshScheduled { .. } => self.refresh_pending = true,
            BusEvent::RefreshRequested { .. } => {}

            BusEvent::Notification(notification) => {
                let expires_at = now + notification.ttl;
                self.notifications.push(ActiveNotification {
                    notification,
                    expires_at,
                });
            }
            BusEvent::NotificationDismissed { id } => {
                self.notifications.retain(|n| n.notification.id != id);
            }

            BusEvent::LiveChannelState { state } => self.channel = state,
            BusEvent::LiveChannelOpened => {}
            BusEvent::LiveEvent { event } => {
                self.events.push_back(event);
                while self.events.len() > event_log_capacity {
                    self.events.pop_front();
                }
            }
            BusEvent::ReloadRequested { url } => self.reload_url = Some(url),
            BusEvent::ScreenOff => self.screen_off = true,

            BusEvent::ShuttingDown { .. } => return false,
        }
        true
    }

    /// Drop notifications whose TTL elapsed; returns their ids
    pub fn prune_expired(&mut self, now: Instant) -> Vec<u64> {
        let expired: Vec<u64> = self
            .notifications
            .iter()
            .filter(|n| n.expires_at <= now)
            .map(|n| n.notification.id)
            .collect();
        self.notifications.retain(|n| n.expires_at > now);
        expired
    }
}

pub struct DashboardStore {
    state: Arc<RwLock<DashboardState>>,
    bus: SharedBus,
    event_log_capacity: usize,
}

impl DashboardStore {
    pub fn new(bus: SharedBus, event_log_capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(DashboardState::default())),
            bus,
            event_log_capacity,
        }
    }

    /// Start the store's event processing loop
    /// Should be spawned as a task
    pub async fn run(&self) {
        let mut rx = self.bus.subscribe();
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);

        info!("DashboardStore started");

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => {
                        let keep_running = self.state.write().await.apply(
                            event,
                            Instant::now(),
                            self.event_log_capacity,
                        );
                        if !keep_running {
                            debug!("DashboardStore received ShuttingDown");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("DashboardStore lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = prune.tick() => {
                    self.prune_expired(Instant::now()).await;
                }
            }
        }

        info!("DashboardStore stopped");
    }

    /// Remove expired notifications and announce their dismissal
    pub async fn prune_expired(&self, now: Instant) -> usize {
        let expired = self.state.write().await.prune_expired(now);
        for id in &expired {
            self.bus.publish(BusEvent::NotificationDismissed { id: *id });
        }
        expired.len()
    }

    /// Dismiss a notification before its TTL; false if unknown
    pub async fn dismiss(&self, id: u64) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            let before = state.notifications.len();
            state.notifications.retain(|n| n.notification.id != id);
            state.notifications.len() != before
        };
        if removed {
            self.bus.publish(BusEvent::NotificationDismissed { id });
        }
        removed
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn snapshot(&self) -> DashboardState {
        self.state.read().await.clone()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.state
            .read()
            .await
            .notifications
            .iter()
            .map(|n| n.notification.clone())
            .collect()
    }

    pub async fn events(&self) -> Vec<LiveEvent> {
        self.state.read().await.events.iter().cloned().collect()
    }

    pub async fn channel_state(&self) -> ChannelState {
        self.state.read().await.channel
    }

    pub async fn screen_off(&self) -> bool {
        self.state.read().await.screen_off
    }

    pub async fn busy_actions(&self) -> Vec<String> {
        self.state.read().await.busy.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionDispatcher, ActionReport, DeviceAction};
    use crate::api::fake::FakeDeviceApi;
    use crate::api::ActionResponse;
    use crate::bus::create_bus;
    use crate::config::ActionConfig;
    use crate::notify::RecordingNotifier;
    use tokio_util::sync::CancellationToken;

    fn event(key: &str) -> LiveEvent {
        LiveEvent {
            key: key.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_event_log_is_capped() {
        let mut state = DashboardState::default();
        let now = Instant::now();
        for key in ["a", "b", "c", "d"] {
            state.apply(BusEvent::LiveEvent { event: event(key) }, now, 3);
        }
        let keys: Vec<&str> = state.events.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_busy_labels_follow_action_events() {
        let mut state = DashboardState::default();
        let now = Instant::now();

        state.apply(
            BusEvent::ActionStarted {
                action: "Reboot".into(),
            },
            now,
            10,
        );
        assert!(state.busy.contains("Reboot"));

        let report = ActionReport::from_result(
            DeviceAction::Reboot,
            &Ok(ActionResponse {
                status: 200,
                body: String::new(),
            }),
            Duration::ZERO,
        );
        state.apply(BusEvent::ActionFinished { report }, now, 10);
        assert!(state.busy.is_empty());
    }

    #[test]
    fn test_screen_off_reload_and_shutdown() {
        let mut state = DashboardState::default();
        let now = Instant::now();

        assert!(state.apply(BusEvent::ScreenOff, now, 10));
        assert!(state.apply(
            BusEvent::ReloadRequested {
                url: "http://localhost:10000/dash".into()
            },
            now,
            10
        ));
        assert!(state.screen_off);
        assert_eq!(state.reload_url.as_deref(), Some("http://localhost:10000/dash"));
        assert!(!state.apply(BusEvent::ShuttingDown { reason: None }, now, 10));
    }

    #[test]
    fn test_refresh_pending_flag() {
        let mut state = DashboardState::default();
        let now = Instant::now();

        state.apply(
            BusEvent::RefreshScheduled {
                reason: "Reboot".into(),
                delay: Duration::from_secs(3),
            },
            now,
            10,
        );
        assert!(state.refresh_pending);
        state.apply(BusEvent::RefreshCompleted { failures: 2 }, now, 10);
        assert!(!state.refresh_pending);
        assert_eq!(state.last_refresh_failures, Some(2));
    }

    #[test]
    fn test_prune_expired_notifications() {
        let mut state = DashboardState::default();
        let now = Instant::now();
        let short = Notification::info("a", "short").with_ttl(Duration::from_secs(1));
        let long = Notification::info("b", "long").with_ttl(Duration::from_secs(10));
        let short_id = short.id;

        state.apply(BusEvent::Notification(short), now, 10);
        state.apply(BusEvent::Notification(long), now, 10);

        assert!(state.prune_expired(now).is_empty());
        assert_eq!(state.prune_expired(now + Duration::from_secs(2)), vec![short_id]);
        assert_eq!(state.notifications.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_applies_bus_events_and_expires_notifications() {
        let bus = create_bus();
        let store = Arc::new(DashboardStore::new(bus.clone(), 100));
        let task = {
            let store = store.clone();
            tokio::spawn(async move { store.run().await })
        };
        tokio::task::yield_now().await;

        bus.publish(BusEvent::Notification(Notification::error("Flush DNS", "Failed")));
        bus.publish(BusEvent::LiveChannelState {
            state: ChannelState::Open,
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.notifications().await.len(), 1);
        assert_eq!(store.channel_state().await, ChannelState::Open);

        // Default TTL is 5s
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.notifications().await.is_empty());

        bus.publish(BusEvent::ShuttingDown { reason: None });
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_invocation_clears_busy_label() {
        let bus = create_bus();
        let store = Arc::new(DashboardStore::new(bus.clone(), 100));
        let task = {
            let store = store.clone();
            tokio::spawn(async move { store.run().await })
        };
        tokio::task::yield_now().await;

        let dispatcher = ActionDispatcher::new(
            Arc::new(FakeDeviceApi {
                action_delay: Duration::from_millis(500),
                ..Default::default()
            }),
            Arc::new(RecordingNotifier::new()),
            bus.clone(),
            ActionConfig::default(),
            CancellationToken::new(),
        );

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            dispatcher.invoke(DeviceAction::FlushDns),
        )
        .await;
        assert!(abandoned.is_err());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(dispatcher.busy_actions().is_empty());
        assert!(store.busy_actions().await.is_empty());

        bus.publish(BusEvent::ShuttingDown { reason: None });
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dismiss() {
        let bus = create_bus();
        let store = DashboardStore::new(bus.clone(), 100);
        let mut rx = bus.subscribe();
        let notification = Notification::warning("Reboot", "Request sent");
        let id = notification.id;

        store
            .state
            .write()
            .await
            .apply(BusEvent::Notification(notification), Instant::now(), 100);

        assert!(store.dismiss(id).await);
        assert!(!store.dismiss(id).await);
        assert!(matches!(
            rx.recv().await.unwrap(),
            BusEvent::NotificationDismissed { id: dismissed } if dismissed == id
        ));
    }
}
