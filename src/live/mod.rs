//! Live update channel: a push connection that reconnects forever.
//!
//! States cycle Connecting → Open → Retrying → Connecting with a fixed
//! delay and no terminal failure state. Frames are classified by cheap
//! substring tests before any JSON parsing is attempted.

pub mod transport;

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use futures::StreamExt;

use crate::api::models::LiveEvent;
use crate::bus::{BusEvent, SharedBus};
use crate::config::{LiveConfig, LiveEndpoint};
pub use transport::{FrameStream, LiveError, LiveTransport, TungsteniteTransport};

/// Port of the device's `/websocket` endpoint
pub const LIVE_PORT: u16 = 10000;

/// Decoded events waiting for their display delay
const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    #[default]
    Connecting,
    Open,
    Retrying,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Retrying => write!(f, "retrying"),
        }
    }
}

/// Frame classes, checked in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Keepalive,
    Refresh,
    ScreenOff,
    Event,
}

pub fn classify_frame(frame: &str) -> FrameKind {
    if frame.contains("keepalive") {
        FrameKind::Keepalive
    } else if frame.contains("refresh") {
        FrameKind::Refresh
    } else if frame.contains("screenoff") {
        FrameKind::ScreenOff
    } else {
        FrameKind::Event
    }
}

/// Derive the live channel URL from the device API base URL
pub fn live_url_for(base_url: &str, endpoint: LiveEndpoint) -> Result<String, LiveError> {
    let mut url =
        Url::parse(base_url).map_err(|e| LiveError::InvalidUrl(format!("{}: {}", base_url, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(LiveError::InvalidUrl(format!(
                "{}: unsupported scheme {}",
                base_url, other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| LiveError::InvalidUrl(format!("{}: cannot use {}", base_url, scheme)))?;

    match endpoint {
        LiveEndpoint::Websocket => {
            url.set_port(Some(LIVE_PORT))
                .map_err(|_| LiveError::InvalidUrl(format!("{}: cannot set port", base_url)))?;
            url.set_path("/websocket");
        }
        LiveEndpoint::Provisioning => url.set_path("/provisioning/ws"),
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Reconnecting live channel
pub struct LiveChannel {
    transport: Arc<dyn LiveTransport>,
    bus: SharedBus,
    reconnect_delay: Duration,
    event_delay: Duration,
    dashboard_url: String,
    state_tx: watch::Sender<ChannelState>,
}

impl LiveChannel {
    pub fn new(
        transport: Arc<dyn LiveTransport>,
        bus: SharedBus,
        config: &LiveConfig,
        dashboard_url: impl Into<String>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Connecting);
        Self {
            transport,
            bus,
            reconnect_delay: config.reconnect_delay(),
            event_delay: config.event_delay(),
            dashboard_url: dashboard_url.into(),
            state_tx,
        }
    }

    /// Observe state transitions
    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_replace(state);
        self.bus.publish(BusEvent::LiveChannelState { state });
    }

    /// Connect, pump frames, and reconnect after every close until
    /// `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Live channel started");

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let forwarder = tokio::spawn(forward_events(
            event_rx,
            self.bus.clone(),
            self.event_delay,
            shutdown.clone(),
        ));

        loop {
            self.set_state(ChannelState::Connecting);

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.transport.connect() => result,
            };

            match connected {
                Ok(frames) => {
                    info!("Live channel open");
                    self.set_state(ChannelState::Open);
                    self.bus.publish(BusEvent::LiveChannelOpened);
                    if self.pump(frames, &event_tx, &shutdown).await {
                        break;
                    }
                }
                Err(e) => warn!("Live channel connect failed: {}", e),
            }

            self.set_state(ChannelState::Retrying);
            debug!("Reconnecting live channel in {:?}", self.reconnect_delay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        drop(event_tx);
        if let Err(e) = forwarder.await {
            warn!("Live event forwarder ended abnormally: {}", e);
        }
        info!("Live channel stopped");
    }

    /// Read frames until the connection ends. Returns true on shutdown.
    async fn pump(
        &self,
        mut frames: FrameStream,
        event_tx: &mpsc::Sender<(Instant, LiveEvent)>,
        shutdown: &CancellationToken,
    ) -> bool {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return true,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(text)) => self.handle_frame(&text, event_tx).await,
                Some(Err(e)) => {
                    warn!("Live channel error: {}", e);
                    return false;
                }
                None => {
                    info!("Live channel closed");
                    return false;
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str, event_tx: &mpsc::Sender<(Instant, LiveEvent)>) {
        match classify_frame(text) {
            FrameKind::Keepalive => trace!("keepalive"),
            FrameKind::Refresh => {
                info!(url = %self.dashboard_url, "Live channel requested reload");
                self.bus.publish(BusEvent::ReloadRequested {
                    url: self.dashboard_url.clone(),
                });
            }
            FrameKind::ScreenOff => {
                debug!("Live channel requested screen off");
                self.bus.publish(BusEvent::ScreenOff);
            }
            FrameKind::Event => match serde_json::from_str::<LiveEvent>(text) {
                Ok(event) => {
                    if event_tx.send((Instant::now(), event)).await.is_err() {
                        warn!("Live event forwarder gone, dropping event");
                    }
                }
                Err(e) => error!("Malformed live event ({}): {}", e, text),
            },
        }
    }
}

/// Publish each event once its display delay has elapsed, in arrival order
async fn forward_events(
    mut rx: mpsc::Receiver<(Instant, LiveEvent)>,
    bus: SharedBus,
    delay: Duration,
    shutdown: CancellationToken,
) {
    while let Some((received_at, event)) = rx.recv().await {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(received_at + delay) => {
                bus.publish(BusEvent::LiveEvent { event });
            }
        }
    }
}
