//! Live channel against a real WebSocket server
//!
//! These tests verify:
//! - Frames flow from the socket to the bus
//! - Server-initiated close leads to a reconnect
//! - Refused connections keep the channel retrying
//! - A stalled handshake gives up after the connect timeout
//! - The dashboard store follows channel state

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use device_dash::bus::{create_bus, BusEvent, SharedBus};
use device_dash::config::LiveConfig;
use device_dash::live::{ChannelState, LiveChannel, LiveError, LiveTransport, TungsteniteTransport};
use device_dash::state::DashboardStore;

// =============================================================================
// Test utilities
// =============================================================================

/// WebSocket server that sends `frames` to every client, then either
/// closes or waits for the client to leave
async fn start_ws_server(
    frames: Vec<&'static str>,
    close: bool,
) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let frames = frames.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                for frame in frames {
                    if ws.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                if close {
                    let _ = ws.close(None).await;
                } else {
                    while let Some(Ok(_)) = ws.next().await {}
                }
            });
        }
    });

    (addr, connections)
}

fn fast_config() -> LiveConfig {
    LiveConfig {
        reconnect_delay_ms: 100,
        event_delay_ms: 20,
        ..Default::default()
    }
}

fn spawn_channel(
    url: String,
    bus: SharedBus,
    shutdown: &CancellationToken,
) -> (Arc<LiveChannel>, tokio::task::JoinHandle<()>) {
    let live = Arc::new(LiveChannel::new(
        Arc::new(TungsteniteTransport::new(url)),
        bus,
        &fast_config(),
        "http://127.0.0.1:10000/dash",
    ));
    let task = {
        let live = live.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { live.run(shutdown).await })
    };
    (live, task)
}

/// Wait for a specific event type with timeout
async fn expect_event<F>(
    rx: &mut broadcast::Receiver<BusEvent>,
    predicate: F,
    timeout_ms: u64,
) -> Option<BusEvent>
where
    F: Fn(&BusEvent) -> bool,
{
    let deadline = Duration::from_millis(timeout_ms);
    match timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    {
        Ok(event) => event,
        Err(_) => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_frames_reach_the_bus() {
    let (addr, _connections) = start_ws_server(vec![
        "keepalive",
        r#"{"generating-system":"ITB-1101-CP1","key":"power","value":"on","event-tags":["core-state"]}"#,
        "screenoff",
    ], false)
    .await;
    let bus = create_bus();
    let mut rx = bus.subscribe();
    let shutdown = CancellationToken::new();
    let (_live, task) = spawn_channel(format!("ws://{}/websocket", addr), bus, &shutdown);

    let event = expect_event(&mut rx, |e| matches!(e, BusEvent::LiveEvent { .. }), 2000)
        .await
        .expect("live event");
    let BusEvent::LiveEvent { event } = event else {
        unreachable!()
    };
    assert_eq!(event.key, "power");
    assert_eq!(event.value, "on");
    assert!(event.has_tag("core-state"));

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_screenoff_and_reconnect_after_close() {
    let (addr, connections) = start_ws_server(vec!["screenoff"], true).await;
    let bus = create_bus();
    let mut rx = bus.subscribe();
    let shutdown = CancellationToken::new();
    let (_live, task) = spawn_channel(format!("ws://{}/websocket", addr), bus, &shutdown);

    assert!(
        expect_event(&mut rx, |e| matches!(e, BusEvent::ScreenOff), 2000)
            .await
            .is_some()
    );
    assert!(expect_event(
        &mut rx,
        |e| matches!(e, BusEvent::LiveChannelState { state: ChannelState::Retrying }),
        2000
    )
    .await
    .is_some());
    // Second connection after the reconnect delay
    assert!(
        expect_event(&mut rx, |e| matches!(e, BusEvent::LiveChannelOpened), 2000)
            .await
            .is_some()
    );
    assert!(connections.load(Ordering::SeqCst) >= 2);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_refused_connection_keeps_retrying() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let bus = create_bus();
    let mut rx = bus.subscribe();
    let shutdown = CancellationToken::new();
    let (live, task) = spawn_channel(format!("ws://127.0.0.1:{}/websocket", port), bus, &shutdown);

    // Fails, tries again after the delay, fails again
    for expected in [
        ChannelState::Retrying,
        ChannelState::Connecting,
        ChannelState::Retrying,
    ] {
        assert!(expect_event(
            &mut rx,
            |e| matches!(e, BusEvent::LiveChannelState { state } if *state == expected),
            2000
        )
        .await
        .is_some());
    }
    assert_ne!(live.current_state(), ChannelState::Open);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_stalled_handshake_times_out() {
    // Accepts TCP connections but never answers the upgrade request
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let transport = TungsteniteTransport::new(format!("ws://{}/websocket", addr))
        .with_connect_timeout(Duration::from_millis(200));
    let started = std::time::Instant::now();
    let result = transport.connect().await;

    assert!(matches!(result, Err(LiveError::Connect(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_store_tracks_channel() {
    let (addr, _connections) =
        start_ws_server(vec![r#"{"key":"input","value":"hdmi1"}"#, "refresh"], false).await;
    let bus = create_bus();
    let mut rx = bus.subscribe();
    let store = Arc::new(DashboardStore::new(bus.clone(), 10));
    let store_task = {
        let store = store.clone();
        tokio::spawn(async move { store.run().await })
    };
    let shutdown = CancellationToken::new();
    let (_live, task) = spawn_channel(format!("ws://{}/websocket", addr), bus.clone(), &shutdown);

    assert!(
        expect_event(&mut rx, |e| matches!(e, BusEvent::LiveEvent { .. }), 2000)
            .await
            .is_some()
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = store.snapshot().await;
    assert_eq!(snapshot.events.len(), 1);
    assert_eq!(snapshot.events[0].value, "hdmi1");
    assert_eq!(
        snapshot.reload_url.as_deref(),
        Some("http://127.0.0.1:10000/dash")
    );

    shutdown.cancel();
    task.await.unwrap();
    bus.publish(BusEvent::ShuttingDown { reason: None });
    store_task.await.unwrap();
}
