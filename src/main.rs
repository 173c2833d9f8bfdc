//! Device Dash - operations dashboard for room-control devices
//!
//! Usage:
//!   device-dash [watch]
//!   device-dash status
//!   device-dash action <name> [via-address]
//!   device-dash help

use device_dash::actions::{ActionDispatcher, DeviceAction};
use device_dash::aggregator::{DashboardSnapshot, StatusAggregator};
use device_dash::api::models::{DividerSensorInfo, RunnerInfo};
use device_dash::api::{DeviceApi, HttpDeviceApi};
use device_dash::bus::{self, BusEvent};
use device_dash::config::{self, Config};
use device_dash::format::{
    format_device_field, format_hardware_field, format_temperature, PLACEHOLDER,
};
use device_dash::live::{LiveChannel, TungsteniteTransport};
use device_dash::notify::{BusNotifier, NotificationSink, RecordingNotifier};
use device_dash::state::DashboardStore;

use anyhow::Result;
use std::env;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage:
  device-dash [watch]                     Run the dashboard until Ctrl+C
  device-dash status                      Print one status summary
  device-dash action <name> [address]     Run one device action
  device-dash help                        Show this message

Actions: reboot, flush-dns, resync-db, refresh-containers,
         reset-via <address>, reboot-via <address>";

/// Hardware fields shown by `status`
const HARDWARE_FIELDS: &[(&str, &str)] = &[
    ("CPU", "cpu.usage.avg"),
    ("Memory", "memory.virtual.usedPercent"),
    ("Swap", "memory.swap.usedPercent"),
    ("Disk", "disk.usage.usedPercent"),
    ("Uptime", "host.os.uptime"),
];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "device_dash=debug,reqwest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("watch");

    match command {
        "watch" => watch(config::load_config()?).await,
        "status" => status(config::load_config()?).await,
        "action" => {
            let Some(name) = args.get(1) else {
                eprintln!("{}", USAGE);
                process::exit(2);
            };
            let Some(action) = DeviceAction::from_name(name, args.get(2).map(String::as_str))
            else {
                eprintln!("Unknown action: {}\n\n{}", name, USAGE);
                process::exit(2);
            };
            let code = run_action(config::load_config()?, action).await?;
            process::exit(code);
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            process::exit(2);
        }
    }
}

/// Long-running mode: store, live channel and periodic refreshes
async fn watch(config: Config) -> Result<()> {
    tracing::info!(
        "Starting Device Dash v{} ({})",
        env!("DASH_VERSION"),
        env!("DASH_GIT_SHA")
    );
    tracing::info!("Device API at {}", config.device.base_url);

    let shutdown = CancellationToken::new();
    let bus = bus::create_bus();

    let api: Arc<dyn DeviceApi> = Arc::new(HttpDeviceApi::new(&config.device)?);
    let notifier: Arc<dyn NotificationSink> = Arc::new(BusNotifier::new(bus.clone()));
    let aggregator = Arc::new(StatusAggregator::new(api, notifier, bus.clone()));

    let store = Arc::new(DashboardStore::new(
        bus.clone(),
        config.live.event_log_capacity,
    ));
    let store_task = {
        let store = store.clone();
        tokio::spawn(async move { store.run().await })
    };

    let live_url = config.live_url()?;
    tracing::info!("Live channel at {}", live_url);
    let live = Arc::new(LiveChannel::new(
        Arc::new(
            TungsteniteTransport::new(live_url)
                .with_connect_timeout(config.live.connect_timeout()),
        ),
        bus.clone(),
        &config.live,
        config.dashboard_url(),
    ));
    let live_task = {
        let live = live.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { live.run(shutdown).await })
    };

    let refresh_task = {
        let poll_interval = config.poll_interval();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { aggregator.run(poll_interval, shutdown).await })
    };

    shutdown_signal().await;

    tracing::info!("Shutting down...");
    bus.publish(BusEvent::ShuttingDown {
        reason: Some("signal".to_string()),
    });
    shutdown.cancel();

    for (name, task) in [
        ("live channel", live_task),
        ("refresh loop", refresh_task),
        ("store", store_task),
    ] {
        if let Err(e) = task.await {
            tracing::warn!("{} task ended abnormally: {}", name, e);
        }
    }
    let busy = store.busy_actions().await;
    if !busy.is_empty() {
        tracing::warn!(?busy, "Actions still in flight at shutdown");
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

/// One-shot status summary on stdout
async fn status(config: Config) -> Result<()> {
    let bus = bus::create_bus();
    let api: Arc<dyn DeviceApi> = Arc::new(HttpDeviceApi::new(&config.device)?);
    let notifier = Arc::new(RecordingNotifier::new());
    let aggregator = StatusAggregator::new(api, notifier.clone(), bus);

    let (snapshot, divider, runners) = tokio::join!(
        aggregator.refresh_all(),
        aggregator.refresh_divider_sensor(),
        aggregator.refresh_runners(),
    );

    print_summary(&snapshot, divider.as_ref(), &runners);
    for notification in notifier.take() {
        eprintln!("{}", notification);
    }

    Ok(())
}

fn print_summary(
    snapshot: &DashboardSnapshot,
    divider: Option<&DividerSensorInfo>,
    runners: &[RunnerInfo],
) {
    let device = &snapshot.device;
    println!("Device");
    for (label, path) in [
        ("Hostname", "hostname"),
        ("ID", "id"),
        ("IP", "ip"),
        ("Internet", "internet-connectivity"),
        ("DHCP", "dhcp.enabled"),
    ] {
        println!("  {:<10} {}", label, format_device_field(device, path));
    }

    println!("Hardware");
    for (label, path) in HARDWARE_FIELDS {
        println!(
            "  {:<10} {}",
            label,
            format_hardware_field(&snapshot.hardware, path)
        );
    }
    let temperature = snapshot
        .hardware
        .highest_temperature()
        .map(|t| format_temperature(Some(t)))
        .unwrap_or_else(|| PLACEHOLDER.to_string());
    println!("  {:<10} {}", "Temp", temperature);

    let counts = &snapshot.room.counts;
    println!(
        "Room ({} reachable, {} unreachable, {} health errors)",
        counts.reachable, counts.unreachable, counts.health_errors
    );
    for row in &snapshot.room.rows {
        let health = row.health.as_deref().unwrap_or(PLACEHOLDER);
        let reachable = if row.is_reachable() { "up" } else { "down" };
        println!("  {:<24} {:<5} {}", row.device_id, reachable, health);
    }

    match divider {
        Some(info) => println!(
            "Divider {} {} (preset {}, pin {})",
            info.address, info.status, info.preset, info.pin
        ),
        None => println!("Divider {}", PLACEHOLDER),
    }

    if !runners.is_empty() {
        println!("Runners");
        for runner in runners {
            let error = runner.last_run_error.as_deref().unwrap_or("");
            println!("  {:<24} {}", runner.id, error);
        }
    }
}

/// Run one action and map its outcome to an exit code
async fn run_action(config: Config, action: DeviceAction) -> Result<i32> {
    let shutdown = CancellationToken::new();
    let api: Arc<dyn DeviceApi> = Arc::new(HttpDeviceApi::new(&config.device)?);
    let notifier = Arc::new(RecordingNotifier::new());
    let dispatcher = ActionDispatcher::new(
        api,
        notifier,
        bus::create_bus(),
        config.actions.clone(),
        shutdown.clone(),
    );

    let report = dispatcher.invoke(action.clone()).await;
    // Nothing left to refresh in one-shot mode
    shutdown.cancel();

    match report {
        Some(report) => {
            println!("{}", report.notification());
            Ok(if report.outcome.is_failure() { 1 } else { 0 })
        }
        None => {
            eprintln!("{} is already running", action);
            Ok(1)
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
