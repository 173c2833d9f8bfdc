//! Configuration management

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::actions::DeviceAction;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub actions: ActionConfig,

    #[serde(default)]
    pub live: LiveConfig,

    /// Seconds between background refreshes; 0 disables polling
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            actions: ActionConfig::default(),
            live: LiveConfig::default(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Config {
    /// Live channel URL, derived from the device base URL unless set
    pub fn live_url(&self) -> Result<String> {
        match &self.live.url {
            Some(url) if !url.is_empty() => Ok(url.clone()),
            _ => crate::live::live_url_for(&self.device.base_url, self.live.endpoint)
                .with_context(|| format!("Cannot derive live URL from {}", self.device.base_url)),
        }
    }

    /// Page a "refresh" frame navigates to
    pub fn dashboard_url(&self) -> String {
        match &self.live.dashboard_url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!("{}/dash", self.device.base_url.trim_end_matches('/')),
        }
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub base_url: String,
    pub via_port: u16,
    pub divider_port: u16,
    pub config_db_port: u16,
    pub request_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:10000".to_string(),
            via_port: 8014,
            divider_port: 10000,
            config_db_port: 8000,
            request_timeout_ms: 10_000,
        }
    }
}

/// Per-action client timeouts and post-action refresh delays
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    pub dns_timeout_ms: u64,
    pub refresh_timeout_ms: u64,
    pub resync_timeout_ms: u64,
    pub reboot_timeout_ms: u64,
    pub via_timeout_ms: u64,
    pub reboot_refresh_delay_ms: u64,
    pub resync_refresh_delay_ms: u64,
    pub refresh_refresh_delay_ms: u64,
    pub notification_ttl_ms: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            dns_timeout_ms: 2500,
            refresh_timeout_ms: 2500,
            resync_timeout_ms: 4500,
            reboot_timeout_ms: 2500,
            via_timeout_ms: 5000,
            reboot_refresh_delay_ms: 3000,
            resync_refresh_delay_ms: 1500,
            refresh_refresh_delay_ms: 1500,
            notification_ttl_ms: 5000,
        }
    }
}

impl ActionConfig {
    /// Client-side timeout guarding the action request
    pub fn timeout_for(&self, action: &DeviceAction) -> Duration {
        let ms = match action {
            DeviceAction::Reboot => self.reboot_timeout_ms,
            DeviceAction::FlushDns => self.dns_timeout_ms,
            DeviceAction::ResyncDb => self.resync_timeout_ms,
            DeviceAction::RefreshContainers => self.refresh_timeout_ms,
            DeviceAction::ResetVia(_) | DeviceAction::RebootVia(_) => self.via_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Delay before re-fetching status; `None` for non-disruptive actions
    pub fn refresh_delay_for(&self, action: &DeviceAction) -> Option<Duration> {
        let ms = match action {
            DeviceAction::Reboot => self.reboot_refresh_delay_ms,
            DeviceAction::ResyncDb => self.resync_refresh_delay_ms,
            DeviceAction::RefreshContainers => self.refresh_refresh_delay_ms,
            _ => return None,
        };
        Some(Duration::from_millis(ms))
    }

    pub fn notification_ttl(&self) -> Duration {
        Duration::from_millis(self.notification_ttl_ms)
    }
}

/// Which push endpoint the live channel connects to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveEndpoint {
    /// `/websocket` on the device API port
    #[default]
    Websocket,
    /// `/provisioning/ws`
    Provisioning,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Explicit channel URL; derived from `device.base_url` when unset
    pub url: Option<String>,
    pub endpoint: LiveEndpoint,
    pub reconnect_delay_ms: u64,
    /// Limit on the WebSocket handshake, TCP connect included
    pub connect_timeout_ms: u64,
    pub event_delay_ms: u64,
    pub dashboard_url: Option<String>,
    pub event_log_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: None,
            endpoint: LiveEndpoint::Websocket,
            reconnect_delay_ms: 5000,
            connect_timeout_ms: 5000,
            event_delay_ms: 500,
            dashboard_url: None,
            event_log_capacity: 100,
        }
    }
}

impl LiveConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn event_delay(&self) -> Duration {
        Duration::from_millis(self.event_delay_ms)
    }
}

/// Get config directory (DASH_CONFIG_DIR, XDG_CONFIG_HOME or ~/.config)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DASH_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("device-dash");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config/device-dash");
    }

    // Fallback to current directory
    PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        // Start with defaults
        .set_default("poll_interval_secs", default_poll_interval() as i64)?
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables (DASH_POLL_INTERVAL_SECS, DASH_DEVICE__BASE_URL, etc.)
        .add_source(
            ::config::Environment::with_prefix("DASH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Legacy DASH_HOST: point everything at one device by host name
    if let Ok(host) = std::env::var("DASH_HOST") {
        if !host.is_empty() {
            builder = builder.set_override("device.base_url", format!("http://{}:10000", host))?;
        }
    }

    let config = builder.build()?;

    Ok(config.try_deserialize()?)
}
