//! Display formatting for status values.
//!
//! All formatters are total: absent, `NaN` or infinite input renders as
//! [`PLACEHOLDER`].

use serde_json::Value;

use crate::api::models::{DeviceInfo, HardwareInfo};

/// Rendered for absent or non-finite values
pub const PLACEHOLDER: &str = "-";

/// Rendered for absent device fields
pub const UNKNOWN: &str = "Unknown";

const BYTE_UNITS: [&str; 7] = ["Bytes", "KB", "MB", "GB", "TB", "PB", "EB"];

const BYTE_FIELDS: [&str; 8] = [
    "total", "used", "free", "available", "buffers", "cached", "active", "inactive",
];

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// `12.345` → `"12.35%"`
pub fn format_percent(value: Option<f64>) -> String {
    match finite(value) {
        Some(v) => format!("{:.2}%", v),
        None => PLACEHOLDER.to_string(),
    }
}

/// 1024-based scaling: `0` → `"0 Bytes"`, `1024` → `"1.00 KB"`
pub fn format_bytes(value: Option<f64>) -> String {
    let Some(mut v) = finite(value).filter(|v| *v >= 0.0) else {
        return PLACEHOLDER.to_string();
    };
    // Scale on the displayed value so rounding never shows 1024 of a unit
    let displayed = |v: f64, unit: usize| {
        if unit == 0 {
            v.round()
        } else {
            (v * 100.0).round() / 100.0
        }
    };
    let mut unit = 0;
    while displayed(v, unit) >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0} {}", v, BYTE_UNITS[0])
    } else {
        format!("{:.2} {}", v, BYTE_UNITS[unit])
    }
}

/// Seconds → fractional hours
pub fn format_uptime_hours(seconds: Option<f64>) -> String {
    match finite(seconds) {
        Some(s) => format!("{:.2} hours", s / 3600.0),
        None => PLACEHOLDER.to_string(),
    }
}

pub fn format_temperature(celsius: Option<f64>) -> String {
    match finite(celsius) {
        Some(t) => format!("{:.2}°C", t),
        None => PLACEHOLDER.to_string(),
    }
}

fn yes_no(value: bool) -> String {
    if value { "Yes" } else { "No" }.to_string()
}

/// Formatter chosen for a hardware field path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Temperature,
    Uptime,
    Percent,
    Bytes,
    Plain,
}

impl FieldKind {
    pub fn for_path(path: &str) -> Self {
        let last = path.rsplit('.').next().unwrap_or(path);
        let lower = last.to_ascii_lowercase();

        if path.starts_with("host.temperature.") {
            FieldKind::Temperature
        } else if lower == "uptime" {
            FieldKind::Uptime
        } else if lower.contains("percent") || path.starts_with("cpu.usage.") {
            FieldKind::Percent
        } else if BYTE_FIELDS.contains(&lower.as_str()) || lower.ends_with("bytes") {
            FieldKind::Bytes
        } else {
            FieldKind::Plain
        }
    }

    pub fn format(self, value: Option<f64>) -> String {
        match self {
            FieldKind::Temperature => format_temperature(value),
            FieldKind::Uptime => format_uptime_hours(value),
            FieldKind::Percent => format_percent(value),
            FieldKind::Bytes => format_bytes(value),
            FieldKind::Plain => match finite(value) {
                Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", v as i64),
                Some(v) => format!("{:.2}", v),
                None => PLACEHOLDER.to_string(),
            },
        }
    }
}

/// Render a dotted hardware path (`memory.swap.usedPercent`) for display
pub fn format_hardware_field(info: &HardwareInfo, path: &str) -> String {
    match info.field(path) {
        Some(Value::Number(n)) => FieldKind::for_path(path).format(n.as_f64()),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Bool(b)) => yes_no(*b),
        _ => PLACEHOLDER.to_string(),
    }
}

/// Render a device info field by its wire name (`internet-connectivity`, `dhcp.enabled`)
pub fn format_device_field(info: &DeviceInfo, path: &str) -> String {
    if path == "internet-connectivity" {
        return if info.internet_connectivity {
            "Connected"
        } else {
            "Disconnected"
        }
        .to_string();
    }

    let Ok(root) = serde_json::to_value(info) else {
        return UNKNOWN.to_string();
    };
    let mut current = &root;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return UNKNOWN.to_string(),
        }
    }

    match current {
        Value::Bool(b) => yes_no(*b),
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => UNKNOWN.to_string(),
    }
}
