//! Device Dash - operations dashboard core for room-control devices
//!
//! This library provides:
//! - Status aggregation over the on-device HTTP API
//! - Device actions with busy tracking and outcome classification
//! - A reconnecting live update channel
//! - Notifications and a bus-driven dashboard store

pub mod actions;
pub mod aggregator;
pub mod api;
pub mod bus;
pub mod config;
pub mod format;
pub mod live;
pub mod notify;
pub mod state;
