//! Mock servers for integration testing
//!
//! The mock device answers every endpoint the dashboard uses (device API,
//! configuration database, divider sensor, via control) from one listener,
//! so a single port can stand in for all of them.

pub mod device;

pub use device::{MockDevice, MockResponse};
