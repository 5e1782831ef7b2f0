//! A [`BusGateway`][crate::bus::BusGateway] for Linux, backed by BlueZ
//!
//! Requires the `bluez` feature and a running `bluetoothd`.

mod error;
mod gateway;

pub use gateway::BluezGateway;
