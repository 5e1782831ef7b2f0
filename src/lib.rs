#![warn(missing_docs)]

//! Gattlink is a [Bluetooth Low Energy] (BLE) GATT client library for [Rust] built around an explicit device
//! lifecycle.
//!
//! Gattlink drives an external Bluetooth management service (on Linux, BlueZ's `bluetoothd`) through an
//! asynchronous object/property/signal [gateway][bus::BusGateway] and turns its out-of-order notifications into a
//! callback-driven object model: [`DeviceManager`] → [`Device`] → [`Service`] → [`Characteristic`]. Each device is a
//! state machine with well-defined states ([`DeviceState`]), bounded service resolution, and uniform handling of
//! requested and unexpected disconnects.
//!
//! [Rust]: https://www.rust-lang.org/
//! [Bluetooth Low Energy]: https://www.bluetooth.com/specifications/specs/
//!
//! # Usage
//!
//! ```rust,no_run
//!# use std::sync::Arc;
//!# use gattlink::{Device, DeviceManager, ManagerConfig, ManagerObserver};
//!# async fn example(gateway: Arc<dyn gattlink::bus::BusGateway>) -> gattlink::Result<()> {
//!struct Scanner;
//!
//!impl ManagerObserver for Scanner {
//!    fn device_discovered(&mut self, device: &mut Device) {
//!        println!("discovered {}", device);
//!    }
//!}
//!
//!let mut manager = DeviceManager::new(gateway, ManagerConfig::default(), Scanner).await?;
//!manager.start_discovery(&[]).await?;
//!manager.run().await?;
//!#    Ok(())
//!# }
//! ```
//!
//! # Overview
//!
//! - Device discovery:
//!   - [Starting][DeviceManager::start_discovery] and [stopping][DeviceManager::stop_discovery] scans
//!   - One [`device_discovered`][ManagerObserver::device_discovered] callback per peer, with a
//!     [factory hook][ManagerObserver::make_device] deciding which peers are managed
//!   - [Registering][DeviceManager::add_device] known peers without discovery
//! - Connection lifecycle:
//!   - [Connecting][Device::connect] and [disconnecting][Device::disconnect], reported through a [`DeviceObserver`]
//!   - Automatic, bounded service resolution after connecting
//! - Accessing remote GATT services:
//!   - The resolved [services][Device::services] and their [characteristics][Service::characteristics]
//!   - [Read][Characteristic::read_value], [write][Characteristic::write_value] (serialized per characteristic),
//!     and [notify][Characteristic::enable_notifications] operations
//!
//! # Event processing
//!
//! All state transitions and all callbacks happen on the task running [`DeviceManager::run`]. Gateway requests and
//! timers run on the Tokio runtime the manager was created in, but only ever post their results back to the
//! manager's queue. Callbacks must therefore return quickly; long-running work belongs on another task, which can
//! hand its result back through [`DispatcherHandle::invoke`].
//!
//! Every operation that involves the peer returns a [`Pending`] in addition to reporting its outcome to the
//! observer. A [`Pending`] resolves exactly once; operations still outstanding when the device disconnects resolve to
//! [`NotConnected`][error::ErrorKind::NotConnected].
//!
//! # Feature flags
//!
//! - `bluez`: a [`BusGateway`][bus::BusGateway] for Linux talking to the system `bluetoothd`.
//! - `serde`: serializing/deserializing addresses, configuration, and characteristic properties.

pub mod btuuid;
pub mod bus;
pub mod error;
pub mod observer;

mod address;
mod characteristic;
mod config;
mod device;
mod dispatch;
mod manager;
mod path;
mod pending;
mod service;

#[cfg(all(target_os = "linux", feature = "bluez"))]
pub mod bluez;

pub use address::MacAddress;
pub use btuuid::BluetoothUuidExt;
pub use bus::PropertyValue;
pub use characteristic::Characteristic;
pub use config::ManagerConfig;
pub use device::Device;
pub use dispatch::{DispatcherHandle, EventDispatcher};
pub use error::Error;
pub use manager::DeviceManager;
pub use observer::{DeviceObserver, ManagerObserver};
pub use path::{ObjectPath, PathKind};
pub use pending::Pending;
pub use service::Service;
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Connection state of a [`Device`].
///
/// `Disconnected → Connecting → Connected → ResolvingServices → ServicesResolved`, with `Disconnecting` leading back
/// to `Disconnected`. A failed connection attempt returns to `Disconnected` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceState {
    /// No connection
    Disconnected,
    /// A connect request is outstanding
    Connecting,
    /// Connected; service resolution is about to start
    Connected,
    /// Connected and waiting for the GATT tree
    ResolvingServices,
    /// Connected, with [`Device::services`] available
    ServicesResolved,
    /// A disconnect request is outstanding
    Disconnecting,
}

/// GATT characteristic properties as defined in the Bluetooth Core Specification, Vol 3, Part G, §3.3.1.1.
/// Extended properties are also included as defined in §3.3.3.1.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
    pub extended_properties: bool,
    pub reliable_write: bool,
    pub writable_auxiliaries: bool,
}

impl CharacteristicProperties {
    /// Raw transmutation from [`u32`].
    ///
    /// Extended properties are in the upper bits.
    pub fn from_bits(bits: u32) -> Self {
        CharacteristicProperties {
            broadcast: (bits & (1 << 0)) != 0,
            read: (bits & (1 << 1)) != 0,
            write_without_response: (bits & (1 << 2)) != 0,
            write: (bits & (1 << 3)) != 0,
            notify: (bits & (1 << 4)) != 0,
            indicate: (bits & (1 << 5)) != 0,
            authenticated_signed_writes: (bits & (1 << 6)) != 0,
            extended_properties: (bits & (1 << 7)) != 0,
            reliable_write: (bits & (1 << 8)) != 0,
            writable_auxiliaries: (bits & (1 << 9)) != 0,
        }
    }

    /// Raw transmutation to [`u32`].
    ///
    /// Extended properties are in the upper bits.
    pub fn to_bits(self) -> u32 {
        u32::from(self.broadcast)
            | (u32::from(self.read) << 1)
            | (u32::from(self.write_without_response) << 2)
            | (u32::from(self.write) << 3)
            | (u32::from(self.notify) << 4)
            | (u32::from(self.indicate) << 5)
            | (u32::from(self.authenticated_signed_writes) << 6)
            | (u32::from(self.extended_properties) << 7)
            | (u32::from(self.reliable_write) << 8)
            | (u32::from(self.writable_auxiliaries) << 9)
    }

    /// Parses the `Flags` property of a characteristic object (`"read"`, `"write-without-response"`, ...).
    ///
    /// Security-related flags such as `"encrypt-read"` carry no capability and are ignored.
    pub fn from_flags<S: AsRef<str>>(flags: &[S]) -> Self {
        let mut props = CharacteristicProperties::default();
        for flag in flags {
            match flag.as_ref() {
                "broadcast" => props.broadcast = true,
                "read" => props.read = true,
                "write-without-response" => props.write_without_response = true,
                "write" => props.write = true,
                "notify" => props.notify = true,
                "indicate" => props.indicate = true,
                "authenticated-signed-writes" => props.authenticated_signed_writes = true,
                "extended-properties" => props.extended_properties = true,
                "reliable-write" => props.reliable_write = true,
                "writable-auxiliaries" => props.writable_auxiliaries = true,
                _ => (),
            }
        }
        props
    }
}
