//! Lifecycle callbacks
//!
//! A [`DeviceManager`][crate::DeviceManager] reports discovery through a [`ManagerObserver`] and every
//! [`Device`][crate::Device] reports its state transitions and characteristic operations through its own
//! [`DeviceObserver`]. All methods have no-op defaults, so an observer only implements the events it cares about.
//!
//! Callbacks run on the dispatcher, one at a time. They receive mutable access to the device they concern and may
//! start further operations from within the callback (e.g. reconnecting from
//! [`disconnect_succeeded`][DeviceObserver::disconnect_succeeded]). They must not block: a slow callback delays the
//! processing of every other device's events.

use crate::{Characteristic, Device, Error, MacAddress};

/// Discovery callbacks of a [`DeviceManager`][crate::DeviceManager].
#[allow(unused_variables)]
pub trait ManagerObserver: Send {
    /// Creates the observer for a newly seen peer.
    ///
    /// Returning `None` suppresses registration of that device. It will be offered again the next time the peer is
    /// seen.
    fn make_device(&mut self, address: &MacAddress) -> Option<Box<dyn DeviceObserver>> {
        Some(Box::new(()))
    }

    /// Called once per peer, the first time one of its advertisements is observed.
    fn device_discovered(&mut self, device: &mut Device) {}

    /// Called after a device has been removed from the registry because its bus object disappeared.
    fn device_removed(&mut self, address: &MacAddress) {}
}

impl ManagerObserver for () {}

/// Per-device lifecycle callbacks.
#[allow(unused_variables)]
pub trait DeviceObserver: Send {
    /// An advertisement of an already discovered device was received.
    fn advertised(&mut self, device: &mut Device) {}

    /// The device is now connected. Service resolution starts right after this returns.
    fn connect_succeeded(&mut self, device: &mut Device) {}

    /// The connection attempt failed and the device is back to
    /// [`Disconnected`][crate::DeviceState::Disconnected].
    fn connect_failed(&mut self, device: &mut Device, error: Error) {}

    /// The device disconnected, either on request or because the link was lost.
    fn disconnect_succeeded(&mut self, device: &mut Device) {}

    /// The disconnect request failed and the device still reports being connected. The device is considered
    /// disconnected locally regardless.
    fn disconnect_failed(&mut self, device: &mut Device, error: Error) {}

    /// The GATT tree is available through [`Device::services`].
    fn services_resolved(&mut self, device: &mut Device) {}

    /// Services were not resolved in time. The device is disconnected after this returns.
    fn services_resolution_failed(&mut self, device: &mut Device, error: Error) {}

    /// A new value was read or notified.
    fn characteristic_value_updated(&mut self, device: &mut Device, characteristic: &Characteristic, value: &[u8]) {}

    /// A read request failed.
    fn characteristic_read_value_failed(&mut self, device: &mut Device, characteristic: &Characteristic, error: Error) {}

    /// A write request completed.
    fn characteristic_write_value_succeeded(&mut self, device: &mut Device, characteristic: &Characteristic) {}

    /// A write request failed.
    fn characteristic_write_value_failed(&mut self, device: &mut Device, characteristic: &Characteristic, error: Error) {
    }

    /// Notifications were enabled.
    fn characteristic_enable_notifications_succeeded(&mut self, device: &mut Device, characteristic: &Characteristic) {
    }

    /// Enabling notifications failed.
    fn characteristic_enable_notifications_failed(
        &mut self,
        device: &mut Device,
        characteristic: &Characteristic,
        error: Error,
    ) {
    }

    /// Notifications were disabled.
    fn characteristic_disable_notifications_succeeded(&mut self, device: &mut Device, characteristic: &Characteristic) {
    }

    /// Disabling notifications failed.
    fn characteristic_disable_notifications_failed(
        &mut self,
        device: &mut Device,
        characteristic: &Characteristic,
        error: Error,
    ) {
    }
}

impl DeviceObserver for () {}
