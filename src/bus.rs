//! The boundary with the Bluetooth management service
//!
//! The management service is reached through a [`BusGateway`]: an asynchronous object/property/signal interface.
//! Objects are addressed by [`ObjectPath`], expose interfaces carrying named properties, and the gateway pushes
//! [`BusEvent`]s when objects appear, disappear, or change.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use indexmap::IndexMap;

use crate::error::BusError;
use crate::{ObjectPath, Uuid};

/// Interface names used by the management service.
pub mod interfaces {
    #![allow(missing_docs)]

    pub const ADAPTER: &str = "org.bluez.Adapter1";
    pub const DEVICE: &str = "org.bluez.Device1";
    pub const GATT_SERVICE: &str = "org.bluez.GattService1";
    pub const GATT_CHARACTERISTIC: &str = "org.bluez.GattCharacteristic1";
}

/// Property names used by the management service.
pub mod properties {
    #![allow(missing_docs)]

    pub const POWERED: &str = "Powered";
    pub const ADDRESS: &str = "Address";
    pub const ALIAS: &str = "Alias";
    pub const NAME: &str = "Name";
    pub const CONNECTED: &str = "Connected";
    pub const SERVICES_RESOLVED: &str = "ServicesResolved";
    pub const RSSI: &str = "RSSI";
    pub const UUIDS: &str = "UUIDs";
    pub const UUID: &str = "UUID";
    pub const PRIMARY: &str = "Primary";
    pub const FLAGS: &str = "Flags";
    pub const VALUE: &str = "Value";
    pub const NOTIFYING: &str = "Notifying";
}

/// A property value as carried on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// A boolean
    Bool(bool),
    /// A signed 16-bit integer (e.g. `RSSI`)
    I16(i16),
    /// An unsigned 16-bit integer
    U16(u16),
    /// A string (e.g. `Alias`, `UUID`)
    String(String),
    /// A list of strings (e.g. `Flags`, `UUIDs`)
    StringList(Vec<String>),
    /// A byte array (e.g. `Value`)
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// The boolean value, if this is a [`PropertyValue::Bool`]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(x) => Some(*x),
            _ => None,
        }
    }

    /// The string value, if this is a [`PropertyValue::String`]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(x) => Some(x),
            _ => None,
        }
    }

    /// The string list, if this is a [`PropertyValue::StringList`]
    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            PropertyValue::StringList(x) => Some(x),
            _ => None,
        }
    }

    /// The bytes, if this is a [`PropertyValue::Bytes`]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PropertyValue::Bytes(x) => Some(x),
            _ => None,
        }
    }

    /// The integer value, if this is a [`PropertyValue::I16`]
    pub fn as_i16(&self) -> Option<i16> {
        match self {
            PropertyValue::I16(x) => Some(*x),
            _ => None,
        }
    }

    /// The value parsed as a [`Uuid`], if this is a [`PropertyValue::String`] holding one
    pub fn as_uuid(&self) -> Option<Uuid> {
        self.as_str().and_then(|x| Uuid::parse_str(x).ok())
    }
}

/// Named properties of one interface
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Interfaces of one object with their properties, in the order the gateway reported them
pub type InterfaceMap = IndexMap<String, PropertyMap>;

/// An object exported by the gateway together with its interfaces and properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusObject {
    /// The object's path
    pub path: ObjectPath,
    /// The object's interfaces
    pub interfaces: InterfaceMap,
}

/// A signal pushed by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Interfaces were added to an object (usually: a new object appeared)
    ObjectAdded {
        /// The object's path
        path: ObjectPath,
        /// The added interfaces and their properties
        interfaces: InterfaceMap,
    },
    /// Interfaces were removed from an object (usually: the object disappeared)
    ObjectRemoved {
        /// The object's path
        path: ObjectPath,
        /// The removed interface names
        interfaces: Vec<String>,
    },
    /// Properties of one interface of an object changed
    PropertiesChanged {
        /// The object's path
        path: ObjectPath,
        /// The interface whose properties changed
        interface: String,
        /// New values
        changed: PropertyMap,
        /// Properties that no longer have a value
        invalidated: Vec<String>,
    },
}

/// Transport restriction for discovery.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Both LE and BR/EDR
    Auto,
    /// Bluetooth Low Energy only
    #[default]
    Le,
    /// BR/EDR only
    BrEdr,
}

/// Filter applied to discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilter {
    /// Only report devices advertising at least one of these services. Empty means no filtering.
    pub service_uuids: Vec<Uuid>,
    /// Transport to scan on
    pub transport: Transport,
}

/// A boxed stream of gateway signals.
pub type BusEventStream = Pin<Box<dyn Stream<Item = BusEvent> + Send>>;

/// The asynchronous object/property/signal interface of the Bluetooth management service.
///
/// Every method only *initiates* an operation on the remote side and completes with either a success payload or a
/// structured [`BusError`]. Implementations must be cheap to share: a [`DeviceManager`][crate::DeviceManager] calls
/// them from spawned tasks.
#[async_trait]
pub trait BusGateway: Send + Sync + 'static {
    /// Subscribes to object-added, object-removed, and property-changed signals.
    ///
    /// Signals must be delivered in the order the service emitted them. In particular the objects of a device's GATT
    /// tree must be announced before that device's `ServicesResolved` property changes to `true`.
    fn events(&self) -> BusEventStream;

    /// All objects currently exported, parents before children, in the service's order.
    async fn managed_objects(&self) -> Result<Vec<BusObject>, BusError>;

    /// Reads one property.
    async fn get_property(&self, path: &ObjectPath, interface: &str, name: &str) -> Result<PropertyValue, BusError>;

    /// Writes one property.
    async fn set_property(
        &self,
        path: &ObjectPath,
        interface: &str,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), BusError>;

    /// `SetDiscoveryFilter` on an adapter
    async fn set_discovery_filter(&self, adapter: &ObjectPath, filter: &DiscoveryFilter) -> Result<(), BusError>;

    /// `StartDiscovery` on an adapter
    async fn start_discovery(&self, adapter: &ObjectPath) -> Result<(), BusError>;

    /// `StopDiscovery` on an adapter
    async fn stop_discovery(&self, adapter: &ObjectPath) -> Result<(), BusError>;

    /// `RemoveDevice` on an adapter
    async fn remove_device(&self, adapter: &ObjectPath, device: &ObjectPath) -> Result<(), BusError>;

    /// `Connect` on a device
    async fn connect(&self, device: &ObjectPath) -> Result<(), BusError>;

    /// `Disconnect` on a device
    async fn disconnect(&self, device: &ObjectPath) -> Result<(), BusError>;

    /// `ReadValue` on a characteristic
    async fn read_value(&self, characteristic: &ObjectPath, offset: u16) -> Result<Vec<u8>, BusError>;

    /// `WriteValue` on a characteristic
    async fn write_value(&self, characteristic: &ObjectPath, value: &[u8], offset: u16) -> Result<(), BusError>;

    /// `StartNotify` on a characteristic
    async fn start_notify(&self, characteristic: &ObjectPath) -> Result<(), BusError>;

    /// `StopNotify` on a characteristic
    async fn stop_notify(&self, characteristic: &ObjectPath) -> Result<(), BusError>;

    /// Releases the gateway's resources. Signals stop being delivered afterwards.
    async fn close(&self) {}
}

/// A local mirror of the gateway's object hierarchy, kept current from [`BusEvent`]s.
///
/// Objects are kept in the order the gateway first reported them.
#[derive(Debug, Default, Clone)]
pub(crate) struct ObjectTree {
    objects: IndexMap<ObjectPath, InterfaceMap>,
}

impl ObjectTree {
    pub fn from_objects(objects: Vec<BusObject>) -> Self {
        let mut tree = ObjectTree::default();
        for object in objects {
            tree.add(object.path, object.interfaces);
        }
        tree
    }

    pub fn contains(&self, path: &ObjectPath) -> bool {
        self.objects.contains_key(path)
    }

    pub fn interface(&self, path: &ObjectPath, interface: &str) -> Option<&PropertyMap> {
        self.objects.get(path)?.get(interface)
    }

    pub fn property(&self, path: &ObjectPath, interface: &str, name: &str) -> Option<&PropertyValue> {
        self.interface(path, interface)?.get(name)
    }

    pub fn add(&mut self, path: ObjectPath, interfaces: InterfaceMap) {
        let entry = self.objects.entry(path).or_default();
        for (name, props) in interfaces {
            entry.entry(name).or_default().extend(props);
        }
    }

    /// Removes `interfaces` from the object at `path`. Returns `true` if the object itself is gone as a result, in
    /// which case everything beneath it is dropped as well.
    pub fn remove(&mut self, path: &ObjectPath, interfaces: &[String]) -> bool {
        let Some(entry) = self.objects.get_mut(path) else {
            return false;
        };
        for name in interfaces {
            entry.shift_remove(name);
        }
        if entry.is_empty() || interfaces.is_empty() {
            self.objects.retain(|x, _| !x.starts_with(path));
            true
        } else {
            false
        }
    }

    pub fn update(&mut self, path: &ObjectPath, interface: &str, changed: &PropertyMap, invalidated: &[String]) {
        let Some(object) = self.objects.get_mut(path) else {
            return;
        };
        let props = object.entry(interface.to_string()).or_default();
        props.extend(changed.iter().map(|(k, v)| (k.clone(), v.clone())));
        for name in invalidated {
            props.remove(name);
        }
    }

    /// Direct children of `parent` implementing `interface`, in reported order.
    pub fn children<'a>(
        &'a self,
        parent: &'a ObjectPath,
        interface: &'a str,
    ) -> impl Iterator<Item = (&'a ObjectPath, &'a PropertyMap)> + 'a {
        self.objects
            .iter()
            .filter(move |(path, _)| path.is_child_of(parent))
            .filter_map(move |(path, interfaces)| interfaces.get(interface).map(|props| (path, props)))
    }

    /// All objects implementing `interface`, in reported order.
    pub fn with_interface<'a>(&'a self, interface: &'a str) -> impl Iterator<Item = (&'a ObjectPath, &'a PropertyMap)> {
        self.objects
            .iter()
            .filter_map(move |(path, interfaces)| interfaces.get(interface).map(|props| (path, props)))
    }
}
