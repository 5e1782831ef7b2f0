//! Hierarchical bus object paths
//!
//! The management service addresses objects as `adapter → device → service → characteristic`, e.g.
//! `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000a/char000b`. Parentage is determined from the path structure
//! alone.

use std::fmt;

use crate::MacAddress;

const ROOT: &str = "/org/bluez";

/// An object path on the bus.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectPath(String);

/// What an [`ObjectPath`] refers to, as far as can be told from its structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathKind<'a> {
    /// A local radio, e.g. `/org/bluez/hci0`
    Adapter {
        /// Adapter name, e.g. `hci0`
        adapter: &'a str,
    },
    /// A remote peer
    Device {
        /// Adapter name
        adapter: &'a str,
        /// Peer address
        address: MacAddress,
    },
    /// A GATT service of a remote peer
    Service {
        /// Adapter name
        adapter: &'a str,
        /// Peer address
        address: MacAddress,
        /// Service handle
        handle: u16,
    },
    /// A GATT characteristic of a remote peer
    Characteristic {
        /// Adapter name
        adapter: &'a str,
        /// Peer address
        address: MacAddress,
        /// Handle of the parent service
        service: u16,
        /// Characteristic handle
        handle: u16,
    },
    /// Anything else (descriptors, the root object, foreign objects)
    Other,
}

impl ObjectPath {
    /// Wraps a path string
    pub fn new(path: impl Into<String>) -> Self {
        ObjectPath(path.into())
    }

    /// The path of the adapter named `adapter`
    pub fn adapter(adapter: &str) -> Self {
        ObjectPath(format!("{ROOT}/{adapter}"))
    }

    /// The path of the device `address` reached through `adapter`
    pub fn device(adapter: &str, address: &MacAddress) -> Self {
        ObjectPath(format!("{ROOT}/{adapter}/{}", address.path_segment()))
    }

    /// The path of the service with `handle` beneath this (device) path
    pub fn service(&self, handle: u16) -> Self {
        ObjectPath(format!("{}/service{handle:04x}", self.0))
    }

    /// The path of the characteristic with `handle` beneath this (service) path
    pub fn characteristic(&self, handle: u16) -> Self {
        ObjectPath(format!("{}/char{handle:04x}", self.0))
    }

    /// The path as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The parent object's path, or `None` for the root.
    pub fn parent(&self) -> Option<ObjectPath> {
        let (parent, _) = self.0.rsplit_once('/')?;
        (!parent.is_empty()).then(|| ObjectPath(parent.to_string()))
    }

    /// Returns `true` if `self` is a direct child of `parent`.
    pub fn is_child_of(&self, parent: &ObjectPath) -> bool {
        self.0
            .strip_prefix(parent.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
    }

    /// Returns `true` if `self` is `ancestor` or lies anywhere beneath it.
    pub fn starts_with(&self, ancestor: &ObjectPath) -> bool {
        self.0
            .strip_prefix(ancestor.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// Classifies this path.
    pub fn kind(&self) -> PathKind<'_> {
        let Some(rest) = self.0.strip_prefix(ROOT).and_then(|x| x.strip_prefix('/')) else {
            return PathKind::Other;
        };

        let mut segments = rest.split('/');
        let adapter = match segments.next() {
            Some(adapter) if !adapter.is_empty() => adapter,
            _ => return PathKind::Other,
        };
        let Some(device) = segments.next() else {
            return PathKind::Adapter { adapter };
        };
        let Some(address) = MacAddress::from_path_segment(device) else {
            return PathKind::Other;
        };
        let Some(service) = segments.next() else {
            return PathKind::Device { adapter, address };
        };
        let Some(service) = parse_handle(service, "service") else {
            return PathKind::Other;
        };
        let Some(characteristic) = segments.next() else {
            return PathKind::Service {
                adapter,
                address,
                handle: service,
            };
        };
        match (parse_handle(characteristic, "char"), segments.next()) {
            (Some(handle), None) => PathKind::Characteristic {
                adapter,
                address,
                service,
                handle,
            },
            _ => PathKind::Other,
        }
    }

    /// The address of the device this object belongs to, if it is a device or lies beneath one.
    pub fn device_address(&self) -> Option<MacAddress> {
        match self.kind() {
            PathKind::Device { address, .. }
            | PathKind::Service { address, .. }
            | PathKind::Characteristic { address, .. } => Some(address),
            PathKind::Adapter { .. } | PathKind::Other => None,
        }
    }

    /// The adapter this object belongs to, if any.
    pub fn adapter_name(&self) -> Option<&str> {
        match self.kind() {
            PathKind::Adapter { adapter }
            | PathKind::Device { adapter, .. }
            | PathKind::Service { adapter, .. }
            | PathKind::Characteristic { adapter, .. } => Some(adapter),
            PathKind::Other => None,
        }
    }
}

fn parse_handle(segment: &str, prefix: &str) -> Option<u16> {
    let hex = segment.strip_prefix(prefix)?;
    if hex.len() != 4 {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectPath {
    fn from(path: &str) -> Self {
        ObjectPath::new(path)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> MacAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    #[test]
    fn builds_hierarchy() {
        let device = ObjectPath::device("hci0", &addr());
        assert_eq!(device.as_str(), "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");
        let characteristic = device.service(0x0a).characteristic(0x0b);
        assert_eq!(
            characteristic.as_str(),
            "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000a/char000b"
        );
        assert_eq!(characteristic.parent().unwrap(), device.service(0x0a));
        assert!(characteristic.is_child_of(&device.service(0x0a)));
        assert!(!characteristic.is_child_of(&device));
        assert!(characteristic.starts_with(&device));
        assert!(!ObjectPath::new("/org/bluez/hci01/dev_AA_BB_CC_DD_EE_FF").starts_with(&ObjectPath::adapter("hci0")));
    }

    #[test]
    fn classifies_paths() {
        assert_eq!(ObjectPath::adapter("hci1").kind(), PathKind::Adapter { adapter: "hci1" });
        assert_eq!(
            ObjectPath::device("hci0", &addr()).kind(),
            PathKind::Device {
                adapter: "hci0",
                address: addr()
            }
        );
        assert_eq!(
            ObjectPath::new("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service0010/char0012").kind(),
            PathKind::Characteristic {
                adapter: "hci0",
                address: addr(),
                service: 0x10,
                handle: 0x12
            }
        );
        assert_eq!(
            ObjectPath::new("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service0010/char0012/desc0014").kind(),
            PathKind::Other
        );
        assert_eq!(ObjectPath::new("/org/bluez/hci0/other").kind(), PathKind::Other);
        assert_eq!(ObjectPath::new("/").kind(), PathKind::Other);
    }

    #[test]
    fn device_address_of_children() {
        let path = ObjectPath::device("hci0", &addr()).service(1).characteristic(2);
        assert_eq!(path.device_address(), Some(addr()));
        assert_eq!(path.adapter_name(), Some("hci0"));
        assert_eq!(ObjectPath::adapter("hci0").device_address(), None);
    }
}
