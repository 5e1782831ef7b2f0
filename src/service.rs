use std::sync::Arc;

use tracing::warn;

use crate::bus::{interfaces, properties, ObjectTree, PropertyMap};
use crate::characteristic::Link;
use crate::{Characteristic, CharacteristicProperties, ObjectPath, Uuid};

/// A Bluetooth GATT service
///
/// Immutable once built. Services live in the resolved tree of a [`Device`][crate::Device] and are dropped when it
/// disconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    uuid: Uuid,
    path: ObjectPath,
    primary: bool,
    characteristics: Vec<Characteristic>,
}

impl Service {
    /// The [`Uuid`] identifying the type of this GATT service
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The bus path of this service
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// Whether this is a primary service of the device.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// The characteristics of this service, in the order the management service reported them.
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    /// The first characteristic with the given [`Uuid`].
    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|x| x.uuid() == uuid)
    }

    pub(crate) fn invalidate(&self) {
        for characteristic in &self.characteristics {
            characteristic.invalidate();
        }
    }
}

/// Builds the GATT tree beneath `device` from the mirrored object hierarchy.
///
/// Objects that vanished or lack the properties needed to describe them are skipped.
pub(crate) fn resolve_services(tree: &ObjectTree, device: &ObjectPath, link: &Arc<Link>) -> Vec<Service> {
    tree.children(device, interfaces::GATT_SERVICE)
        .filter_map(|(path, props)| {
            let Some(uuid) = props.get(properties::UUID).and_then(|x| x.as_uuid()) else {
                warn!(service = %path, "skipping service without a UUID");
                return None;
            };
            let primary = props
                .get(properties::PRIMARY)
                .and_then(|x| x.as_bool())
                .unwrap_or(true);
            let characteristics = tree
                .children(path, interfaces::GATT_CHARACTERISTIC)
                .filter_map(|(path, props)| build_characteristic(path, props, uuid, link))
                .collect();

            Some(Service {
                uuid,
                path: path.clone(),
                primary,
                characteristics,
            })
        })
        .collect()
}

fn build_characteristic(
    path: &ObjectPath,
    props: &PropertyMap,
    service_uuid: Uuid,
    link: &Arc<Link>,
) -> Option<Characteristic> {
    let Some(uuid) = props.get(properties::UUID).and_then(|x| x.as_uuid()) else {
        warn!(characteristic = %path, "skipping characteristic without a UUID");
        return None;
    };
    let Some(flags) = props.get(properties::FLAGS).and_then(|x| x.as_string_list()) else {
        warn!(characteristic = %path, "skipping characteristic without flags");
        return None;
    };
    let notifying = props
        .get(properties::NOTIFYING)
        .and_then(|x| x.as_bool())
        .unwrap_or(false);

    Some(Characteristic::new(
        uuid,
        path.clone(),
        service_uuid,
        CharacteristicProperties::from_flags(flags),
        link.clone(),
        notifying,
    ))
}
