use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bluer::gatt::remote::{CharacteristicReadRequest, CharacteristicWriteRequest};
use bluer::gatt::CharacteristicFlags;
use bluer::{AdapterEvent, AdapterProperty, DeviceEvent, DeviceProperty};
use futures_lite::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::{bus_error, unknown_object};
use crate::bus::{
    interfaces, properties, BusEvent, BusEventStream, BusGateway, BusObject, DiscoveryFilter, InterfaceMap,
    PropertyMap, PropertyValue, Transport,
};
use crate::error::{names, BusError};
use crate::path::PathKind;
use crate::{MacAddress, ObjectPath};

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Fans gateway signals out to every subscriber.
#[derive(Debug, Default)]
struct Hub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BusEvent>>>,
}

impl Hub {
    fn publish(&self, event: BusEvent) {
        lock(&self.subscribers).retain(|x| x.send(event.clone()).is_ok());
    }

    fn changed(&self, path: &ObjectPath, interface: &str, name: &str, value: PropertyValue) {
        self.publish(BusEvent::PropertiesChanged {
            path: path.clone(),
            interface: interface.to_string(),
            changed: PropertyMap::from([(name.to_string(), value)]),
            invalidated: Vec::new(),
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`BusGateway`] talking to the system's `bluetoothd` through [`bluer`].
///
/// Object paths follow BlueZ's layout. Signals are synthesised from `bluer`'s per-object event streams; in
/// particular the GATT objects of a device are announced right before its `ServicesResolved` property turns `true`.
#[derive(Debug)]
pub struct BluezGateway {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    adapter_path: ObjectPath,
    hub: Arc<Hub>,
    monitor: Mutex<Option<AbortOnDrop>>,
    discovery: Mutex<Option<AbortOnDrop>>,
    notifications: Mutex<HashMap<ObjectPath, AbortOnDrop>>,
}

impl BluezGateway {
    /// Opens a session with `bluetoothd` for the adapter named `adapter_name` (e.g. `hci0`).
    pub async fn new(adapter_name: &str) -> Result<Self, BusError> {
        let session = bluer::Session::new().await.map_err(bus_error)?;
        let adapter = session.adapter(adapter_name).map_err(bus_error)?;
        let hub = Arc::new(Hub::default());
        let monitor = AbortOnDrop(tokio::spawn(monitor_adapter(adapter.clone(), hub.clone())));

        Ok(BluezGateway {
            _session: session,
            adapter_path: ObjectPath::adapter(adapter.name()),
            adapter,
            hub,
            monitor: Mutex::new(Some(monitor)),
            discovery: Mutex::new(None),
            notifications: Mutex::new(HashMap::new()),
        })
    }

    /// Opens a session with `bluetoothd` for its default adapter.
    pub async fn default_adapter() -> Result<Self, BusError> {
        let session = bluer::Session::new().await.map_err(bus_error)?;
        let adapter = session.default_adapter().await.map_err(bus_error)?;
        Self::new(adapter.name()).await
    }

    /// Name of the adapter this gateway serves
    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    fn check_adapter(&self, path: &ObjectPath) -> Result<(), BusError> {
        if *path == self.adapter_path {
            Ok(())
        } else {
            Err(unknown_object(path))
        }
    }

    fn device(&self, path: &ObjectPath) -> Result<bluer::Device, BusError> {
        match path.kind() {
            PathKind::Device { adapter, address } if adapter == self.adapter.name() => {
                self.adapter.device(bluer::Address::new(address.octets())).map_err(bus_error)
            }
            _ => Err(unknown_object(path)),
        }
    }

    async fn characteristic(&self, path: &ObjectPath) -> Result<bluer::gatt::remote::Characteristic, BusError> {
        match path.kind() {
            PathKind::Characteristic {
                adapter,
                address,
                service,
                handle,
            } if adapter == self.adapter.name() => {
                let device = self
                    .adapter
                    .device(bluer::Address::new(address.octets()))
                    .map_err(bus_error)?;
                let service = device.service(service).await.map_err(bus_error)?;
                service.characteristic(handle).await.map_err(bus_error)
            }
            _ => Err(unknown_object(path)),
        }
    }
}

#[async_trait]
impl BusGateway for BluezGateway {
    fn events(&self) -> BusEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.hub.subscribers).push(tx);
        Box::pin(futures_lite::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    async fn managed_objects(&self) -> Result<Vec<BusObject>, BusError> {
        let powered = self.adapter.is_powered().await.map_err(bus_error)?;
        let mut objects = vec![BusObject {
            path: self.adapter_path.clone(),
            interfaces: InterfaceMap::from([(
                interfaces::ADAPTER.to_string(),
                PropertyMap::from([(properties::POWERED.to_string(), PropertyValue::Bool(powered))]),
            )]),
        }];

        for address in self.adapter.device_addresses().await.map_err(bus_error)? {
            let Ok(device) = self.adapter.device(address) else {
                continue;
            };
            let path = device_path(&self.adapter, address);
            objects.push(BusObject {
                path: path.clone(),
                interfaces: device_interfaces(&device).await,
            });
            if device.is_services_resolved().await.unwrap_or(false) {
                let (gatt, _) = gatt_tree(&device, &path, None).await;
                objects.extend(gatt);
            }
        }
        Ok(objects)
    }

    async fn get_property(&self, path: &ObjectPath, interface: &str, name: &str) -> Result<PropertyValue, BusError> {
        match (interface, name) {
            (interfaces::ADAPTER, properties::POWERED) => {
                self.check_adapter(path)?;
                self.adapter.is_powered().await.map(PropertyValue::Bool).map_err(bus_error)
            }
            (interfaces::DEVICE, properties::CONNECTED) => {
                self.device(path)?.is_connected().await.map(PropertyValue::Bool).map_err(bus_error)
            }
            (interfaces::DEVICE, properties::SERVICES_RESOLVED) => self
                .device(path)?
                .is_services_resolved()
                .await
                .map(PropertyValue::Bool)
                .map_err(bus_error),
            (interfaces::DEVICE, properties::ALIAS) => {
                self.device(path)?.alias().await.map(PropertyValue::String).map_err(bus_error)
            }
            (interfaces::GATT_CHARACTERISTIC, properties::NOTIFYING) => self
                .characteristic(path)
                .await?
                .notifying()
                .await
                .map(PropertyValue::Bool)
                .map_err(bus_error),
            _ => Err(BusError::new(
                names::INVALID_ARGUMENTS,
                format!("property {interface}.{name} is not available"),
            )),
        }
    }

    async fn set_property(
        &self,
        path: &ObjectPath,
        interface: &str,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), BusError> {
        match (interface, name, value) {
            (interfaces::ADAPTER, properties::POWERED, PropertyValue::Bool(powered)) => {
                self.check_adapter(path)?;
                self.adapter.set_powered(powered).await.map_err(bus_error)
            }
            (interfaces::DEVICE, properties::ALIAS, PropertyValue::String(alias)) => {
                self.device(path)?.set_alias(alias).await.map_err(bus_error)
            }
            _ => Err(BusError::new(
                names::INVALID_ARGUMENTS,
                format!("property {interface}.{name} is not writable"),
            )),
        }
    }

    async fn set_discovery_filter(&self, adapter: &ObjectPath, filter: &DiscoveryFilter) -> Result<(), BusError> {
        self.check_adapter(adapter)?;
        let transport = match filter.transport {
            Transport::Auto => bluer::DiscoveryTransport::Auto,
            Transport::Le => bluer::DiscoveryTransport::Le,
            Transport::BrEdr => bluer::DiscoveryTransport::BrEdr,
        };
        self.adapter
            .set_discovery_filter(bluer::DiscoveryFilter {
                uuids: filter.service_uuids.iter().copied().collect(),
                transport,
                ..Default::default()
            })
            .await
            .map_err(bus_error)
    }

    async fn start_discovery(&self, adapter: &ObjectPath) -> Result<(), BusError> {
        self.check_adapter(adapter)?;
        if lock(&self.discovery).is_some() {
            return Err(BusError::new(names::IN_PROGRESS, "Operation already in progress"));
        }

        // Discovery lasts as long as bluer's discovery stream is held
        let (tx, rx) = oneshot::channel();
        let inner = self.adapter.clone();
        let task = tokio::spawn(async move {
            match inner.discover_devices().await {
                Ok(stream) => {
                    let _ = tx.send(Ok(()));
                    let mut stream = Box::pin(stream);
                    while stream.next().await.is_some() {}
                }
                Err(err) => {
                    let _ = tx.send(Err(bus_error(err)));
                }
            }
        });
        let task = AbortOnDrop(task);
        rx.await
            .unwrap_or_else(|_| Err(BusError::new(names::FAILED, "discovery session ended")))?;
        *lock(&self.discovery) = Some(task);
        Ok(())
    }

    async fn stop_discovery(&self, adapter: &ObjectPath) -> Result<(), BusError> {
        self.check_adapter(adapter)?;
        match lock(&self.discovery).take() {
            Some(_) => Ok(()),
            None => Err(BusError::new(names::FAILED, "No discovery started")),
        }
    }

    async fn remove_device(&self, adapter: &ObjectPath, device: &ObjectPath) -> Result<(), BusError> {
        self.check_adapter(adapter)?;
        let address = self.device(device)?.address();
        self.adapter.remove_device(address).await.map_err(bus_error)
    }

    async fn connect(&self, device: &ObjectPath) -> Result<(), BusError> {
        self.device(device)?.connect().await.map_err(bus_error)
    }

    async fn disconnect(&self, device: &ObjectPath) -> Result<(), BusError> {
        self.device(device)?.disconnect().await.map_err(bus_error)
    }

    async fn read_value(&self, characteristic: &ObjectPath, offset: u16) -> Result<Vec<u8>, BusError> {
        let inner = self.characteristic(characteristic).await?;
        let request = CharacteristicReadRequest {
            offset,
            ..Default::default()
        };
        inner.read_ext(&request).await.map_err(bus_error)
    }

    async fn write_value(&self, characteristic: &ObjectPath, value: &[u8], offset: u16) -> Result<(), BusError> {
        let inner = self.characteristic(characteristic).await?;
        let request = CharacteristicWriteRequest {
            offset,
            ..Default::default()
        };
        inner.write_ext(value, &request).await.map_err(bus_error)
    }

    async fn start_notify(&self, characteristic: &ObjectPath) -> Result<(), BusError> {
        if lock(&self.notifications).contains_key(characteristic) {
            return Err(BusError::new(names::FAILED, "Already notifying"));
        }
        let inner = self.characteristic(characteristic).await?;

        // The notification session lasts as long as bluer's notification stream is held. Values arrive through the
        // characteristic's property changes.
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            match inner.notify().await {
                Ok(stream) => {
                    let _ = tx.send(Ok(()));
                    let mut stream = Box::pin(stream);
                    while stream.next().await.is_some() {}
                }
                Err(err) => {
                    let _ = tx.send(Err(bus_error(err)));
                }
            }
        });
        let task = AbortOnDrop(task);
        rx.await
            .unwrap_or_else(|_| Err(BusError::new(names::FAILED, "notification session ended")))?;
        lock(&self.notifications).insert(characteristic.clone(), task);
        Ok(())
    }

    async fn stop_notify(&self, characteristic: &ObjectPath) -> Result<(), BusError> {
        match lock(&self.notifications).remove(characteristic) {
            Some(_) => Ok(()),
            None => Err(BusError::new(names::FAILED, "No notify session started")),
        }
    }

    async fn close(&self) {
        lock(&self.notifications).clear();
        lock(&self.discovery).take();
        lock(&self.monitor).take();
        lock(&self.hub.subscribers).clear();
    }
}

fn device_path(adapter: &bluer::Adapter, address: bluer::Address) -> ObjectPath {
    ObjectPath::device(adapter.name(), &MacAddress::new(address.0))
}

fn device_property(property: DeviceProperty) -> Option<(&'static str, PropertyValue)> {
    Some(match property {
        DeviceProperty::Name(name) => (properties::NAME, PropertyValue::String(name)),
        DeviceProperty::Alias(alias) => (properties::ALIAS, PropertyValue::String(alias)),
        DeviceProperty::Rssi(rssi) => (properties::RSSI, PropertyValue::I16(rssi)),
        DeviceProperty::TxPower(power) => ("TxPower", PropertyValue::I16(power)),
        DeviceProperty::Connected(connected) => (properties::CONNECTED, PropertyValue::Bool(connected)),
        DeviceProperty::ServicesResolved(resolved) => (properties::SERVICES_RESOLVED, PropertyValue::Bool(resolved)),
        DeviceProperty::Uuids(uuids) => (
            properties::UUIDS,
            PropertyValue::StringList(uuids.iter().map(|x| x.to_string()).collect()),
        ),
        _ => return None,
    })
}

async fn device_interfaces(device: &bluer::Device) -> InterfaceMap {
    let mut props = PropertyMap::new();
    props.insert(
        properties::ADDRESS.to_string(),
        PropertyValue::String(device.address().to_string()),
    );
    if let Ok(alias) = device.alias().await {
        props.insert(properties::ALIAS.to_string(), PropertyValue::String(alias));
    }
    if let Ok(Some(name)) = device.name().await {
        props.insert(properties::NAME.to_string(), PropertyValue::String(name));
    }
    if let Ok(Some(rssi)) = device.rssi().await {
        props.insert(properties::RSSI.to_string(), PropertyValue::I16(rssi));
    }
    if let Ok(Some(uuids)) = device.uuids().await {
        props.insert(
            properties::UUIDS.to_string(),
            PropertyValue::StringList(uuids.iter().map(|x| x.to_string()).collect()),
        );
    }
    let connected = device.is_connected().await.unwrap_or(false);
    props.insert(properties::CONNECTED.to_string(), PropertyValue::Bool(connected));
    let resolved = device.is_services_resolved().await.unwrap_or(false);
    props.insert(properties::SERVICES_RESOLVED.to_string(), PropertyValue::Bool(resolved));

    InterfaceMap::from([(interfaces::DEVICE.to_string(), props)])
}

fn flag_names(flags: CharacteristicFlags) -> Vec<String> {
    [
        (flags.broadcast, "broadcast"),
        (flags.read, "read"),
        (flags.write_without_response, "write-without-response"),
        (flags.write, "write"),
        (flags.notify, "notify"),
        (flags.indicate, "indicate"),
        (flags.authenticated_signed_writes, "authenticated-signed-writes"),
        (flags.extended_properties, "extended-properties"),
        (flags.reliable_write, "reliable-write"),
        (flags.writable_auxiliaries, "writable-auxiliaries"),
    ]
    .into_iter()
    .filter_map(|(set, name)| set.then(|| name.to_string()))
    .collect()
}

/// Describes the GATT tree of `device`, parents first. With a `hub`, a watcher is started for every characteristic.
async fn gatt_tree(
    device: &bluer::Device,
    path: &ObjectPath,
    hub: Option<&Arc<Hub>>,
) -> (Vec<BusObject>, Vec<AbortOnDrop>) {
    let mut objects = Vec::new();
    let mut watchers = Vec::new();

    let services = match device.services().await {
        Ok(services) => services,
        Err(err) => {
            warn!("listing services of {} failed: {}", path, err);
            return (objects, watchers);
        }
    };
    for service in services {
        let Ok(uuid) = service.uuid().await else {
            continue;
        };
        let primary = service.primary().await.unwrap_or(true);
        let service_path = path.service(service.id());
        objects.push(BusObject {
            path: service_path.clone(),
            interfaces: InterfaceMap::from([(
                interfaces::GATT_SERVICE.to_string(),
                PropertyMap::from([
                    (properties::UUID.to_string(), PropertyValue::String(uuid.to_string())),
                    (properties::PRIMARY.to_string(), PropertyValue::Bool(primary)),
                ]),
            )]),
        });

        for characteristic in service.characteristics().await.unwrap_or_default() {
            let (Ok(uuid), Ok(flags)) = (characteristic.uuid().await, characteristic.flags().await) else {
                continue;
            };
            let notifying = characteristic.notifying().await.unwrap_or(false);
            let characteristic_path = service_path.characteristic(characteristic.id());
            objects.push(BusObject {
                path: characteristic_path.clone(),
                interfaces: InterfaceMap::from([(
                    interfaces::GATT_CHARACTERISTIC.to_string(),
                    PropertyMap::from([
                        (properties::UUID.to_string(), PropertyValue::String(uuid.to_string())),
                        (properties::FLAGS.to_string(), PropertyValue::StringList(flag_names(flags))),
                        (properties::NOTIFYING.to_string(), PropertyValue::Bool(notifying)),
                    ]),
                )]),
            });
            if let Some(hub) = hub {
                watchers.push(AbortOnDrop(tokio::spawn(watch_characteristic(
                    characteristic,
                    characteristic_path,
                    hub.clone(),
                ))));
            }
        }
    }
    (objects, watchers)
}

async fn monitor_adapter(adapter: bluer::Adapter, hub: Arc<Hub>) {
    let adapter_path = ObjectPath::adapter(adapter.name());
    let mut watchers: HashMap<bluer::Address, AbortOnDrop> = HashMap::new();
    for address in adapter.device_addresses().await.unwrap_or_default() {
        let task = tokio::spawn(watch_device(adapter.clone(), address, hub.clone()));
        watchers.insert(address, AbortOnDrop(task));
    }

    let events = match adapter.events().await {
        Ok(events) => events,
        Err(err) => {
            warn!("watching adapter {} failed: {}", adapter.name(), err);
            return;
        }
    };
    let mut events = Box::pin(events);
    while let Some(event) = events.next().await {
        match event {
            AdapterEvent::DeviceAdded(address) => {
                let Ok(device) = adapter.device(address) else {
                    continue;
                };
                hub.publish(BusEvent::ObjectAdded {
                    path: device_path(&adapter, address),
                    interfaces: device_interfaces(&device).await,
                });
                watchers
                    .entry(address)
                    .or_insert_with(|| AbortOnDrop(tokio::spawn(watch_device(adapter.clone(), address, hub.clone()))));
            }
            AdapterEvent::DeviceRemoved(address) => {
                watchers.remove(&address);
                hub.publish(BusEvent::ObjectRemoved {
                    path: device_path(&adapter, address),
                    interfaces: vec![interfaces::DEVICE.to_string()],
                });
            }
            AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
                hub.changed(
                    &adapter_path,
                    interfaces::ADAPTER,
                    properties::POWERED,
                    PropertyValue::Bool(powered),
                );
            }
            _ => (),
        }
    }
    debug!("adapter {} event stream ended", adapter.name());
}

async fn watch_device(adapter: bluer::Adapter, address: bluer::Address, hub: Arc<Hub>) {
    let Ok(device) = adapter.device(address) else {
        return;
    };
    let path = device_path(&adapter, address);
    let events = match device.events().await {
        Ok(events) => events,
        Err(err) => {
            warn!("watching {} failed: {}", path, err);
            return;
        }
    };
    let mut events = Box::pin(events);

    let mut published: Vec<ObjectPath> = Vec::new();
    let mut watchers = Vec::new();
    if device.is_services_resolved().await.unwrap_or(false) {
        let (objects, tasks) = gatt_tree(&device, &path, Some(&hub)).await;
        published = objects.into_iter().map(|x| x.path).collect();
        watchers = tasks;
    }

    while let Some(event) = events.next().await {
        let DeviceEvent::PropertyChanged(property) = event else {
            continue;
        };
        match property {
            DeviceProperty::ServicesResolved(true) => {
                let (objects, tasks) = gatt_tree(&device, &path, Some(&hub)).await;
                for object in objects {
                    published.push(object.path.clone());
                    hub.publish(BusEvent::ObjectAdded {
                        path: object.path,
                        interfaces: object.interfaces,
                    });
                }
                watchers = tasks;
                hub.changed(
                    &path,
                    interfaces::DEVICE,
                    properties::SERVICES_RESOLVED,
                    PropertyValue::Bool(true),
                );
            }
            DeviceProperty::ServicesResolved(false) => {
                hub.changed(
                    &path,
                    interfaces::DEVICE,
                    properties::SERVICES_RESOLVED,
                    PropertyValue::Bool(false),
                );
                watchers.clear();
                for object in published.drain(..).rev() {
                    hub.publish(BusEvent::ObjectRemoved {
                        path: object,
                        interfaces: Vec::new(),
                    });
                }
            }
            property => {
                if let Some((name, value)) = device_property(property) {
                    hub.changed(&path, interfaces::DEVICE, name, value);
                }
            }
        }
    }
}

async fn watch_characteristic(characteristic: bluer::gatt::remote::Characteristic, path: ObjectPath, hub: Arc<Hub>) {
    use bluer::gatt::remote::{CharacteristicEvent, CharacteristicProperty};

    let events = match characteristic.events().await {
        Ok(events) => events,
        Err(err) => {
            warn!("watching {} failed: {}", path, err);
            return;
        }
    };
    let mut events = Box::pin(events);
    while let Some(event) = events.next().await {
        let CharacteristicEvent::PropertyChanged(property) = event else {
            continue;
        };
        match property {
            CharacteristicProperty::Value(value) => hub.changed(
                &path,
                interfaces::GATT_CHARACTERISTIC,
                properties::VALUE,
                PropertyValue::Bytes(value),
            ),
            CharacteristicProperty::Notifying(notifying) => hub.changed(
                &path,
                interfaces::GATT_CHARACTERISTIC,
                properties::NOTIFYING,
                PropertyValue::Bool(notifying),
            ),
            _ => (),
        }
    }
}
