use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bus::{
    interfaces, properties, BusEvent, BusGateway, DiscoveryFilter, ObjectTree, PropertyMap, PropertyValue, Transport,
};
use crate::dispatch::{DispatcherHandle, Event, EventDispatcher};
use crate::error::{names, BusRequest, ErrorKind};
use crate::path::PathKind;
use crate::{Device, DeviceObserver, Error, MacAddress, ManagerConfig, ManagerObserver, ObjectPath, Result, Uuid};

/// Device properties whose change means a new advertisement was received.
const ADVERTISEMENT_PROPERTIES: &[&str] = &[properties::RSSI, "ManufacturerData", "ServiceData", "TxPower"];

struct Entry {
    device: Device,
    observer: Box<dyn DeviceObserver>,
}

/// Registry and factory for the [`Device`]s reachable through one adapter.
///
/// The manager mirrors the management service's object hierarchy, turns device objects into [`Device`]s (through
/// [`ManagerObserver::make_device`]) and routes every signal and completion to the device it concerns. Nothing
/// happens until events are processed by [`run`][DeviceManager::run] (or [`run_pending`][DeviceManager::run_pending]).
///
/// Devices are keyed by hardware address: the management service may recreate a device's bus object, but the
/// [`Device`] stays the same.
pub struct DeviceManager {
    gateway: Arc<dyn BusGateway>,
    config: Arc<ManagerConfig>,
    adapter_path: ObjectPath,
    observer: Box<dyn ManagerObserver>,
    dispatcher: EventDispatcher,
    tree: ObjectTree,
    devices: IndexMap<MacAddress, Entry>,
    paths: HashMap<ObjectPath, MacAddress>,
    discovered: HashSet<MacAddress>,
    discovering: bool,
    bus_closed: bool,
    forwarder: JoinHandle<()>,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("adapter_path", &self.adapter_path)
            .field("devices", &self.devices.len())
            .field("discovering", &self.discovering)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl DeviceManager {
    /// Opens the adapter named in `config` through `gateway`.
    ///
    /// Must be called from within a Tokio runtime; gateway requests and timers are spawned onto it. Devices already
    /// known to the management service are registered right away, without a
    /// [`device_discovered`][ManagerObserver::device_discovered] callback until they are seen advertising.
    ///
    /// Fails with [`AdapterUnavailable`][ErrorKind::AdapterUnavailable] if the adapter does not exist.
    pub async fn new(
        gateway: Arc<dyn BusGateway>,
        config: ManagerConfig,
        observer: impl ManagerObserver + 'static,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|err| Error::new(ErrorKind::Internal, Some(Box::new(err)), "no Tokio runtime".to_string()))?;
        let dispatcher = EventDispatcher::new(runtime);

        // Subscribe before taking the snapshot so no change falls in between
        let forwarder = dispatcher.handle().forward(gateway.events());
        let objects = match gateway.managed_objects().await {
            Ok(objects) => objects,
            Err(err) => {
                forwarder.abort();
                return Err(Error::from_bus(BusRequest::Adapter, err));
            }
        };
        let tree = ObjectTree::from_objects(objects);

        let adapter_path = ObjectPath::adapter(&config.adapter_name);
        if tree.interface(&adapter_path, interfaces::ADAPTER).is_none() {
            forwarder.abort();
            return Err(Error::with_message(
                ErrorKind::AdapterUnavailable,
                format!("adapter {} not found", config.adapter_name),
            ));
        }

        let mut manager = DeviceManager {
            gateway,
            config: Arc::new(config),
            adapter_path,
            observer: Box::new(observer),
            dispatcher,
            tree,
            devices: IndexMap::new(),
            paths: HashMap::new(),
            discovered: HashSet::new(),
            discovering: false,
            bus_closed: false,
            forwarder,
        };
        manager.update_devices();
        Ok(manager)
    }

    /// Name of the adapter this manager drives
    pub fn adapter_name(&self) -> &str {
        &self.config.adapter_name
    }

    /// The policy this manager was opened with
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// A handle for stopping [`run`][DeviceManager::run] or scheduling work on the dispatcher from any context
    pub fn dispatcher(&self) -> &DispatcherHandle {
        self.dispatcher.handle()
    }

    /// Whether discovery was started by this manager and not stopped since
    pub fn is_discovering(&self) -> bool {
        self.discovering
    }

    /// All registered devices, in registration order
    pub fn devices(&self) -> Vec<&Device> {
        self.devices.values().map(|x| &x.device).collect()
    }

    /// The device with the given address, if registered
    pub fn device(&self, address: &MacAddress) -> Option<&Device> {
        self.devices.get(address).map(|x| &x.device)
    }

    /// The device with the given address, if registered
    pub fn device_mut(&mut self, address: &MacAddress) -> Option<&mut Device> {
        self.devices.get_mut(address).map(|x| &mut x.device)
    }

    /// Starts scanning for LE devices, optionally limited to devices advertising one of `service_uuids`.
    ///
    /// Fails with [`AdapterUnavailable`][ErrorKind::AdapterUnavailable] if the adapter is gone or powered off and
    /// with [`PermissionDenied`][ErrorKind::PermissionDenied] if the process lacks the required privileges.
    pub async fn start_discovery(&mut self, service_uuids: &[Uuid]) -> Result<()> {
        match self
            .tree
            .property(&self.adapter_path, interfaces::ADAPTER, properties::POWERED)
            .and_then(PropertyValue::as_bool)
        {
            _ if !self.tree.contains(&self.adapter_path) => {
                return Err(Error::with_message(ErrorKind::AdapterUnavailable, "adapter was removed"));
            }
            Some(false) => return Err(Error::with_message(ErrorKind::AdapterUnavailable, "adapter is powered off")),
            _ => (),
        }

        let filter = DiscoveryFilter {
            service_uuids: service_uuids.to_vec(),
            transport: Transport::Le,
        };
        self.gateway
            .set_discovery_filter(&self.adapter_path, &filter)
            .await
            .map_err(|err| Error::from_bus(BusRequest::Discovery, err))?;

        match self.gateway.start_discovery(&self.adapter_path).await {
            Ok(()) => (),
            Err(err) if err.is(names::IN_PROGRESS) => debug!("discovery already running: {}", err),
            Err(err) => return Err(Error::from_bus(BusRequest::Discovery, err)),
        }
        info!("discovery started on {}", self.config.adapter_name);
        self.discovering = true;
        Ok(())
    }

    /// Stops scanning. Does nothing if discovery is off.
    pub async fn stop_discovery(&mut self) -> Result<()> {
        if !self.discovering {
            return Ok(());
        }
        match self.gateway.stop_discovery(&self.adapter_path).await {
            Ok(()) => (),
            Err(err) if err.is_failed_with("No discovery started") => debug!("{}", err),
            Err(err) => return Err(Error::from_bus(BusRequest::Discovery, err)),
        }
        info!("discovery stopped on {}", self.config.adapter_name);
        self.discovering = false;
        Ok(())
    }

    /// Whether the adapter is powered on
    ///
    /// The returned future does not borrow the manager, so it can be awaited while [`run`][DeviceManager::run] is
    /// processing events.
    pub fn is_adapter_powered(&self) -> impl Future<Output = Result<bool>> + Send + 'static {
        let gateway = self.gateway.clone();
        let path = self.adapter_path.clone();
        async move {
            let value = gateway
                .get_property(&path, interfaces::ADAPTER, properties::POWERED)
                .await
                .map_err(|err| Error::from_bus(BusRequest::Adapter, err))?;
            value.as_bool().ok_or_else(|| {
                Error::with_message(ErrorKind::Internal, format!("unexpected Powered value {value:?}"))
            })
        }
    }

    /// Powers the adapter on or off
    pub fn set_adapter_powered(&self, powered: bool) -> impl Future<Output = Result<()>> + Send + 'static {
        let gateway = self.gateway.clone();
        let path = self.adapter_path.clone();
        async move {
            gateway
                .set_property(&path, interfaces::ADAPTER, properties::POWERED, PropertyValue::Bool(powered))
                .await
                .map_err(|err| Error::from_bus(BusRequest::Adapter, err))
        }
    }

    /// Registers a device without waiting for it to be discovered.
    ///
    /// A device previously registered under `address` is replaced; its services and pending operations are
    /// invalidated without further callbacks.
    pub fn add_device(&mut self, address: MacAddress, observer: impl DeviceObserver + 'static) -> &mut Device {
        if let Some(mut old) = self.devices.shift_remove(&address) {
            debug!("replacing device {}", address);
            old.device.detach();
        }

        let device = self.new_device(address);
        self.paths.insert(device.path().clone(), address);
        self.discovered.insert(address);
        let (index, _) = self.devices.insert_full(
            address,
            Entry {
                device,
                observer: Box::new(observer),
            },
        );
        &mut self.devices[index].device
    }

    /// Unregisters a device. Its services and pending operations are invalidated and an established connection is
    /// closed, without further callbacks.
    ///
    /// Returns `false` if no device was registered under `address`.
    pub fn remove_device(&mut self, address: &MacAddress) -> bool {
        let Some(mut entry) = self.devices.shift_remove(address) else {
            return false;
        };
        self.paths.remove(entry.device.path());
        entry.device.detach();
        true
    }

    /// Asks the management service to forget every known device, except those whose alias is `skip_alias`, and
    /// unregisters them.
    pub async fn remove_all_devices(&mut self, skip_alias: Option<&str>) -> Result<()> {
        self.update_devices();

        let targets: Vec<(MacAddress, ObjectPath)> = self
            .devices
            .values()
            .filter(|x| skip_alias.is_none() || x.device.alias() != skip_alias)
            .map(|x| (x.device.address(), x.device.path().clone()))
            .collect();

        for (address, path) in targets {
            match self.gateway.remove_device(&self.adapter_path, &path).await {
                Ok(()) => (),
                Err(err) if err.is(names::DOES_NOT_EXIST) || err.is(names::UNKNOWN_OBJECT) => {
                    trace!("{} already gone: {}", address, err)
                }
                Err(err) => return Err(Error::from_bus(BusRequest::Adapter, err)),
            }
            self.remove_device(&address);
        }
        Ok(())
    }

    /// Registers every device object of the adapter that is not registered yet.
    pub fn update_devices(&mut self) {
        let paths: Vec<ObjectPath> = self
            .tree
            .with_interface(interfaces::DEVICE)
            .map(|(path, _)| path.clone())
            .collect();
        for path in paths {
            if let Some(address) = self.own_device_address(&path) {
                self.register(address);
            }
        }
    }

    /// Processes events until [`stop`][DeviceManager::stop] is called.
    ///
    /// All observer callbacks are invoked from within this future. Returns an error of kind
    /// [`Internal`][ErrorKind::Internal] if the gateway stops delivering signals.
    pub async fn run(&mut self) -> Result<()> {
        if self.bus_closed {
            return Err(Self::bus_closed_error());
        }

        self.dispatcher.set_running(true);
        let result = loop {
            let Some(event) = self.dispatcher.next().await else {
                break Err(Self::bus_closed_error());
            };
            match event {
                Event::Stop => {
                    if self.dispatcher.take_stop() {
                        break Ok(());
                    }
                }
                Event::BusClosed => {
                    self.bus_closed = true;
                    break Err(Self::bus_closed_error());
                }
                event => self.dispatch(event),
            }
        };
        self.dispatcher.set_running(false);
        result
    }

    /// Processes the events queued so far without waiting for more. Returns the number of events processed.
    ///
    /// A pending [`stop`][DeviceManager::stop] request is left for the next [`run`][DeviceManager::run].
    pub fn run_pending(&mut self) -> usize {
        let mut count = 0;
        let mut stop = false;
        while let Some(event) = self.dispatcher.try_next() {
            count += 1;
            match event {
                Event::Stop => stop = true,
                Event::BusClosed => {
                    warn!("gateway signal stream ended");
                    self.bus_closed = true;
                }
                event => self.dispatch(event),
            }
        }
        if stop && self.dispatcher.stop_requested() {
            self.dispatcher.handle().post(Event::Stop);
        }
        count
    }

    /// Makes [`run`][DeviceManager::run] return.
    pub fn stop(&self) {
        self.dispatcher.handle().stop();
    }

    /// Stops discovery and releases the gateway.
    pub async fn close(mut self) -> Result<()> {
        let result = self.stop_discovery().await;
        for entry in self.devices.values_mut() {
            entry.device.detach();
        }
        self.forwarder.abort();
        self.gateway.close().await;
        result
    }

    fn bus_closed_error() -> Error {
        Error::with_message(ErrorKind::Internal, "gateway signal stream ended")
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Bus(event) => self.bus_event(event),
            Event::Completed(completion) => match self.devices.get_mut(&completion.address) {
                Some(entry) => {
                    entry
                        .device
                        .completed(completion.generation, completion.outcome, &self.tree, entry.observer.as_mut())
                }
                None => trace!("completion for unregistered device {}", completion.address),
            },
            Event::Timer(timer) => {
                if let Some(entry) = self.devices.get_mut(&timer.address) {
                    entry
                        .device
                        .timer_fired(timer.generation, timer.kind, entry.observer.as_mut());
                }
            }
            Event::Invoke(f) => f(self),
            Event::Stop | Event::BusClosed => (),
        }
    }

    fn bus_event(&mut self, event: BusEvent) {
        trace!("{:?}", event);
        match event {
            BusEvent::ObjectAdded { path, interfaces: added } => {
                let is_device = added.contains_key(interfaces::DEVICE);
                self.tree.add(path.clone(), added);
                if is_device {
                    self.advertised(&path);
                }
            }
            BusEvent::ObjectRemoved { path, interfaces: lost } => {
                let gone = self.tree.remove(&path, &lost);
                let removed = |name: &str| gone || lost.iter().any(|x| x == name);
                if path == self.adapter_path && removed(interfaces::ADAPTER) {
                    self.adapter_removed();
                } else if removed(interfaces::DEVICE) {
                    self.device_removed(&path);
                }
            }
            BusEvent::PropertiesChanged {
                path,
                interface,
                changed,
                invalidated,
            } => {
                self.tree.update(&path, &interface, &changed, &invalidated);
                match interface.as_str() {
                    interfaces::DEVICE => self.device_changed(&path, &changed, &invalidated),
                    interfaces::GATT_CHARACTERISTIC => self.characteristic_changed(&path, &changed),
                    interfaces::ADAPTER if path == self.adapter_path => {
                        if let Some(false) = changed.get(properties::POWERED).and_then(PropertyValue::as_bool) {
                            warn!("adapter {} powered off", self.config.adapter_name);
                            self.discovering = false;
                        }
                    }
                    _ => (),
                }
            }
        }
    }

    /// The address of a device object beneath this manager's adapter
    fn own_device_address(&self, path: &ObjectPath) -> Option<MacAddress> {
        match path.kind() {
            PathKind::Device { adapter, address } if adapter == self.config.adapter_name => Some(address),
            _ => None,
        }
    }

    /// The registered device owning the object at `path`
    fn owner(&self, path: &ObjectPath) -> Option<MacAddress> {
        let mut path = path.parent();
        while let Some(parent) = path {
            if let Some(address) = self.paths.get(&parent) {
                return Some(*address);
            }
            path = parent.parent();
        }
        None
    }

    fn new_device(&self, address: MacAddress) -> Device {
        let mut device = Device::new(
            address,
            self.config.clone(),
            self.gateway.clone(),
            self.dispatcher.handle().clone(),
        );
        if let Some(props) = self.tree.interface(device.path(), interfaces::DEVICE) {
            device.update_properties(props, &[]);
        }
        device
    }

    /// Registers the device unless it is registered already or the observer declines it. Returns `true` if the
    /// device is registered afterwards.
    fn register(&mut self, address: MacAddress) -> bool {
        if self.devices.contains_key(&address) {
            return true;
        }
        let Some(observer) = self.observer.make_device(&address) else {
            trace!("not managing {}", address);
            return false;
        };
        let device = self.new_device(address);
        debug!("registered {}", device);
        self.paths.insert(device.path().clone(), address);
        self.devices.insert(address, Entry { device, observer });
        true
    }

    /// An advertisement of the device at `path` was observed.
    fn advertised(&mut self, path: &ObjectPath) {
        let Some(address) = self.own_device_address(path) else {
            return;
        };
        if !self.register(address) {
            return;
        }
        let Some(entry) = self.devices.get_mut(&address) else {
            return;
        };
        if self.discovered.insert(address) {
            info!("discovered {}", entry.device);
            self.observer.device_discovered(&mut entry.device);
        } else {
            entry.observer.advertised(&mut entry.device);
        }
    }

    fn device_changed(&mut self, path: &ObjectPath, changed: &PropertyMap, invalidated: &[String]) {
        let Some(address) = self.paths.get(path).copied() else {
            // First sight of this device
            self.advertised(path);
            return;
        };
        if let Some(entry) = self.devices.get_mut(&address) {
            entry
                .device
                .properties_changed(changed, invalidated, &self.tree, entry.observer.as_mut());
        }
        if ADVERTISEMENT_PROPERTIES.iter().any(|x| changed.contains_key(*x)) {
            self.advertised(path);
        }
    }

    fn characteristic_changed(&mut self, path: &ObjectPath, changed: &PropertyMap) {
        let Some(address) = self.owner(path) else {
            return;
        };
        let Some(entry) = self.devices.get_mut(&address) else {
            return;
        };
        if let Some(notifying) = changed.get(properties::NOTIFYING).and_then(PropertyValue::as_bool) {
            entry.device.notifying_changed(path, notifying);
        }
        if let Some(value) = changed.get(properties::VALUE).and_then(PropertyValue::as_bytes) {
            entry.device.value_changed(path, value, entry.observer.as_mut());
        }
    }

    fn device_removed(&mut self, path: &ObjectPath) {
        let Some(address) = self.paths.remove(path) else {
            return;
        };
        let Some(mut entry) = self.devices.shift_remove(&address) else {
            return;
        };
        info!("{} removed", entry.device);
        entry.device.removed(entry.observer.as_mut());
        self.observer.device_removed(&address);
    }

    fn adapter_removed(&mut self) {
        warn!("adapter {} removed", self.config.adapter_name);
        self.discovering = false;
        for entry in self.devices.values_mut() {
            entry.device.removed(entry.observer.as_mut());
        }
    }
}
