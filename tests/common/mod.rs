//! A scripted in-memory gateway and a recording observer shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use gattlink::bus::{
    interfaces, properties, BusEvent, BusEventStream, BusGateway, BusObject, DiscoveryFilter, InterfaceMap,
    PropertyMap,
};
use gattlink::error::{names, BusError, ErrorKind};
use gattlink::{
    Characteristic, Device, DeviceManager, DeviceObserver, Error, MacAddress, ManagerConfig, ManagerObserver,
    ObjectPath, PropertyValue, Uuid,
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const PERIPHERAL: MacAddress = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
pub const OTHER: MacAddress = MacAddress::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

pub const DEVICE_INFORMATION: Uuid = gattlink::btuuid::services::DEVICE_INFORMATION;
pub const FIRMWARE_REVISION: Uuid = gattlink::btuuid::characteristics::FIRMWARE_REVISION_STRING;
pub const BATTERY: Uuid = gattlink::btuuid::services::BATTERY;
pub const BATTERY_LEVEL: Uuid = gattlink::btuuid::characteristics::BATTERY_LEVEL;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the fake answers one request.
#[derive(Debug)]
pub enum Reply {
    Ok,
    Value(PropertyValue),
    Bytes(Vec<u8>),
    Err(BusError),
    Hold(oneshot::Receiver<Reply>),
}

impl Reply {
    pub fn err(name: &str, message: &str) -> Self {
        Reply::Err(BusError::new(name, message))
    }
}

/// One request the fake received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: &'static str,
    pub path: ObjectPath,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct State {
    objects: Vec<BusObject>,
    subscribers: Vec<mpsc::UnboundedSender<BusEvent>>,
    replies: HashMap<&'static str, VecDeque<Reply>>,
    calls: Vec<Call>,
}

/// An in-memory management service.
///
/// Requests succeed unless a reply was scripted for them. Property reads are answered from the object store, which
/// [`emit`][FakeGateway::emit] keeps in sync with the signals sent.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<State>,
}

impl FakeGateway {
    pub fn new(objects: Vec<BusObject>) -> Arc<Self> {
        let gateway = FakeGateway::default();
        gateway.lock().objects = objects;
        Arc::new(gateway)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Queues `reply` for the next call of `method`.
    pub fn script(&self, method: &'static str, reply: Reply) {
        self.lock().replies.entry(method).or_default().push_back(reply);
    }

    /// Makes the next call of `method` wait until the returned sender is used (or dropped).
    pub fn hold(&self, method: &'static str) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.script(method, Reply::Hold(rx));
        tx
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        self.lock().calls.iter().filter(|x| x.method == method).cloned().collect()
    }

    /// Applies `event` to the object store and sends it to every subscriber.
    pub fn emit(&self, event: BusEvent) {
        let mut state = self.lock();
        match &event {
            BusEvent::ObjectAdded { path, interfaces } => match state.objects.iter_mut().find(|x| x.path == *path) {
                Some(object) => object.interfaces.extend(interfaces.clone()),
                None => state.objects.push(BusObject {
                    path: path.clone(),
                    interfaces: interfaces.clone(),
                }),
            },
            BusEvent::ObjectRemoved { path, .. } => state.objects.retain(|x| !x.path.starts_with(path)),
            BusEvent::PropertiesChanged {
                path,
                interface,
                changed,
                invalidated,
            } => {
                if let Some(object) = state.objects.iter_mut().find(|x| x.path == *path) {
                    let props = object.interfaces.entry(interface.clone()).or_default();
                    props.extend(changed.clone());
                    for name in invalidated {
                        props.remove(name);
                    }
                }
            }
        }
        state.subscribers.retain(|x| x.send(event.clone()).is_ok());
    }

    pub fn add_object(&self, object: BusObject) {
        self.emit(BusEvent::ObjectAdded {
            path: object.path,
            interfaces: object.interfaces,
        });
    }

    pub fn remove_object(&self, path: ObjectPath, interface: &str) {
        self.emit(BusEvent::ObjectRemoved {
            path,
            interfaces: vec![interface.to_string()],
        });
    }

    /// Ends every signal stream, as if the service went away.
    pub fn hang_up(&self) {
        self.lock().subscribers.clear();
    }

    pub fn set_device(&self, address: &MacAddress, changed: &[(&str, PropertyValue)]) {
        self.emit(changed_event(device_path(address), interfaces::DEVICE, changed));
    }

    pub fn set_characteristic(&self, path: &ObjectPath, changed: &[(&str, PropertyValue)]) {
        self.emit(changed_event(path.clone(), interfaces::GATT_CHARACTERISTIC, changed));
    }

    /// Announces `objects` and then flips `ServicesResolved` on, the way the service does after discovery.
    pub fn resolve_services(&self, address: &MacAddress, objects: Vec<BusObject>) {
        for object in objects {
            self.add_object(object);
        }
        self.set_device(address, &[(properties::SERVICES_RESOLVED, PropertyValue::Bool(true))]);
    }

    /// Drops the connection the way the service reports a link loss.
    pub fn drop_link(&self, address: &MacAddress) {
        self.set_device(
            address,
            &[
                (properties::SERVICES_RESOLVED, PropertyValue::Bool(false)),
                (properties::CONNECTED, PropertyValue::Bool(false)),
            ],
        );
    }

    fn property(&self, path: &ObjectPath, interface: &str, name: &str) -> Option<PropertyValue> {
        self.lock()
            .objects
            .iter()
            .find(|x| x.path == *path)?
            .interfaces
            .get(interface)?
            .get(name)
            .cloned()
    }

    async fn request(&self, method: &'static str, path: &ObjectPath, data: &[u8]) -> Reply {
        let reply = {
            let mut state = self.lock();
            state.calls.push(Call {
                method,
                path: path.clone(),
                data: data.to_vec(),
            });
            state.replies.get_mut(method).and_then(VecDeque::pop_front)
        };
        match reply {
            Some(Reply::Hold(rx)) => rx
                .await
                .unwrap_or_else(|_| Reply::err(names::NO_REPLY, "Did not receive a reply")),
            Some(reply) => reply,
            None => Reply::Ok,
        }
    }

    async fn unit(&self, method: &'static str, path: &ObjectPath, data: &[u8]) -> Result<(), BusError> {
        match self.request(method, path, data).await {
            Reply::Err(err) => Err(err),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BusGateway for FakeGateway {
    fn events(&self) -> BusEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    async fn managed_objects(&self) -> Result<Vec<BusObject>, BusError> {
        Ok(self.lock().objects.clone())
    }

    async fn get_property(&self, path: &ObjectPath, interface: &str, name: &str) -> Result<PropertyValue, BusError> {
        match self.request("get_property", path, name.as_bytes()).await {
            Reply::Value(value) => Ok(value),
            Reply::Err(err) => Err(err),
            _ => self
                .property(path, interface, name)
                .ok_or_else(|| BusError::new(names::UNKNOWN_OBJECT, format!("{path} has no {name}"))),
        }
    }

    async fn set_property(
        &self,
        path: &ObjectPath,
        interface: &str,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), BusError> {
        self.unit("set_property", path, name.as_bytes()).await?;
        self.emit(changed_event(path.clone(), interface, &[(name, value)]));
        Ok(())
    }

    async fn set_discovery_filter(&self, adapter: &ObjectPath, _filter: &DiscoveryFilter) -> Result<(), BusError> {
        self.unit("set_discovery_filter", adapter, &[]).await
    }

    async fn start_discovery(&self, adapter: &ObjectPath) -> Result<(), BusError> {
        self.unit("start_discovery", adapter, &[]).await
    }

    async fn stop_discovery(&self, adapter: &ObjectPath) -> Result<(), BusError> {
        self.unit("stop_discovery", adapter, &[]).await
    }

    async fn remove_device(&self, _adapter: &ObjectPath, device: &ObjectPath) -> Result<(), BusError> {
        self.unit("remove_device", device, &[]).await
    }

    async fn connect(&self, device: &ObjectPath) -> Result<(), BusError> {
        self.unit("connect", device, &[]).await
    }

    async fn disconnect(&self, device: &ObjectPath) -> Result<(), BusError> {
        self.unit("disconnect", device, &[]).await
    }

    async fn read_value(&self, characteristic: &ObjectPath, _offset: u16) -> Result<Vec<u8>, BusError> {
        match self.request("read_value", characteristic, &[]).await {
            Reply::Bytes(value) => Ok(value),
            Reply::Err(err) => Err(err),
            _ => Ok(Vec::new()),
        }
    }

    async fn write_value(&self, characteristic: &ObjectPath, value: &[u8], _offset: u16) -> Result<(), BusError> {
        self.unit("write_value", characteristic, value).await
    }

    async fn start_notify(&self, characteristic: &ObjectPath) -> Result<(), BusError> {
        self.unit("start_notify", characteristic, &[]).await
    }

    async fn stop_notify(&self, characteristic: &ObjectPath) -> Result<(), BusError> {
        self.unit("stop_notify", characteristic, &[]).await
    }
}

fn props(entries: &[(&str, PropertyValue)]) -> PropertyMap {
    entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn object(path: ObjectPath, interface: &str, entries: &[(&str, PropertyValue)]) -> BusObject {
    BusObject {
        path,
        interfaces: InterfaceMap::from([(interface.to_string(), props(entries))]),
    }
}

pub fn changed_event(path: ObjectPath, interface: &str, changed: &[(&str, PropertyValue)]) -> BusEvent {
    BusEvent::PropertiesChanged {
        path,
        interface: interface.to_string(),
        changed: props(changed),
        invalidated: Vec::new(),
    }
}

pub fn device_path(address: &MacAddress) -> ObjectPath {
    ObjectPath::device("hci0", address)
}

pub fn adapter(powered: bool) -> BusObject {
    object(
        ObjectPath::adapter("hci0"),
        interfaces::ADAPTER,
        &[(properties::POWERED, PropertyValue::Bool(powered))],
    )
}

pub fn device(address: &MacAddress, alias: &str) -> BusObject {
    object(
        device_path(address),
        interfaces::DEVICE,
        &[
            (properties::ADDRESS, PropertyValue::String(address.to_string())),
            (properties::ALIAS, PropertyValue::String(alias.to_string())),
            (properties::CONNECTED, PropertyValue::Bool(false)),
            (properties::SERVICES_RESOLVED, PropertyValue::Bool(false)),
        ],
    )
}

pub fn service(address: &MacAddress, handle: u16, uuid: Uuid) -> BusObject {
    object(
        device_path(address).service(handle),
        interfaces::GATT_SERVICE,
        &[
            (properties::UUID, PropertyValue::String(uuid.to_string())),
            (properties::PRIMARY, PropertyValue::Bool(true)),
        ],
    )
}

pub fn characteristic(address: &MacAddress, service: u16, handle: u16, uuid: Uuid, flags: &[&str]) -> BusObject {
    object(
        device_path(address).service(service).characteristic(handle),
        interfaces::GATT_CHARACTERISTIC,
        &[
            (properties::UUID, PropertyValue::String(uuid.to_string())),
            (
                properties::FLAGS,
                PropertyValue::StringList(flags.iter().map(|x| x.to_string()).collect()),
            ),
            (properties::NOTIFYING, PropertyValue::Bool(false)),
        ],
    )
}

pub fn firmware_path(address: &MacAddress) -> ObjectPath {
    device_path(address).service(0x0010).characteristic(0x0011)
}

pub fn battery_path(address: &MacAddress) -> ObjectPath {
    device_path(address).service(0x0020).characteristic(0x0021)
}

/// Device Information with a readable Firmware Revision String, and Battery with a notifying, writable level.
pub fn gatt_tree(address: &MacAddress) -> Vec<BusObject> {
    vec![
        service(address, 0x0010, DEVICE_INFORMATION),
        characteristic(address, 0x0010, 0x0011, FIRMWARE_REVISION, &["read"]),
        service(address, 0x0020, BATTERY),
        characteristic(address, 0x0020, 0x0021, BATTERY_LEVEL, &["read", "write", "notify"]),
    ]
}

/// Lets spawned requests and the signal forwarder run, then processes everything they posted.
pub async fn settle(manager: &mut DeviceManager) {
    for _ in 0..16 {
        tokio::task::yield_now().await;
        manager.run_pending();
    }
}

/// An observer callback, as recorded by [`Recorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Discovered(MacAddress),
    Removed(MacAddress),
    Advertised(MacAddress),
    ConnectSucceeded,
    ConnectFailed(ErrorKind),
    DisconnectSucceeded,
    DisconnectFailed(ErrorKind),
    ServicesResolved(usize),
    ResolutionFailed(ErrorKind),
    ValueUpdated(Uuid, Vec<u8>),
    ReadFailed(Uuid, ErrorKind),
    WriteSucceeded(Uuid),
    WriteFailed(Uuid, ErrorKind),
    NotifyEnabled(Uuid),
    NotifyEnableFailed(Uuid, ErrorKind),
    NotifyDisabled(Uuid),
    NotifyDisableFailed(Uuid, ErrorKind),
}

#[derive(Debug, Clone, Default)]
pub struct Log(Arc<Mutex<Vec<Event>>>);

impl Log {
    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    /// Everything recorded since the last call
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// Records every callback into a shared [`Log`].
pub struct Recorder {
    pub log: Log,
    pub accept: fn(&MacAddress) -> bool,
    pub connect_on_discovery: bool,
}

impl Recorder {
    pub fn new() -> (Self, Log) {
        let log = Log::default();
        let recorder = Recorder {
            log: log.clone(),
            accept: |_| true,
            connect_on_discovery: false,
        };
        (recorder, log)
    }
}

impl ManagerObserver for Recorder {
    fn make_device(&mut self, address: &MacAddress) -> Option<Box<dyn DeviceObserver>> {
        if (self.accept)(address) {
            Some(Box::new(DeviceRecorder(self.log.clone())))
        } else {
            None
        }
    }

    fn device_discovered(&mut self, device: &mut Device) {
        self.log.push(Event::Discovered(device.address()));
        if self.connect_on_discovery {
            device.connect().unwrap();
        }
    }

    fn device_removed(&mut self, address: &MacAddress) {
        self.log.push(Event::Removed(*address));
    }
}

pub struct DeviceRecorder(pub Log);

impl DeviceObserver for DeviceRecorder {
    fn advertised(&mut self, device: &mut Device) {
        self.0.push(Event::Advertised(device.address()));
    }

    fn connect_succeeded(&mut self, _device: &mut Device) {
        self.0.push(Event::ConnectSucceeded);
    }

    fn connect_failed(&mut self, _device: &mut Device, error: Error) {
        self.0.push(Event::ConnectFailed(error.kind()));
    }

    fn disconnect_succeeded(&mut self, _device: &mut Device) {
        self.0.push(Event::DisconnectSucceeded);
    }

    fn disconnect_failed(&mut self, _device: &mut Device, error: Error) {
        self.0.push(Event::DisconnectFailed(error.kind()));
    }

    fn services_resolved(&mut self, device: &mut Device) {
        self.0.push(Event::ServicesResolved(device.services().len()));
    }

    fn services_resolution_failed(&mut self, _device: &mut Device, error: Error) {
        self.0.push(Event::ResolutionFailed(error.kind()));
    }

    fn characteristic_value_updated(&mut self, _device: &mut Device, characteristic: &Characteristic, value: &[u8]) {
        self.0.push(Event::ValueUpdated(characteristic.uuid(), value.to_vec()));
    }

    fn characteristic_read_value_failed(&mut self, _device: &mut Device, characteristic: &Characteristic, error: Error) {
        self.0.push(Event::ReadFailed(characteristic.uuid(), error.kind()));
    }

    fn characteristic_write_value_succeeded(&mut self, _device: &mut Device, characteristic: &Characteristic) {
        self.0.push(Event::WriteSucceeded(characteristic.uuid()));
    }

    fn characteristic_write_value_failed(&mut self, _device: &mut Device, characteristic: &Characteristic, error: Error) {
        self.0.push(Event::WriteFailed(characteristic.uuid(), error.kind()));
    }

    fn characteristic_enable_notifications_succeeded(&mut self, _device: &mut Device, characteristic: &Characteristic) {
        self.0.push(Event::NotifyEnabled(characteristic.uuid()));
    }

    fn characteristic_enable_notifications_failed(
        &mut self,
        _device: &mut Device,
        characteristic: &Characteristic,
        error: Error,
    ) {
        self.0.push(Event::NotifyEnableFailed(characteristic.uuid(), error.kind()));
    }

    fn characteristic_disable_notifications_succeeded(&mut self, _device: &mut Device, characteristic: &Characteristic) {
        self.0.push(Event::NotifyDisabled(characteristic.uuid()));
    }

    fn characteristic_disable_notifications_failed(
        &mut self,
        _device: &mut Device,
        characteristic: &Characteristic,
        error: Error,
    ) {
        self.0.push(Event::NotifyDisableFailed(characteristic.uuid(), error.kind()));
    }
}

/// A manager over an adapter with `PERIPHERAL` already known to the service.
pub async fn open() -> (DeviceManager, Arc<FakeGateway>, Log) {
    open_with(ManagerConfig::default(), vec![adapter(true), device(&PERIPHERAL, "Sensor")]).await
}

pub async fn open_with(config: ManagerConfig, objects: Vec<BusObject>) -> (DeviceManager, Arc<FakeGateway>, Log) {
    init_tracing();
    let gateway = FakeGateway::new(objects);
    let (recorder, log) = Recorder::new();
    let manager = DeviceManager::new(gateway.clone(), config, recorder).await.unwrap();
    (manager, gateway, log)
}

/// Connects `PERIPHERAL` and resolves its GATT tree.
pub async fn connect_and_resolve(manager: &mut DeviceManager, gateway: &FakeGateway, log: &Log) {
    let mut pending = manager.device_mut(&PERIPHERAL).unwrap().connect().unwrap();
    settle(manager).await;
    gateway.set_device(&PERIPHERAL, &[(properties::CONNECTED, PropertyValue::Bool(true))]);
    settle(manager).await;
    assert!(pending.try_result().unwrap().is_ok());
    gateway.resolve_services(&PERIPHERAL, gatt_tree(&PERIPHERAL));
    settle(manager).await;
    assert_eq!(log.take(), vec![Event::ConnectSucceeded, Event::ServicesResolved(2)]);
}
