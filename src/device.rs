use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::bus::{interfaces, properties, BusGateway, ObjectTree, PropertyMap, PropertyValue};
use crate::characteristic::{Link, ReadReport};
use crate::dispatch::{DispatcherHandle, Outcome, TimerEvent, TimerKind};
use crate::error::{names, BusRequest, ErrorKind};
use crate::pending::{pending, Resolver};
use crate::service::resolve_services;
use crate::{
    Characteristic, DeviceObserver, DeviceState, Error, MacAddress, ManagerConfig, ObjectPath, Pending, Result,
    Service, Uuid,
};

// Unique across devices, so a device replaced under the same address never accepts its predecessor's completions
fn next_generation() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A Bluetooth LE device
///
/// The connection and service-resolution state machine for one remote peer. Devices are owned by a
/// [`DeviceManager`][crate::DeviceManager], which routes the management service's signals to them; state transitions
/// are reported to the device's [`DeviceObserver`].
///
/// The [`services`][Device::services] are only available while the device is in
/// [`ServicesResolved`][DeviceState::ServicesResolved]. Leaving that state invalidates every [`Service`] and
/// [`Characteristic`] previously handed out.
pub struct Device {
    address: MacAddress,
    adapter_name: String,
    path: ObjectPath,
    state: DeviceState,
    // Renewed whenever the device leaves a phase; completions and timers from older phases are ignored
    generation: u64,
    resolve_attempts: u32,
    services: Vec<Service>,
    link: Option<Arc<Link>>,
    connect_waiters: Vec<Resolver<()>>,
    disconnect_waiters: Vec<Resolver<()>>,
    alias: Option<String>,
    name: Option<String>,
    rssi: Option<i16>,
    advertised_uuids: Vec<Uuid>,
    gateway: Arc<dyn BusGateway>,
    dispatcher: DispatcherHandle,
    config: Arc<ManagerConfig>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("adapter_name", &self.adapter_name)
            .field("state", &self.state)
            .field("alias", &self.alias)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} ({alias})", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

impl Device {
    pub(crate) fn new(
        address: MacAddress,
        config: Arc<ManagerConfig>,
        gateway: Arc<dyn BusGateway>,
        dispatcher: DispatcherHandle,
    ) -> Self {
        Device {
            address,
            adapter_name: config.adapter_name.clone(),
            path: ObjectPath::device(&config.adapter_name, &address),
            state: DeviceState::Disconnected,
            generation: next_generation(),
            resolve_attempts: 0,
            services: Vec::new(),
            link: None,
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            alias: None,
            name: None,
            rssi: None,
            advertised_uuids: Vec::new(),
            gateway,
            dispatcher,
            config,
        }
    }

    /// This device's hardware address
    pub fn address(&self) -> MacAddress {
        self.address
    }

    /// Name of the local adapter this device is reached through
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// The bus path of this device
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// The current connection state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Whether a connection is established (services may still be resolving)
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            DeviceState::Connected | DeviceState::ResolvingServices | DeviceState::ServicesResolved
        )
    }

    /// Whether the GATT tree is available
    pub fn is_services_resolved(&self) -> bool {
        self.state == DeviceState::ServicesResolved
    }

    /// The user-visible name of the device, as last reported by the management service
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The name the device advertises, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Signal strength of the last received advertisement, in dBm
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Service UUIDs the device advertises
    pub fn advertised_uuids(&self) -> &[Uuid] {
        &self.advertised_uuids
    }

    /// Number of service-resolution attempts made since the device last connected
    pub fn resolve_attempts(&self) -> u32 {
        self.resolve_attempts
    }

    /// A handle to the dispatcher this device's events are processed on
    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    /// The resolved GATT services, in the order the management service reported them. Empty unless the state is
    /// [`ServicesResolved`][DeviceState::ServicesResolved].
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// The first resolved service with the given [`Uuid`]
    pub fn service(&self, uuid: Uuid) -> Option<&Service> {
        self.services.iter().find(|x| x.uuid() == uuid)
    }

    /// Looks up a characteristic by service and characteristic [`Uuid`]
    pub fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<&Characteristic> {
        self.service(service)?.characteristic(characteristic)
    }

    /// Connects to the device.
    ///
    /// The outcome is reported through [`DeviceObserver::connect_succeeded`] or [`DeviceObserver::connect_failed`],
    /// and through the returned [`Pending`]. Service resolution starts automatically once connected.
    ///
    /// Calling this while a connection is being established or is already up has no effect; the returned
    /// [`Pending`] then follows the existing connection. Fails with [`Busy`][ErrorKind::Busy] while disconnecting.
    pub fn connect(&mut self) -> Result<Pending<()>> {
        match self.state {
            DeviceState::Disconnected => {
                self.generation = next_generation();
                self.resolve_attempts = 0;
                self.state = DeviceState::Connecting;
                info!("connecting to {}", self);

                let (resolver, pending) = pending();
                self.connect_waiters.push(resolver);

                let gateway = self.gateway.clone();
                let path = self.path.clone();
                self.dispatcher.complete(
                    self.address,
                    self.generation,
                    async move { gateway.connect(&path).await },
                    Outcome::Connect,
                );
                if let Some(timeout) = self.config.connect_timeout {
                    self.dispatcher.schedule(timeout, self.timer(TimerKind::Connect));
                }
                Ok(pending)
            }
            DeviceState::Connecting => {
                let (resolver, pending) = pending();
                self.connect_waiters.push(resolver);
                Ok(pending)
            }
            DeviceState::Connected | DeviceState::ResolvingServices | DeviceState::ServicesResolved => {
                let (resolver, pending) = pending();
                resolver.resolve(Ok(()));
                Ok(pending)
            }
            DeviceState::Disconnecting => Err(Error::with_message(ErrorKind::Busy, "device is disconnecting")),
        }
    }

    /// Disconnects from the device.
    ///
    /// All services and characteristics are invalidated immediately and every outstanding operation on them fails
    /// with [`NotConnected`][ErrorKind::NotConnected]. Completion is reported through
    /// [`DeviceObserver::disconnect_succeeded`] (or [`DeviceObserver::disconnect_failed`] if the device still
    /// reports a connection afterwards).
    ///
    /// Fails with [`NotConnected`][ErrorKind::NotConnected] if the device is disconnected already.
    pub fn disconnect(&mut self) -> Result<Pending<()>> {
        match self.state {
            DeviceState::Disconnected => Err(Error::with_message(ErrorKind::NotConnected, "device is not connected")),
            DeviceState::Disconnecting => {
                let (resolver, pending) = pending();
                self.disconnect_waiters.push(resolver);
                Ok(pending)
            }
            DeviceState::Connecting
            | DeviceState::Connected
            | DeviceState::ResolvingServices
            | DeviceState::ServicesResolved => {
                info!("disconnecting from {}", self);
                self.connect_waiters.clear();
                self.teardown();
                self.state = DeviceState::Disconnecting;

                let (resolver, pending) = pending();
                self.disconnect_waiters.push(resolver);

                let gateway = self.gateway.clone();
                let path = self.path.clone();
                self.dispatcher.complete(
                    self.address,
                    self.generation,
                    async move { gateway.disconnect(&path).await },
                    Outcome::Disconnect,
                );
                Ok(pending)
            }
        }
    }

    fn timer(&self, kind: TimerKind) -> TimerEvent {
        TimerEvent {
            address: self.address,
            generation: self.generation,
            kind,
        }
    }

    /// Mirrors advertisement and identity properties.
    pub(crate) fn update_properties(&mut self, changed: &PropertyMap, invalidated: &[String]) {
        for (name, value) in changed {
            match name.as_str() {
                properties::ALIAS => self.alias = value.as_str().map(str::to_owned),
                properties::NAME => self.name = value.as_str().map(str::to_owned),
                properties::RSSI => self.rssi = value.as_i16(),
                properties::UUIDS => {
                    self.advertised_uuids = value
                        .as_string_list()
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|x| Uuid::parse_str(x).ok())
                        .collect()
                }
                _ => (),
            }
        }
        for name in invalidated {
            match name.as_str() {
                properties::ALIAS => self.alias = None,
                properties::NAME => self.name = None,
                properties::RSSI => self.rssi = None,
                properties::UUIDS => self.advertised_uuids.clear(),
                _ => (),
            }
        }
    }

    /// Reacts to a change of the device object's properties. `tree` already reflects the change.
    pub(crate) fn properties_changed(
        &mut self,
        changed: &PropertyMap,
        invalidated: &[String],
        tree: &ObjectTree,
        observer: &mut dyn DeviceObserver,
    ) {
        self.update_properties(changed, invalidated);

        if let Some(connected) = changed.get(properties::CONNECTED).and_then(PropertyValue::as_bool) {
            self.connected_changed(connected, tree, observer);
        }
        if let Some(resolved) = changed.get(properties::SERVICES_RESOLVED).and_then(PropertyValue::as_bool) {
            self.services_resolved_changed(resolved, tree, observer);
        }
    }

    fn connected_changed(&mut self, connected: bool, tree: &ObjectTree, observer: &mut dyn DeviceObserver) {
        match (connected, self.state) {
            (true, DeviceState::Connecting) => self.connected(tree, observer),
            (false, DeviceState::Disconnecting) => self.disconnected(observer),
            (false, DeviceState::Connected | DeviceState::ResolvingServices | DeviceState::ServicesResolved) => {
                info!("{} lost its connection", self);
                self.teardown();
                self.disconnected(observer);
            }
            _ => trace!("{}: Connected={} in state {:?}", self.address, connected, self.state),
        }
    }

    fn services_resolved_changed(&mut self, resolved: bool, tree: &ObjectTree, observer: &mut dyn DeviceObserver) {
        match (resolved, self.state) {
            (true, DeviceState::ResolvingServices) => self.finish_resolution(tree, observer),
            (false, DeviceState::ServicesResolved) => {
                debug!("{}: services changed, resolving again", self.address);
                self.teardown();
                self.state = DeviceState::ResolvingServices;
                self.resolve_attempts = 1;
                self.dispatcher
                    .schedule(self.config.resolve_timeout, self.timer(TimerKind::Resolve { attempt: 1 }));
            }
            _ => (),
        }
    }

    fn connected(&mut self, tree: &ObjectTree, observer: &mut dyn DeviceObserver) {
        info!("connected to {}", self);
        self.state = DeviceState::Connected;
        for waiter in self.connect_waiters.drain(..) {
            waiter.resolve(Ok(()));
        }
        observer.connect_succeeded(self);

        // The callback may have disconnected already
        if self.state == DeviceState::Connected {
            self.state = DeviceState::ResolvingServices;
            self.resolve_attempts = 1;
            let resolved = tree
                .property(&self.path, interfaces::DEVICE, properties::SERVICES_RESOLVED)
                .and_then(PropertyValue::as_bool);
            if resolved == Some(true) {
                self.finish_resolution(tree, observer);
            } else {
                self.request_resolution();
            }
        }
    }

    fn request_resolution(&mut self) {
        debug!(
            "{}: waiting for services (attempt {}/{})",
            self.address, self.resolve_attempts, self.config.max_resolve_attempts
        );
        let gateway = self.gateway.clone();
        let path = self.path.clone();
        self.dispatcher.complete(
            self.address,
            self.generation,
            async move {
                gateway
                    .get_property(&path, interfaces::DEVICE, properties::SERVICES_RESOLVED)
                    .await
            },
            Outcome::ResolveProbe,
        );
        self.dispatcher.schedule(
            self.config.resolve_timeout,
            self.timer(TimerKind::Resolve {
                attempt: self.resolve_attempts,
            }),
        );
    }

    fn finish_resolution(&mut self, tree: &ObjectTree, observer: &mut dyn DeviceObserver) {
        self.generation = next_generation();
        let link = Arc::new(Link::new(
            self.address,
            self.generation,
            self.gateway.clone(),
            self.dispatcher.clone(),
        ));
        self.services = resolve_services(tree, &self.path, &link);
        self.link = Some(link);
        self.state = DeviceState::ServicesResolved;
        info!("{}: {} services resolved", self, self.services.len());
        observer.services_resolved(self);
    }

    fn connect_failed(&mut self, error: Error, observer: &mut dyn DeviceObserver) {
        warn!("connecting to {} failed: {}", self, error);
        self.generation = next_generation();
        self.state = DeviceState::Disconnected;
        for waiter in self.connect_waiters.drain(..) {
            waiter.resolve(Err(error.replicate()));
        }
        observer.connect_failed(self, error);
    }

    fn disconnected(&mut self, observer: &mut dyn DeviceObserver) {
        info!("disconnected from {}", self);
        self.generation = next_generation();
        self.state = DeviceState::Disconnected;
        for waiter in self.disconnect_waiters.drain(..) {
            waiter.resolve(Ok(()));
        }
        observer.disconnect_succeeded(self);
    }

    /// Drops the GATT tree and fails every operation outstanding on it.
    fn teardown(&mut self) {
        self.generation = next_generation();
        if let Some(link) = self.link.take() {
            link.invalidate();
        }
        for service in self.services.drain(..) {
            service.invalidate();
        }
    }

    /// The bus object of this device disappeared.
    pub(crate) fn removed(&mut self, observer: &mut dyn DeviceObserver) {
        match self.state {
            DeviceState::Disconnected => (),
            DeviceState::Connecting => {
                self.connect_failed(
                    Error::with_message(ErrorKind::NotConnected, "device was removed"),
                    observer,
                );
            }
            DeviceState::Connected
            | DeviceState::ResolvingServices
            | DeviceState::ServicesResolved
            | DeviceState::Disconnecting => {
                self.teardown();
                self.disconnected(observer);
            }
        }
    }

    /// The device is dropped from its manager without further callbacks.
    pub(crate) fn detach(&mut self) {
        if self.state != DeviceState::Disconnected {
            self.teardown();
            self.state = DeviceState::Disconnected;
            self.connect_waiters.clear();
            self.disconnect_waiters.clear();
            let gateway = self.gateway.clone();
            let path = self.path.clone();
            self.dispatcher.detach(async move {
                if let Err(err) = gateway.disconnect(&path).await {
                    debug!("disconnecting detached device {}: {}", path, err);
                }
            });
        }
    }

    pub(crate) fn timer_fired(&mut self, generation: u64, kind: TimerKind, observer: &mut dyn DeviceObserver) {
        if generation != self.generation {
            trace!("{}: ignoring stale {:?} timer", self.address, kind);
            return;
        }
        match kind {
            TimerKind::Connect if self.state == DeviceState::Connecting => {
                let gateway = self.gateway.clone();
                let path = self.path.clone();
                self.dispatcher.detach(async move {
                    if let Err(err) = gateway.disconnect(&path).await {
                        debug!("cancelling connection to {}: {}", path, err);
                    }
                });
                self.connect_failed(Error::with_message(ErrorKind::Timeout, "connection timed out"), observer);
            }
            TimerKind::Resolve { attempt }
                if self.state == DeviceState::ResolvingServices && attempt == self.resolve_attempts =>
            {
                if self.resolve_attempts < self.config.max_resolve_attempts {
                    self.resolve_attempts += 1;
                    self.request_resolution();
                } else {
                    let error = Error::with_message(
                        ErrorKind::Timeout,
                        format!("services not resolved after {} attempts", self.resolve_attempts),
                    );
                    warn!("{}: {}", self, error);
                    observer.services_resolution_failed(self, error);
                    if self.state == DeviceState::ResolvingServices {
                        match self.disconnect() {
                            Ok(_) => (),
                            Err(err) => debug!("{}: disconnecting after failed resolution: {}", self.address, err),
                        }
                    }
                }
            }
            _ => trace!("{}: ignoring {:?} timer in state {:?}", self.address, kind, self.state),
        }
    }

    pub(crate) fn completed(
        &mut self,
        generation: u64,
        outcome: Outcome,
        tree: &ObjectTree,
        observer: &mut dyn DeviceObserver,
    ) {
        if generation != self.generation {
            trace!("{}: ignoring stale completion {:?}", self.address, outcome);
            return;
        }
        match outcome {
            Outcome::Connect(result) if self.state == DeviceState::Connecting => match result {
                Ok(()) => self.connected(tree, observer),
                Err(err) if err.is(names::IN_PROGRESS) || err.is_failed_with("Operation already in progress") => {
                    debug!("{}: connection already in progress", self.address);
                }
                Err(err) if err.is(names::ALREADY_CONNECTED) => self.connected(tree, observer),
                Err(err) if err.is(names::UNKNOWN_OBJECT) => self.connect_failed(
                    Error::new(
                        ErrorKind::ConnectFailed,
                        Some(Box::new(err)),
                        "device does not exist, check adapter name and MAC address".to_string(),
                    ),
                    observer,
                ),
                Err(err) => self.connect_failed(Error::from_bus(BusRequest::Connect, err), observer),
            },
            Outcome::ResolveProbe(result) if self.state == DeviceState::ResolvingServices => match result {
                Ok(PropertyValue::Bool(true)) => self.finish_resolution(tree, observer),
                Ok(_) => (),
                Err(err) => debug!("{}: querying ServicesResolved failed: {}", self.address, err),
            },
            Outcome::Disconnect(result) if self.state == DeviceState::Disconnecting => match result {
                Ok(()) => self.disconnected(observer),
                Err(err) if err.means_not_connected() => self.disconnected(observer),
                Err(err) => {
                    debug!("{}: disconnect failed ({}), checking connection", self.address, err);
                    let gateway = self.gateway.clone();
                    let path = self.path.clone();
                    self.dispatcher.complete(
                        self.address,
                        self.generation,
                        async move { gateway.get_property(&path, interfaces::DEVICE, properties::CONNECTED).await },
                        move |result| Outcome::ConnectedProbe {
                            disconnect_error: err,
                            result,
                        },
                    );
                }
            },
            Outcome::ConnectedProbe {
                disconnect_error,
                result,
            } if self.state == DeviceState::Disconnecting => match result {
                Ok(PropertyValue::Bool(false)) => self.disconnected(observer),
                _ => {
                    let error = Error::from_bus(BusRequest::Disconnect, disconnect_error);
                    warn!("disconnecting from {} failed: {}", self, error);
                    self.generation = next_generation();
                    self.state = DeviceState::Disconnected;
                    for waiter in self.disconnect_waiters.drain(..) {
                        waiter.resolve(Err(error.replicate()));
                    }
                    observer.disconnect_failed(self, error);
                }
            },
            Outcome::Read { characteristic, result } => {
                let Some(characteristic) = self.find_characteristic(&characteristic) else {
                    return;
                };
                match characteristic.finish_read(result) {
                    Some(ReadReport::Value(value)) => {
                        observer.characteristic_value_updated(self, &characteristic, &value)
                    }
                    Some(ReadReport::Failed(error)) => {
                        observer.characteristic_read_value_failed(self, &characteristic, error)
                    }
                    Some(ReadReport::AlreadyReported) | None => (),
                }
            }
            Outcome::Write { characteristic, result } => {
                let Some(characteristic) = self.find_characteristic(&characteristic) else {
                    return;
                };
                match characteristic.finish_write(result) {
                    Some(Ok(())) => observer.characteristic_write_value_succeeded(self, &characteristic),
                    Some(Err(error)) => observer.characteristic_write_value_failed(self, &characteristic, error),
                    None => (),
                }
            }
            Outcome::Notify {
                characteristic,
                enable,
                result,
            } => {
                let Some(characteristic) = self.find_characteristic(&characteristic) else {
                    return;
                };
                match (enable, characteristic.finish_notify(enable, result)) {
                    (true, Some(Ok(()))) => observer.characteristic_enable_notifications_succeeded(self, &characteristic),
                    (true, Some(Err(error))) => {
                        observer.characteristic_enable_notifications_failed(self, &characteristic, error)
                    }
                    (false, Some(Ok(()))) => {
                        observer.characteristic_disable_notifications_succeeded(self, &characteristic)
                    }
                    (false, Some(Err(error))) => {
                        observer.characteristic_disable_notifications_failed(self, &characteristic, error)
                    }
                    (_, None) => (),
                }
            }
            outcome => trace!("{}: ignoring {:?} in state {:?}", self.address, outcome, self.state),
        }
    }

    /// A `Value` change was pushed for one of this device's characteristics.
    pub(crate) fn value_changed(&mut self, path: &ObjectPath, value: &[u8], observer: &mut dyn DeviceObserver) {
        if self.state != DeviceState::ServicesResolved {
            return;
        }
        if let Some(characteristic) = self.find_characteristic(path) {
            characteristic.value_changed(value);
            observer.characteristic_value_updated(self, &characteristic, value);
        }
    }

    pub(crate) fn notifying_changed(&mut self, path: &ObjectPath, notifying: bool) {
        if let Some(characteristic) = self.find_characteristic(path) {
            characteristic.notifying_changed(notifying);
        }
    }

    fn find_characteristic(&self, path: &ObjectPath) -> Option<Characteristic> {
        self.services
            .iter()
            .filter(|x| path.is_child_of(x.path()))
            .flat_map(|x| x.characteristics())
            .find(|x| x.path() == path)
            .cloned()
    }
}
