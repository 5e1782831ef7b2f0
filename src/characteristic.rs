use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::bus::BusGateway;
use crate::dispatch::{DispatcherHandle, Outcome};
use crate::error::{BusError, BusRequest, ErrorKind};
use crate::pending::{pending, Resolver};
use crate::{CharacteristicProperties, Error, MacAddress, ObjectPath, Pending, Result, Uuid};

/// The connection a GATT tree was resolved on.
///
/// Shared by every [`Characteristic`] of one resolved tree. Once the device disconnects (or the tree is rebuilt) the
/// link is invalidated and all handles holding it become inert.
pub(crate) struct Link {
    address: MacAddress,
    generation: u64,
    alive: AtomicBool,
    gateway: Arc<dyn BusGateway>,
    dispatcher: DispatcherHandle,
}

impl Link {
    pub fn new(address: MacAddress, generation: u64, gateway: Arc<dyn BusGateway>, dispatcher: DispatcherHandle) -> Self {
        Link {
            address,
            generation,
            alive: AtomicBool::new(true),
            gateway,
            dispatcher,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn invalidate(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[derive(Debug)]
struct QueuedWrite {
    value: Vec<u8>,
    offset: u16,
    resolver: Resolver<()>,
}

#[derive(Debug, Default)]
struct Ops {
    read: Option<Resolver<Vec<u8>>>,
    // Last value pushed while the read was outstanding
    pushed_during_read: Option<Vec<u8>>,
    // The front entry is in flight
    writes: VecDeque<QueuedWrite>,
    notify: Option<(bool, Resolver<()>)>,
    notifying: bool,
}

#[derive(Debug)]
struct Inner {
    uuid: Uuid,
    path: ObjectPath,
    service_uuid: Uuid,
    properties: CharacteristicProperties,
    link: Arc<Link>,
    ops: Mutex<Ops>,
}

/// A Bluetooth GATT characteristic
///
/// A cheap handle into the resolved GATT tree of a [`Device`][crate::Device]. Clones share the same operation state.
/// Once the owning device disconnects, every operation on the handle fails with
/// [`NotConnected`][ErrorKind::NotConnected].
///
/// Operations only initiate a request. The outcome is delivered to the owning device's
/// [`DeviceObserver`][crate::DeviceObserver] and through the returned [`Pending`].
#[derive(Debug, Clone)]
pub struct Characteristic(Arc<Inner>);

impl PartialEq for Characteristic {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Characteristic {}

/// What the owning device reports after a read completes.
#[derive(Debug)]
pub(crate) enum ReadReport {
    Value(Vec<u8>),
    // A `Value` change was already reported while the read was outstanding
    AlreadyReported,
    Failed(Error),
}

impl Characteristic {
    pub(crate) fn new(
        uuid: Uuid,
        path: ObjectPath,
        service_uuid: Uuid,
        properties: CharacteristicProperties,
        link: Arc<Link>,
        notifying: bool,
    ) -> Self {
        Characteristic(Arc::new(Inner {
            uuid,
            path,
            service_uuid,
            properties,
            link,
            ops: Mutex::new(Ops {
                notifying,
                ..Default::default()
            }),
        }))
    }

    /// The [`Uuid`] identifying the type of this GATT characteristic
    pub fn uuid(&self) -> Uuid {
        self.0.uuid
    }

    /// The bus path of this characteristic
    pub fn path(&self) -> &ObjectPath {
        &self.0.path
    }

    /// The [`Uuid`] of the service this characteristic belongs to
    pub fn service_uuid(&self) -> Uuid {
        self.0.service_uuid
    }

    /// The address of the device this characteristic belongs to
    pub fn device_address(&self) -> MacAddress {
        self.0.link.address
    }

    /// The properties of this this GATT characteristic.
    ///
    /// Characteristic properties indicate which operations (e.g. read, write, notify, etc) may be performed on this
    /// characteristic.
    pub fn properties(&self) -> CharacteristicProperties {
        self.0.properties
    }

    /// Returns `false` once the owning device has disconnected or its services were rebuilt.
    pub fn is_valid(&self) -> bool {
        self.0.link.is_alive()
    }

    /// Is the device currently sending notifications for this characteristic?
    pub fn is_notifying(&self) -> bool {
        self.ops().notifying
    }

    /// Read the value of this characteristic from the device.
    ///
    /// On completion the owning device's observer receives
    /// [`characteristic_value_updated`][crate::DeviceObserver::characteristic_value_updated] or
    /// [`characteristic_read_value_failed`][crate::DeviceObserver::characteristic_read_value_failed]. Only one read
    /// may be outstanding per characteristic; a second one fails with [`Busy`][ErrorKind::Busy].
    ///
    /// If the device pushes a value while the read is outstanding, that push is reported as it arrives. The read's
    /// reply is then reported only if it differs from the last pushed value; the returned [`Pending`] always
    /// resolves with the reply.
    pub fn read_value(&self) -> Result<Pending<Vec<u8>>> {
        self.read_value_at(0)
    }

    /// Read the value of this characteristic starting at `offset`.
    pub fn read_value_at(&self, offset: u16) -> Result<Pending<Vec<u8>>> {
        self.require(self.0.properties.read, "read")?;

        let mut ops = self.ops();
        self.check_alive()?;
        if ops.read.is_some() {
            return Err(Error::with_message(ErrorKind::Busy, "a read is already outstanding"));
        }

        let (resolver, pending) = pending();
        ops.read = Some(resolver);
        ops.pushed_during_read = None;

        let link = &self.0.link;
        let gateway = link.gateway.clone();
        let path = self.0.path.clone();
        trace!(characteristic = %path, offset, "read");
        link.dispatcher.complete(
            link.address,
            link.generation,
            async move { gateway.read_value(&path, offset).await },
            {
                let characteristic = self.0.path.clone();
                move |result| Outcome::Read { characteristic, result }
            },
        );
        Ok(pending)
    }

    /// Write `value` to this characteristic.
    ///
    /// Writes are queued per characteristic and reach the device one at a time, in the order they were issued. Each
    /// completion is reported through
    /// [`characteristic_write_value_succeeded`][crate::DeviceObserver::characteristic_write_value_succeeded] or
    /// [`characteristic_write_value_failed`][crate::DeviceObserver::characteristic_write_value_failed].
    pub fn write_value(&self, value: &[u8]) -> Result<Pending<()>> {
        self.write_value_at(value, 0)
    }

    /// Write `value` to this characteristic starting at `offset`.
    pub fn write_value_at(&self, value: &[u8], offset: u16) -> Result<Pending<()>> {
        let props = self.0.properties;
        self.require(props.write || props.write_without_response, "write")?;

        let mut ops = self.ops();
        self.check_alive()?;

        let (resolver, pending) = pending();
        ops.writes.push_back(QueuedWrite {
            value: value.to_vec(),
            offset,
            resolver,
        });
        if ops.writes.len() == 1 {
            self.send_front_write(&ops);
        } else {
            trace!(characteristic = %self.0.path, queued = ops.writes.len() - 1, "write queued");
        }
        Ok(pending)
    }

    /// Enables notification of value changes for this GATT characteristic.
    ///
    /// While enabled, every value pushed by the device is reported through
    /// [`characteristic_value_updated`][crate::DeviceObserver::characteristic_value_updated].
    pub fn enable_notifications(&self) -> Result<Pending<()>> {
        self.set_notify(true)
    }

    /// Disables notification of value changes for this GATT characteristic.
    pub fn disable_notifications(&self) -> Result<Pending<()>> {
        self.set_notify(false)
    }

    fn set_notify(&self, enable: bool) -> Result<Pending<()>> {
        let props = self.0.properties;
        self.require(props.notify || props.indicate, "notify")?;

        let mut ops = self.ops();
        self.check_alive()?;
        if ops.notify.is_some() {
            return Err(Error::with_message(
                ErrorKind::Busy,
                "a notification change is already outstanding",
            ));
        }

        let (resolver, pending) = pending();
        ops.notify = Some((enable, resolver));

        let link = &self.0.link;
        let gateway = link.gateway.clone();
        let path = self.0.path.clone();
        trace!(characteristic = %path, enable, "notify");
        link.dispatcher.complete(
            link.address,
            link.generation,
            async move {
                if enable {
                    gateway.start_notify(&path).await
                } else {
                    gateway.stop_notify(&path).await
                }
            },
            {
                let characteristic = self.0.path.clone();
                move |result| Outcome::Notify {
                    characteristic,
                    enable,
                    result,
                }
            },
        );
        Ok(pending)
    }

    fn send_front_write(&self, ops: &Ops) {
        let Some(front) = ops.writes.front() else {
            return;
        };
        let link = &self.0.link;
        let gateway = link.gateway.clone();
        let path = self.0.path.clone();
        let value = front.value.clone();
        let offset = front.offset;
        trace!(characteristic = %path, len = value.len(), offset, "write");
        link.dispatcher.complete(
            link.address,
            link.generation,
            async move { gateway.write_value(&path, &value, offset).await },
            {
                let characteristic = self.0.path.clone();
                move |result| Outcome::Write { characteristic, result }
            },
        );
    }

    fn require(&self, supported: bool, operation: &str) -> Result<()> {
        if !self.0.link.is_alive() {
            return Err(ErrorKind::NotConnected.into());
        }
        if supported {
            Ok(())
        } else {
            Err(Error::with_message(
                ErrorKind::NotSupported,
                format!("characteristic {} does not support {operation}", self.0.uuid),
            ))
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.0.link.is_alive() {
            Ok(())
        } else {
            Err(ErrorKind::NotConnected.into())
        }
    }

    fn ops(&self) -> MutexGuard<'_, Ops> {
        self.0.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a `Value` change pushed by the device.
    pub(crate) fn value_changed(&self, value: &[u8]) {
        let mut ops = self.ops();
        if ops.read.is_some() {
            ops.pushed_during_read = Some(value.to_vec());
        }
    }

    pub(crate) fn notifying_changed(&self, notifying: bool) {
        self.ops().notifying = notifying;
    }

    /// Completes the outstanding read. Returns `None` if no read was outstanding.
    pub(crate) fn finish_read(&self, result: Result<Vec<u8>, BusError>) -> Option<ReadReport> {
        let mut ops = self.ops();
        let resolver = ops.read.take()?;
        let pushed = ops.pushed_during_read.take();
        drop(ops);

        match result {
            Ok(value) => {
                resolver.resolve(Ok(value.clone()));
                Some(if pushed.as_deref() == Some(value.as_slice()) {
                    ReadReport::AlreadyReported
                } else {
                    ReadReport::Value(value)
                })
            }
            Err(err) => {
                let err = Error::from_bus(BusRequest::Characteristic, err);
                resolver.resolve(Err(err.replicate()));
                Some(ReadReport::Failed(err))
            }
        }
    }

    /// Completes the write in flight and sends the next queued one. Returns `None` if no write was in flight.
    pub(crate) fn finish_write(&self, result: Result<(), BusError>) -> Option<Result<()>> {
        let mut ops = self.ops();
        let write = ops.writes.pop_front()?;
        self.send_front_write(&ops);
        drop(ops);

        let result = result.map_err(|err| Error::from_bus(BusRequest::Characteristic, err));
        write.resolver.resolve(match &result {
            Ok(()) => Ok(()),
            Err(err) => Err(err.replicate()),
        });
        Some(result)
    }

    /// Completes the outstanding notification change. Returns `None` if none was outstanding.
    pub(crate) fn finish_notify(&self, enable: bool, result: Result<(), BusError>) -> Option<Result<()>> {
        let mut ops = self.ops();
        match &ops.notify {
            Some((pending_enable, _)) if *pending_enable == enable => (),
            _ => return None,
        }
        let (_, resolver) = ops.notify.take()?;

        let result = match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_failed_with("Already notifying") || err.is_failed_with("No notify session started") => {
                debug!(characteristic = %self.0.path, "{}", err);
                Ok(())
            }
            Err(err) => Err(Error::from_bus(BusRequest::Characteristic, err)),
        };
        if result.is_ok() {
            ops.notifying = enable;
        }
        drop(ops);

        resolver.resolve(match &result {
            Ok(()) => Ok(()),
            Err(err) => Err(err.replicate()),
        });
        Some(result)
    }

    /// Fails every outstanding operation with `NotConnected`.
    pub(crate) fn invalidate(&self) {
        let mut ops = self.ops();
        ops.read = None;
        ops.writes.clear();
        ops.notify = None;
        ops.notifying = false;
    }
}
