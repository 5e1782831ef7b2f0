//! The single-threaded event loop behind a [`DeviceManager`][crate::DeviceManager]
//!
//! Gateway signals, completions of gateway requests and policy timers are all funnelled into one queue. Requests and
//! timers run as spawned tasks whose only effect is to post an [`Event`]; every state transition and every observer
//! callback happens on the task that drains the queue.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_lite::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::bus::{BusEvent, BusEventStream, PropertyValue};
use crate::error::BusError;
use crate::{DeviceManager, MacAddress, ObjectPath};

pub(crate) enum Event {
    Bus(BusEvent),
    BusClosed,
    Completed(Completion),
    Timer(TimerEvent),
    Invoke(Box<dyn FnOnce(&mut DeviceManager) + Send>),
    Stop,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bus(event) => f.debug_tuple("Bus").field(event).finish(),
            Self::BusClosed => write!(f, "BusClosed"),
            Self::Completed(completion) => f.debug_tuple("Completed").field(completion).finish(),
            Self::Timer(timer) => f.debug_tuple("Timer").field(timer).finish(),
            Self::Invoke(_) => write!(f, "Invoke"),
            Self::Stop => write!(f, "Stop"),
        }
    }
}

/// A gateway request finished.
#[derive(Debug)]
pub(crate) struct Completion {
    pub address: MacAddress,
    pub generation: u64,
    pub outcome: Outcome,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Connect(Result<(), BusError>),
    Disconnect(Result<(), BusError>),
    ResolveProbe(Result<PropertyValue, BusError>),
    ConnectedProbe {
        disconnect_error: BusError,
        result: Result<PropertyValue, BusError>,
    },
    Read {
        characteristic: ObjectPath,
        result: Result<Vec<u8>, BusError>,
    },
    Write {
        characteristic: ObjectPath,
        result: Result<(), BusError>,
    },
    Notify {
        characteristic: ObjectPath,
        enable: bool,
        result: Result<(), BusError>,
    },
}

/// A policy timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerEvent {
    pub address: MacAddress,
    pub generation: u64,
    pub kind: TimerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Connect,
    Resolve { attempt: u32 },
}

/// The event queue of a [`DeviceManager`].
#[derive(Debug)]
pub struct EventDispatcher {
    handle: DispatcherHandle,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventDispatcher {
    pub(crate) fn new(runtime: Handle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        EventDispatcher {
            handle: DispatcherHandle {
                sender,
                runtime,
                running: Arc::new(AtomicBool::new(false)),
                stop_requested: Arc::new(AtomicBool::new(false)),
            },
            receiver,
        }
    }

    /// A handle for posting to this dispatcher from any context
    pub fn handle(&self) -> &DispatcherHandle {
        &self.handle
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.handle.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.handle.stop_requested.load(Ordering::SeqCst)
    }

    /// Consumes the outstanding stop request, if any. A queued [`Event::Stop`] without one is stale.
    pub(crate) fn take_stop(&self) -> bool {
        self.handle.stop_requested.swap(false, Ordering::SeqCst)
    }

    /// Waits for the next event. The dispatcher holds a sender itself, so this never returns `None` in practice.
    pub(crate) async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub(crate) fn try_next(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

/// A cloneable handle to an [`EventDispatcher`].
///
/// Use it to stop [`DeviceManager::run`] or to hand work back to the dispatcher from another execution context.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    sender: mpsc::UnboundedSender<Event>,
    runtime: Handle,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
}

impl DispatcherHandle {
    /// Makes [`DeviceManager::run`] return once the events queued before this call are processed.
    ///
    /// If the dispatcher is not running yet, the next call to `run` returns at that point instead. Stopping again
    /// before the request is consumed has no further effect.
    pub fn stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            self.post(Event::Stop);
        }
    }

    /// Whether [`DeviceManager::run`] is currently processing events
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Schedules `f` to run on the dispatcher with exclusive access to the manager.
    ///
    /// This is how results of long-running work done elsewhere are delivered back to the device model.
    pub fn invoke<F>(&self, f: F)
    where
        F: FnOnce(&mut DeviceManager) + Send + 'static,
    {
        self.post(Event::Invoke(Box::new(f)));
    }

    pub(crate) fn post(&self, event: Event) {
        if self.sender.send(event).is_err() {
            trace!("dispatcher is gone, dropping event");
        }
    }

    /// Runs a gateway request in the background and posts its completion.
    pub(crate) fn complete<F, T>(
        &self,
        address: MacAddress,
        generation: u64,
        request: F,
        outcome: impl FnOnce(T) -> Outcome + Send + 'static,
    ) where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.sender.clone();
        self.runtime.spawn(async move {
            let outcome = outcome(request.await);
            let _ = sender.send(Event::Completed(Completion {
                address,
                generation,
                outcome,
            }));
        });
    }

    /// Runs a gateway request whose result nobody waits for.
    pub(crate) fn detach<F>(&self, request: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(request);
    }

    pub(crate) fn schedule(&self, delay: Duration, timer: TimerEvent) {
        let sender = self.sender.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(Event::Timer(timer));
        });
    }

    /// Pumps gateway signals into the queue until the stream ends.
    pub(crate) fn forward(&self, mut events: BusEventStream) -> JoinHandle<()> {
        let sender = self.sender.clone();
        self.runtime.spawn(async move {
            while let Some(event) = events.next().await {
                if sender.send(Event::Bus(event)).is_err() {
                    return;
                }
            }
            debug!("gateway signal stream ended");
            let _ = sender.send(Event::BusClosed);
        })
    }
}
