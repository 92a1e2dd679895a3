//! Watcher subscription: the single slot holding the external recipient of
//! lifecycle callbacks.
//!
//! The watcher loop never calls the subscriber directly. It enqueues events
//! on an ordered channel, and one dispatcher thread drains that channel and
//! invokes whichever watcher is installed at the time. The dispatcher takes
//! the watcher out of the slot for the duration of a callback, so a callback
//! may itself register or unregister watchers. A watcher replaced while it
//! is running is released by the dispatcher once its callback returns.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::device::DeviceRecord;
use crate::event::LifecycleEvent;

/// Recipient of lifecycle callbacks.
pub trait Watcher: Send {
    fn attached(&mut self, device: &DeviceRecord);
    fn detached(&mut self, device: &DeviceRecord);
    fn mount(&mut self, device: &DeviceRecord);
    fn unmount(&mut self, device: &DeviceRecord);
}

/// Routes an event to the matching callback.
pub fn deliver(watcher: &mut dyn Watcher, event: &LifecycleEvent) {
    match event {
        LifecycleEvent::Attached(d) => watcher.attached(d),
        LifecycleEvent::Detached(d) => watcher.detached(d),
        LifecycleEvent::Mount(d) => watcher.mount(d),
        LifecycleEvent::Unmount(d) => watcher.unmount(d),
    }
}

#[derive(Default)]
struct SlotState {
    watcher: Option<Box<dyn Watcher>>,
    /// The dispatcher holds the installed watcher outside the slot.
    in_flight: bool,
    /// The in-flight watcher was replaced or unregistered meanwhile.
    superseded: bool,
}

impl SlotState {
    /// Installs `watcher`, or clears the slot when `None`.
    fn swap(&mut self, watcher: Option<Box<dyn Watcher>>) -> Option<Box<dyn Watcher>> {
        if self.in_flight {
            self.superseded = true;
        }
        std::mem::replace(&mut self.watcher, watcher)
    }
}

type Slot = Arc<Mutex<SlotState>>;

/// Owner of the installed watcher and of the dispatcher thread.
pub struct WatcherSubscription {
    slot: Slot,
    sender: Mutex<Option<Sender<LifecycleEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherSubscription {
    /// Creates an empty subscription and starts its dispatcher thread.
    pub fn new() -> Self {
        let slot: Slot = Arc::new(Mutex::new(SlotState::default()));
        let (sender, receiver) = crossbeam_channel::unbounded();

        let dispatcher = {
            let slot = Arc::clone(&slot);
            thread::Builder::new()
                .name("usbwatch-dispatch".to_string())
                .spawn(move || dispatch(receiver, slot))
                .ok()
        };
        if dispatcher.is_none() {
            tracing::error!("failed to spawn dispatcher thread, lifecycle events will be dropped");
        }

        Self {
            slot,
            sender: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(dispatcher),
        }
    }

    /// Sender used by the watcher loop to enqueue events.
    pub fn sender(&self) -> Option<Sender<LifecycleEvent>> {
        self.sender.lock().clone()
    }

    /// Installs `watcher`, returning the one it replaces.
    ///
    /// If the replaced watcher is in the middle of a callback, the
    /// dispatcher releases it afterwards and `None` is returned.
    pub fn register(&self, watcher: Box<dyn Watcher>) -> Option<Box<dyn Watcher>> {
        let previous = self.slot.lock().swap(Some(watcher));
        if previous.is_some() {
            info!("replaced the installed watcher");
        } else {
            info!("watcher registered");
        }
        previous
    }

    /// Removes and returns the installed watcher.
    pub fn unregister(&self) -> Option<Box<dyn Watcher>> {
        self.slot.lock().swap(None)
    }

    pub fn has_watcher(&self) -> bool {
        let state = self.slot.lock();
        state.watcher.is_some() || (state.in_flight && !state.superseded)
    }

    /// Drains queued events, stops the dispatcher and releases the watcher.
    ///
    /// Any sender clones still held elsewhere must be dropped for the drain
    /// to finish.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if handle.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
        }
        let released = self.slot.lock().watcher.take();
        drop(released);
    }
}

impl Default for WatcherSubscription {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WatcherSubscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(receiver: Receiver<LifecycleEvent>, slot: Slot) {
    for event in receiver.iter() {
        let taken = {
            let mut state = slot.lock();
            let watcher = state.watcher.take();
            state.in_flight = watcher.is_some();
            state.superseded = false;
            watcher
        };

        let Some(mut watcher) = taken else {
            debug!(event = event.name(), uid = %event.device().uid, "no watcher installed, dropping event");
            continue;
        };
        deliver(watcher.as_mut(), &event);

        let released = {
            let mut state = slot.lock();
            state.in_flight = false;
            if state.superseded {
                Some(watcher)
            } else {
                state.watcher = Some(watcher);
                None
            }
        };
        // Dropped outside the lock
        drop(released);
    }
    debug!("dispatcher drained");
}

/// Watcher that forwards every event into a channel.
///
/// Lets a consumer receive callbacks on its own thread, e.g. a
/// single-threaded host runtime polling for events.
pub struct ChannelWatcher {
    sender: Sender<LifecycleEvent>,
}

impl ChannelWatcher {
    /// Creates the watcher and the receiver its events arrive on.
    pub fn new() -> (Self, Receiver<LifecycleEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }

    fn forward(&self, event: LifecycleEvent) {
        if self.sender.send(event).is_err() {
            debug!("channel watcher receiver dropped");
        }
    }
}

impl Watcher for ChannelWatcher {
    fn attached(&mut self, device: &DeviceRecord) {
        self.forward(LifecycleEvent::Attached(device.clone()));
    }

    fn detached(&mut self, device: &DeviceRecord) {
        self.forward(LifecycleEvent::Detached(device.clone()));
    }

    fn mount(&mut self, device: &DeviceRecord) {
        self.forward(LifecycleEvent::Mount(device.clone()));
    }

    fn unmount(&mut self, device: &DeviceRecord) {
        self.forward(LifecycleEvent::Unmount(device.clone()));
    }
}
