//! Event watcher loop.
//!
//! Translates raw notifications into registry mutations and lifecycle
//! events. Each per-uid device follows
//! `Detached -> Attached -> Mounted -> Attached -> Detached`; notifications
//! that skip a state are repaired by synthesizing the missing transition
//! instead of failing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::device::DeviceRecord;
use crate::event::{EventKind, LifecycleEvent, RawEvent};
use crate::registry::DeviceRegistry;

/// Cooperative stop signal for a running watcher loop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the loop to return after its current wait.
    ///
    /// A stop issued before the loop starts makes the next run return
    /// right away.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Re-arms the handle for another run.
    pub(crate) fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}

/// Applies one raw notification to the registry.
///
/// Returns the lifecycle events to deliver, in order. Most notifications
/// produce exactly one event; repaired anomalies and a detach from the
/// mounted state produce two.
pub fn apply_event(registry: &DeviceRegistry, event: RawEvent) -> Vec<LifecycleEvent> {
    let RawEvent { kind, device } = event;
    let mut emitted = Vec::with_capacity(2);

    match kind {
        EventKind::Attach => {
            let record = match registry.get(&device.uid) {
                Some(existing) => {
                    debug!(uid = %device.uid, "re-attach for known device, refreshing identity");
                    DeviceRecord {
                        mount: existing.mount,
                        ..device
                    }
                }
                None => DeviceRecord {
                    mount: None,
                    ..device
                },
            };
            registry.upsert(record.clone());
            emitted.push(LifecycleEvent::Attached(record));
        }
        EventKind::Mount => {
            let uid = device.uid.clone();
            let path = device.mount.clone();
            ensure_attached(registry, device, &mut emitted);

            if path.as_deref().is_none_or(|p| p.as_os_str().is_empty()) {
                warn!(uid = %uid, "mount notification without a mount path");
            }
            if let Some(record) = registry.set_mount(&uid, path) {
                emitted.push(LifecycleEvent::Mount(record));
            }
        }
        EventKind::Unmount => {
            let uid = device.uid.clone();
            ensure_attached(registry, device, &mut emitted);

            if let Some(record) = registry.clear_mount(&uid) {
                emitted.push(LifecycleEvent::Unmount(record));
            }
        }
        EventKind::Detach => {
            let uid = device.uid.clone();
            ensure_attached(registry, device, &mut emitted);

            if registry.get(&uid).is_some_and(|d| d.is_mounted()) {
                debug!(uid = %uid, "detach while mounted, clearing mount first");
                if let Some(record) = registry.clear_mount(&uid) {
                    emitted.push(LifecycleEvent::Unmount(record));
                }
            }
            if let Some(record) = registry.remove(&uid) {
                emitted.push(LifecycleEvent::Detached(record));
            }
        }
    }

    emitted
}

/// Synthesizes an attach for a uid the registry has never seen.
fn ensure_attached(registry: &DeviceRegistry, device: DeviceRecord, emitted: &mut Vec<LifecycleEvent>) {
    if registry.get(&device.uid).is_some() {
        return;
    }

    warn!(uid = %device.uid, "notification for unknown device, synthesizing attach");
    let record = DeviceRecord {
        mount: None,
        ..device
    };
    registry.upsert(record.clone());
    emitted.push(LifecycleEvent::Attached(record));
}

/// How the watcher loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A stop was requested through the [`StopHandle`].
    Stopped,
    /// The source closed its notification stream.
    StreamClosed,
    /// Nobody is consuming lifecycle events any more.
    SinkClosed,
}

/// Pumps `stream` until it closes or `stop` is requested.
///
/// Every notification is applied to the registry and the resulting events
/// are forwarded to `sink` in arrival order.
pub fn run_loop(
    stream: &Receiver<RawEvent>,
    registry: &DeviceRegistry,
    sink: &Sender<LifecycleEvent>,
    stop: &StopHandle,
    poll_interval: Duration,
) -> LoopExit {
    info!("event watcher loop started");

    let exit = loop {
        if stop.is_stopped() {
            break LoopExit::Stopped;
        }

        let event = match stream.recv_timeout(poll_interval) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break LoopExit::StreamClosed,
        };

        debug!(uid = %event.uid(), kind = ?event.kind, "applying notification");
        let emitted = apply_event(registry, event);
        if emitted.into_iter().any(|e| sink.send(e).is_err()) {
            break LoopExit::SinkClosed;
        }
    };

    info!(?exit, "event watcher loop finished");
    exit
}
