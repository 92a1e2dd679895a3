//! Raw notifications from an event source and the lifecycle events derived
//! from them.

use std::path::PathBuf;

use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};

use crate::device::{DeviceRecord, DeviceView};

/// Kind of a raw hotplug notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Attach,
    Detach,
    Mount,
    Unmount,
}

/// Device information carried by a raw notification.
///
/// For `Mount` notifications `mount` holds the new mount path; other kinds
/// may leave it empty.
pub type RawDeviceInfo = DeviceRecord;

/// One notification as delivered by an [`EventSource`](crate::source::EventSource).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub device: RawDeviceInfo,
}

impl RawEvent {
    pub fn attach(device: RawDeviceInfo) -> Self {
        Self {
            kind: EventKind::Attach,
            device,
        }
    }

    /// A detach only needs the uid.
    pub fn detach(uid: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Detach,
            device: DeviceRecord::new(uid),
        }
    }

    pub fn mount(uid: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: EventKind::Mount,
            device: DeviceRecord::new(uid).with_mount(path),
        }
    }

    pub fn unmount(uid: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Unmount,
            device: DeviceRecord::new(uid),
        }
    }

    pub fn uid(&self) -> &str {
        &self.device.uid
    }
}

/// A lifecycle transition delivered to the installed watcher.
///
/// The record is the registry's state right after the transition was
/// applied, so `Unmount` and `Detached` always carry `mount: None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Attached(DeviceRecord),
    Detached(DeviceRecord),
    Mount(DeviceRecord),
    Unmount(DeviceRecord),
}

impl LifecycleEvent {
    /// Event name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Attached(_) => "attach",
            LifecycleEvent::Detached(_) => "detach",
            LifecycleEvent::Mount(_) => "mount",
            LifecycleEvent::Unmount(_) => "unmount",
        }
    }

    pub fn device(&self) -> &DeviceRecord {
        match self {
            LifecycleEvent::Attached(d)
            | LifecycleEvent::Detached(d)
            | LifecycleEvent::Mount(d)
            | LifecycleEvent::Unmount(d) => d,
        }
    }
}

impl Serialize for LifecycleEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("LifecycleEvent", 2)?;
        state.serialize_field("event", self.name())?;
        state.serialize_field("device", &DeviceView::from(self.device()))?;
        state.end()
    }
}
