//! In-memory device registry.
//!
//! The registry is the single source of truth for device queries. The
//! watcher loop is its only regular writer; queries clone records out under
//! the read lock, so a snapshot never observes a half-applied mutation.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;

use crate::device::DeviceRecord;

/// Cache of device records keyed by uid.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record for `record.uid`.
    ///
    /// Returns the record previously stored under the same uid.
    pub fn upsert(&self, record: DeviceRecord) -> Option<DeviceRecord> {
        self.devices.write().insert(record.uid.clone(), record)
    }

    /// Deletes the record for `uid`, returning it if present.
    pub fn remove(&self, uid: &str) -> Option<DeviceRecord> {
        self.devices.write().remove(uid)
    }

    /// Point-in-time lookup by uid.
    pub fn get(&self, uid: &str) -> Option<DeviceRecord> {
        self.devices.read().get(uid).cloned()
    }

    /// Looks up a device by uid, falling back to its serial number.
    ///
    /// When several devices share the serial, the lowest uid wins.
    pub fn find(&self, id: &str) -> Option<DeviceRecord> {
        let devices = self.devices.read();
        if let Some(record) = devices.get(id) {
            return Some(record.clone());
        }
        devices
            .values()
            .filter(|d| d.matches(id))
            .min_by(|a, b| a.uid.cmp(&b.uid))
            .cloned()
    }

    /// Returns a copy of every known record. Order is unspecified.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.devices.read().values().cloned().collect()
    }

    /// Sets the mount path of a known device and returns the updated record.
    pub fn set_mount(&self, uid: &str, mount: Option<PathBuf>) -> Option<DeviceRecord> {
        let mut devices = self.devices.write();
        let record = devices.get_mut(uid)?;
        record.mount = mount.filter(|p| !p.as_os_str().is_empty());
        Some(record.clone())
    }

    /// Clears the mount path of a known device and returns the updated record.
    pub fn clear_mount(&self, uid: &str) -> Option<DeviceRecord> {
        self.set_mount(uid, None)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}
