//! Linux event source built on `lsblk` polling.
//!
//! Each scan lists USB-attached disks with their partitions and mount
//! points. Consecutive scans are diffed into raw attach/detach/mount/unmount
//! notifications. Vendor and product codes are read from sysfs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::WatcherConfig;
use crate::device::DeviceRecord;
use crate::error::{Error, Result};
use crate::event::RawEvent;
use crate::mount::Unmounter;
use crate::source::EventSource;

/// Known USB disks keyed by kernel name.
pub type DiskMap = BTreeMap<String, DeviceRecord>;

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Option<Vec<LsblkDevice>>,
}

/// Runs lsblk and returns the USB disks currently present.
pub fn scan_usb_disks(sysfs_root: &Path) -> Result<DiskMap> {
    use crate::error::IoResultExt;

    let output = Command::new("lsblk")
        .args([
            "--json",
            "--bytes",
            "--output",
            "NAME,TYPE,TRAN,VENDOR,MODEL,SERIAL,MOUNTPOINT",
        ])
        .output()
        .command_context("lsblk")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(Error::CommandExit {
            command: "lsblk".to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    parse_usb_disks(&String::from_utf8_lossy(&output.stdout), sysfs_root)
}

/// Parses lsblk JSON into USB disk records.
pub fn parse_usb_disks(json: &str, sysfs_root: &Path) -> Result<DiskMap> {
    let lsblk_output: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;

    let mut disks = DiskMap::new();
    for dev in &lsblk_output.blockdevices {
        let is_usb_disk = dev.device_type.as_deref() == Some("disk")
            && dev.tran.as_deref() == Some("usb");
        if !is_usb_disk {
            continue;
        }

        let (vendor_id, product_id) = usb_codes(sysfs_root, &dev.name).unwrap_or_default();
        let record = DeviceRecord {
            uid: dev.name.clone(),
            vendor_id,
            product_id,
            vendor_str: Some(trimmed(dev.vendor.as_deref())),
            product_str: Some(trimmed(dev.model.as_deref())),
            serial_str: Some(trimmed(dev.serial.as_deref())),
            mount: first_mountpoint(dev).map(PathBuf::from),
        };
        disks.insert(record.uid.clone(), record);
    }

    Ok(disks)
}

/// lsblk pads vendor/model columns with spaces.
fn trimmed(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

/// First mount point on the disk itself or any of its partitions.
fn first_mountpoint(dev: &LsblkDevice) -> Option<String> {
    if let Some(mountpoint) = dev.mountpoint.as_ref().filter(|m| !m.is_empty()) {
        return Some(mountpoint.clone());
    }
    dev.children
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find_map(first_mountpoint)
}

/// Looks up USB vendor/product codes for a block device.
///
/// `/sys/block/<name>` links into the device tree; the nearest ancestor
/// carrying `idVendor` is the USB device itself.
pub fn usb_codes(sysfs_root: &Path, name: &str) -> Option<(String, String)> {
    let device_dir = fs::canonicalize(sysfs_root.join("block").join(name)).ok()?;
    let root = fs::canonicalize(sysfs_root).ok()?;

    device_dir
        .ancestors()
        .take_while(|dir| dir.starts_with(&root))
        .find_map(|dir| {
            let vendor = fs::read_to_string(dir.join("idVendor")).ok()?;
            let product = fs::read_to_string(dir.join("idProduct")).ok()?;
            Some((
                format!("0x{}", vendor.trim()),
                format!("0x{}", product.trim()),
            ))
        })
}

/// Turns the difference between two scans into raw notifications.
///
/// Detaches come first, then per-device changes in uid order.
pub fn diff_scans(previous: &DiskMap, current: &DiskMap) -> Vec<RawEvent> {
    let mut events = Vec::new();

    for uid in previous.keys().filter(|uid| !current.contains_key(*uid)) {
        events.push(RawEvent::detach(uid.clone()));
    }

    for (uid, disk) in current {
        let old_mount = previous.get(uid).map(|d| d.mount.clone());
        match old_mount {
            None => {
                events.push(RawEvent::attach(disk.clone()));
                if let Some(mount) = &disk.mount {
                    events.push(RawEvent::mount(uid.clone(), mount.clone()));
                }
            }
            Some(old) if old != disk.mount => {
                if old.is_some() {
                    events.push(RawEvent::unmount(uid.clone()));
                }
                if let Some(mount) = &disk.mount {
                    events.push(RawEvent::mount(uid.clone(), mount.clone()));
                }
            }
            Some(_) => {}
        }
    }

    events
}

/// Polling event source backed by lsblk and sysfs.
pub struct LsblkEventSource {
    scan_interval: Duration,
    sysfs_root: PathBuf,
    unmounter: Unmounter,
    /// Run flag of the current scanner thread.
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl LsblkEventSource {
    pub fn new(config: &WatcherConfig) -> Self {
        Self {
            scan_interval: config.scan_interval(),
            sysfs_root: config.sysfs_root.clone(),
            unmounter: Unmounter::from_config(config),
            running: Mutex::new(None),
        }
    }

    /// One-shot listing of the USB disks present right now.
    pub fn scan(&self) -> Result<DiskMap> {
        scan_usb_disks(&self.sysfs_root)
    }
}

impl EventSource for LsblkEventSource {
    fn name(&self) -> &str {
        "lsblk"
    }

    fn start(&self) -> Result<Receiver<RawEvent>> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(Error::SourceUnavailable {
                source_name: self.name().to_string(),
                message: "scanner is already running".to_string(),
            });
        }

        let initial = self.scan().map_err(|e| Error::SourceUnavailable {
            source_name: self.name().to_string(),
            message: e.to_string(),
        })?;

        let (sender, receiver) = crossbeam_channel::unbounded();
        for event in diff_scans(&DiskMap::new(), &initial) {
            // Receiver is still in scope, cannot fail
            let _ = sender.send(event);
        }

        let flag = Arc::new(AtomicBool::new(true));
        let sysfs_root = self.sysfs_root.clone();
        let scanner = Scanner {
            scan: move || scan_usb_disks(&sysfs_root),
            sender,
            known: initial,
            interval: self.scan_interval,
            running: Arc::clone(&flag),
        };
        thread::Builder::new()
            .name("usbwatch-lsblk".to_string())
            .spawn(move || scanner.run())
            .map_err(|e| Error::SourceUnavailable {
                source_name: self.name().to_string(),
                message: format!("failed to spawn scanner thread: {}", e),
            })?;
        *running = Some(flag);

        info!(interval = ?self.scan_interval, "lsblk scanner started");
        Ok(receiver)
    }

    fn stop(&self) {
        if let Some(flag) = self.running.lock().take() {
            flag.store(false, Ordering::SeqCst);
        }
    }

    fn perform_unmount(&self, mount_path: &Path) -> Result<()> {
        self.unmounter.unmount(mount_path)
    }
}

/// Background loop diffing successive scans into notifications.
struct Scanner<F> {
    scan: F,
    sender: Sender<RawEvent>,
    known: DiskMap,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl<F> Scanner<F>
where
    F: FnMut() -> Result<DiskMap>,
{
    fn run(mut self) {
        while self.running.load(Ordering::SeqCst) {
            thread::sleep(self.interval);

            let current = match (self.scan)() {
                Ok(disks) => disks,
                Err(e) => {
                    warn!(error = %e, "lsblk scan failed, keeping previous state");
                    continue;
                }
            };

            for event in diff_scans(&self.known, &current) {
                debug!(uid = %event.uid(), kind = ?event.kind, "scan change");
                if self.sender.send(event).is_err() {
                    info!("notification stream closed, stopping lsblk scanner");
                    return;
                }
            }
            self.known = current;
        }
        info!("lsblk scanner stopped");
    }
}
