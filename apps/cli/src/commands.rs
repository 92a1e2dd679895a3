//! One-shot commands: list, get and unmount.

use std::sync::Arc;

use serde::Serialize;
use snafu::ResultExt;
use tracing::info;
use usbwatch_core::lsblk::{DiskMap, diff_scans};
use usbwatch_core::watcher::apply_event;
use usbwatch_core::{DeviceView, LsblkEventSource, UsbService, WatcherConfig};

use crate::{CliError, EncodeSnafu};

/// Builds a service whose registry holds the current scan.
fn seeded_service(config: WatcherConfig) -> Result<UsbService, CliError> {
    let source = Arc::new(LsblkEventSource::new(&config));
    let scan = source.scan()?;
    let service = UsbService::new(config, source);

    for event in diff_scans(&DiskMap::new(), &scan) {
        apply_event(service.registry(), event);
    }
    Ok(service)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value).context(EncodeSnafu)?;
    println!("{}", text);
    Ok(())
}

pub fn list(config: WatcherConfig) -> Result<(), CliError> {
    let service = seeded_service(config)?;
    let mut views: Vec<DeviceView> = service.get_devices().iter().map(DeviceView::from).collect();
    views.sort_by(|a, b| a.id.cmp(&b.id));
    print_json(&views)
}

pub fn get(config: WatcherConfig, id: &str) -> Result<(), CliError> {
    let service = seeded_service(config)?;
    let view = service.get_device(id).map(DeviceView::from);
    print_json(&view)?;
    if view.is_none() {
        return Err(CliError::NoSuchDevice { id: id.to_string() });
    }
    Ok(())
}

pub fn unmount(config: WatcherConfig, id: &str) -> Result<(), CliError> {
    let service = seeded_service(config)?;
    let result = service.try_unmount(id);
    print_json(&result.is_ok())?;

    let path = result?;
    info!(id, path = %path.display(), "unmounted");
    Ok(())
}
