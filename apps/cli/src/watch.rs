//! Watch mode: prints lifecycle events as JSON lines.

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use nix::sys::signal::{SigSet, Signal};
use snafu::ResultExt;
use tracing::{error, info};
use usbwatch_core::{DeviceRecord, LifecycleEvent, LsblkEventSource, UsbService, Watcher, WatcherConfig};

use crate::{CliError, SignalSnafu, SpawnSnafu};

/// Writes each event to stdout as one JSON object per line.
struct JsonLinesWatcher;

impl JsonLinesWatcher {
    fn emit(&self, event: LifecycleEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to encode event");
                return;
            }
        };
        let mut stdout = io::stdout().lock();
        if writeln!(stdout, "{}", line).and_then(|_| stdout.flush()).is_err() {
            error!("failed to write event to stdout");
        }
    }
}

impl Watcher for JsonLinesWatcher {
    fn attached(&mut self, device: &DeviceRecord) {
        self.emit(LifecycleEvent::Attached(device.clone()));
    }

    fn detached(&mut self, device: &DeviceRecord) {
        self.emit(LifecycleEvent::Detached(device.clone()));
    }

    fn mount(&mut self, device: &DeviceRecord) {
        self.emit(LifecycleEvent::Mount(device.clone()));
    }

    fn unmount(&mut self, device: &DeviceRecord) {
        self.emit(LifecycleEvent::Unmount(device.clone()));
    }
}

pub fn run(config: WatcherConfig) -> Result<(), CliError> {
    // Block before any thread exists so every thread inherits the mask.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().context(SignalSnafu)?;

    let source = Arc::new(LsblkEventSource::new(&config));
    let service = UsbService::new(config, source);
    service.register_watcher(Box::new(JsonLinesWatcher));

    let stop = service.stop_handle();
    thread::Builder::new()
        .name("usbwatch-signals".to_string())
        .spawn(move || match signals.wait() {
            Ok(signal) => {
                info!(?signal, "stopping");
                stop.stop();
            }
            Err(e) => error!(error = %e, "waiting for signals failed"),
        })
        .context(SpawnSnafu)?;

    let result = service.wait_for_events();
    service.shutdown();
    result.map_err(CliError::from)
}
