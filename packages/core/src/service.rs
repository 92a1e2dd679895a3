//! The USB watch service: query, command and watch API.
//!
//! [`UsbService`] owns the registry, the watcher subscription and the event
//! source for one process. `new` is init, `shutdown` (or drop) is teardown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{error, info, warn};

use crate::config::WatcherConfig;
use crate::device::DeviceRecord;
use crate::error::{Error, Result};
use crate::registry::DeviceRegistry;
use crate::source::EventSource;
use crate::subscription::{Watcher, WatcherSubscription};
use crate::watcher::{LoopExit, StopHandle, run_loop};

/// Process-scoped USB watch service.
pub struct UsbService {
    config: WatcherConfig,
    source: Arc<dyn EventSource>,
    registry: DeviceRegistry,
    subscription: WatcherSubscription,
    stop: StopHandle,
    watching: AtomicBool,
}

impl UsbService {
    /// Creates the service and starts its callback dispatcher.
    ///
    /// The event source is not started until [`wait_for_events`](Self::wait_for_events).
    pub fn new(config: WatcherConfig, source: Arc<dyn EventSource>) -> Self {
        Self {
            config,
            source,
            registry: DeviceRegistry::new(),
            subscription: WatcherSubscription::new(),
            stop: StopHandle::new(),
            watching: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Snapshot of every known device.
    pub fn get_devices(&self) -> Vec<DeviceRecord> {
        self.registry.snapshot()
    }

    /// Looks up a device by uid, then by serial number.
    pub fn get_device(&self, id: &str) -> Option<DeviceRecord> {
        self.registry.find(id)
    }

    /// Unmounts the device named by `id`; false on any failure.
    pub fn unmount(&self, id: &str) -> bool {
        match self.try_unmount(id) {
            Ok(_) => true,
            Err(e) => {
                warn!(id, error = %e, "unmount failed");
                false
            }
        }
    }

    /// Unmounts the device named by `id`, returning the path it was mounted at.
    ///
    /// The event source gets at most `unmount_timeout` to answer. On success
    /// the registry's mount is cleared before returning; the source's own
    /// unmount notification later arrives through the watcher loop.
    pub fn try_unmount(&self, id: &str) -> Result<PathBuf> {
        let device = self
            .registry
            .find(id)
            .ok_or_else(|| Error::DeviceNotFound { id: id.to_string() })?;
        let path = device
            .mount_path()
            .map(PathBuf::from)
            .ok_or_else(|| Error::NotMounted {
                uid: device.uid.clone(),
            })?;

        let timeout = self.config.unmount_timeout();
        self.unmount_with_deadline(&path, timeout)?;

        // Only clear if the mount was not replaced while we waited
        if self
            .registry
            .get(&device.uid)
            .is_some_and(|d| d.mount_path() == Some(path.as_path()))
        {
            self.registry.clear_mount(&device.uid);
        }
        info!(uid = %device.uid, path = %path.display(), "device unmounted");
        Ok(path)
    }

    /// Runs `perform_unmount` on a worker thread and waits up to `timeout`.
    fn unmount_with_deadline(&self, path: &Path, timeout: Duration) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let source = Arc::clone(&self.source);
        let worker_path = path.to_path_buf();

        thread::Builder::new()
            .name("usbwatch-unmount".to_string())
            .spawn(move || {
                let result = source.perform_unmount(&worker_path);
                // Nobody is waiting any more after a timeout
                let _ = tx.send(result);
            })
            .map_err(|e| Error::Unmount {
                path: path.to_path_buf(),
                message: format!("failed to spawn unmount worker: {}", e),
            })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::UnmountTimeout {
                path: path.to_path_buf(),
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Unmount {
                path: path.to_path_buf(),
                message: "unmount worker exited without a result".to_string(),
            }),
        }
    }

    /// Installs the sole lifecycle watcher, returning the one it replaces.
    pub fn register_watcher(&self, watcher: Box<dyn Watcher>) -> Option<Box<dyn Watcher>> {
        self.subscription.register(watcher)
    }

    /// Removes the installed watcher.
    pub fn unregister_watcher(&self) -> Option<Box<dyn Watcher>> {
        self.subscription.unregister()
    }

    /// Handle that makes a running [`wait_for_events`](Self::wait_for_events) return.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    /// Runs the event watcher loop on the calling thread.
    ///
    /// Blocks until a stop is requested, the source closes its stream, or
    /// the process exits. Fails only if the source cannot be started or the
    /// loop is already running.
    pub fn wait_for_events(&self) -> Result<()> {
        if self.watching.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyWatching);
        }
        let _watching = WatchingGuard(&self.watching);

        let Some(sink) = self.subscription.sender() else {
            return Err(Error::Generic {
                message: "watcher subscription is shut down".to_string(),
                source: None,
            });
        };
        let stream = self.source.start().inspect_err(|e| {
            error!(source = self.source.name(), error = %e, "failed to start event source");
        })?;

        info!(source = self.source.name(), "watching for USB events");
        let exit = run_loop(
            &stream,
            &self.registry,
            &sink,
            &self.stop,
            self.config.stop_poll_interval(),
        );
        // The stop that ended this run is consumed here, never on entry
        self.stop.reset();
        drop(stream);
        self.source.stop();

        if exit == LoopExit::SinkClosed {
            warn!("lifecycle dispatcher went away, stopped watching");
        }
        Ok(())
    }

    /// Stops the loop, drains pending callbacks and releases the watcher.
    ///
    /// Works through a shared handle. Later calls to
    /// [`wait_for_events`](Self::wait_for_events) fail.
    pub fn shutdown(&self) {
        self.stop.stop();
        self.subscription.shutdown();
    }
}

/// Clears the watching flag however the loop exits.
struct WatchingGuard<'a>(&'a AtomicBool);

impl Drop for WatchingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceView;
    use crate::event::{LifecycleEvent, RawEvent};
    use crate::source::{ChannelSource, SourceFeeder, UnmountBehavior};
    use crate::subscription::ChannelWatcher;
    use crossbeam_channel::Receiver;
    use std::sync::Weak;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        service: Arc<UsbService>,
        source: Arc<ChannelSource>,
        feeder: SourceFeeder,
        events: Receiver<LifecycleEvent>,
        loop_thread: Option<thread::JoinHandle<Result<()>>>,
    }

    impl Harness {
        fn start(config: WatcherConfig) -> Self {
            let (source, feeder) = ChannelSource::new();
            let source = Arc::new(source);
            let service = Arc::new(UsbService::new(
                config.with_stop_poll_interval(Duration::from_millis(10)),
                Arc::clone(&source) as Arc<dyn EventSource>,
            ));

            let (watcher, events) = ChannelWatcher::new();
            service.register_watcher(Box::new(watcher));

            let loop_thread = {
                let service = Arc::clone(&service);
                thread::spawn(move || service.wait_for_events())
            };

            Self {
                service,
                source,
                feeder,
                events,
                loop_thread: Some(loop_thread),
            }
        }

        /// Pushes a notification and waits for `expected` callbacks.
        fn push(&self, event: RawEvent, expected: usize) -> Vec<LifecycleEvent> {
            assert!(self.feeder.push(event));
            (0..expected)
                .map(|_| self.events.recv_timeout(WAIT).unwrap())
                .collect()
        }

        fn stop(&mut self) -> Result<()> {
            self.service.stop_handle().stop();
            self.loop_thread.take().unwrap().join().unwrap()
        }
    }

    #[test]
    fn test_scenario_attach_mount_unmount_detach() {
        let mut h = Harness::start(WatcherConfig::default());

        h.push(
            RawEvent::attach(DeviceRecord::new("d1").with_codes("0x1", "0x2")),
            1,
        );
        h.push(RawEvent::mount("d1", "/media/d1"), 1);

        let view = DeviceView::from(h.service.get_device("d1").unwrap());
        assert_eq!(
            view,
            DeviceView {
                id: Some("d1".to_string()),
                product_code: Some("0x2".to_string()),
                vendor_code: Some("0x1".to_string()),
                product: None,
                serial_number: None,
                manufacturer: None,
                mount: Some("/media/d1".to_string()),
            }
        );

        assert!(h.service.unmount("d1"));
        assert_eq!(h.source.unmount_requests(), vec![PathBuf::from("/media/d1")]);
        assert_eq!(DeviceView::from(h.service.get_device("d1").unwrap()).mount, None);

        h.push(RawEvent::detach("d1"), 1);
        assert!(h.service.get_device("d1").is_none());
        assert!(h.service.get_devices().is_empty());

        h.stop().unwrap();
    }

    #[test]
    fn test_callbacks_follow_notification_order() {
        let mut h = Harness::start(WatcherConfig::default());

        for event in [
            RawEvent::attach(DeviceRecord::new("A")),
            RawEvent::mount("A", "/media/a"),
            RawEvent::unmount("A"),
            RawEvent::detach("A"),
            RawEvent::attach(DeviceRecord::new("B")),
        ] {
            assert!(h.feeder.push(event));
        }

        let delivered: Vec<_> = (0..5)
            .map(|_| {
                let event = h.events.recv_timeout(WAIT).unwrap();
                format!("{}:{}", event.name(), event.device().uid)
            })
            .collect();
        assert_eq!(
            delivered,
            ["attach:A", "mount:A", "unmount:A", "detach:A", "attach:B"]
        );

        h.stop().unwrap();
    }

    #[test]
    fn test_second_unmount_returns_false() {
        let mut h = Harness::start(WatcherConfig::default());
        h.push(RawEvent::attach(DeviceRecord::new("X")), 1);
        h.push(RawEvent::mount("X", "/media/x"), 1);

        assert!(h.service.unmount("X"));
        assert!(!h.service.unmount("X"));
        assert!(matches!(
            h.service.try_unmount("X"),
            Err(Error::NotMounted { .. })
        ));
        assert!(matches!(
            h.service.try_unmount("nope"),
            Err(Error::DeviceNotFound { .. })
        ));
        assert_eq!(h.source.unmount_requests().len(), 1);

        h.stop().unwrap();
    }

    #[test]
    fn test_failed_unmount_keeps_mount() {
        let mut h = Harness::start(WatcherConfig::default());
        h.push(RawEvent::mount("X", "/media/x"), 2);

        h.source.set_unmount_behavior(UnmountBehavior::Fail);
        assert!(!h.service.unmount("X"));
        assert!(h.service.get_device("X").unwrap().is_mounted());

        h.stop().unwrap();
    }

    #[test]
    fn test_unmount_times_out() {
        let mut h = Harness::start(
            WatcherConfig::default().with_unmount_timeout(Duration::from_millis(50)),
        );
        h.push(RawEvent::mount("X", "/media/x"), 2);
        h.source
            .set_unmount_behavior(UnmountBehavior::Hang(Duration::from_millis(500)));

        let started = Instant::now();
        assert!(matches!(
            h.service.try_unmount("X"),
            Err(Error::UnmountTimeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_millis(450));
        assert!(h.service.get_device("X").unwrap().is_mounted());

        h.stop().unwrap();
    }

    #[test]
    fn test_get_device_by_serial() {
        let mut h = Harness::start(WatcherConfig::default());
        h.push(
            RawEvent::attach(DeviceRecord::new("sdb").with_serial("4C530001")),
            1,
        );

        assert_eq!(h.service.get_device("4C530001").unwrap().uid, "sdb");
        assert!(h.service.get_device("unknown").is_none());

        h.stop().unwrap();
    }

    #[test]
    fn test_wait_for_events_rejects_second_caller() {
        let mut h = Harness::start(WatcherConfig::default());
        // The loop is running once an event round-trips
        h.push(RawEvent::attach(DeviceRecord::new("d1")), 1);

        assert!(h.service.is_watching());
        assert!(matches!(
            h.service.wait_for_events(),
            Err(Error::AlreadyWatching)
        ));

        h.stop().unwrap();
        assert!(!h.service.is_watching());
    }

    #[test]
    fn test_source_start_failure_is_fatal() {
        let (source, _feeder) = ChannelSource::new();
        let source = Arc::new(source);
        // Consume the only stream so the service cannot start it
        let _stream = source.start().unwrap();
        let service = UsbService::new(WatcherConfig::default(), source);

        assert!(matches!(
            service.wait_for_events(),
            Err(Error::SourceUnavailable { .. })
        ));
        assert!(!service.is_watching());
    }

    #[test]
    fn test_stream_close_ends_wait() {
        let (source, feeder) = ChannelSource::new();
        let service = UsbService::new(WatcherConfig::default(), Arc::new(source));
        drop(feeder);

        assert!(service.wait_for_events().is_ok());
    }

    #[test]
    fn test_queries_stay_responsive_while_watching() {
        let mut h = Harness::start(WatcherConfig::default());
        for i in 0..50 {
            h.push(RawEvent::attach(DeviceRecord::new(format!("d{i}"))), 1);
            assert!(h.service.get_device(&format!("d{i}")).is_some());
        }
        assert_eq!(h.service.get_devices().len(), 50);

        h.stop().unwrap();
    }

    #[test]
    fn test_stop_before_wait_is_honored() {
        let (source, feeder) = ChannelSource::new();
        let service = Arc::new(UsbService::new(
            WatcherConfig::default().with_stop_poll_interval(Duration::from_millis(10)),
            Arc::new(source),
        ));
        service.stop_handle().stop();

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                let _ = done_tx.send(service.wait_for_events());
            });
        }

        // Stream is still open, only the earlier stop can end the loop
        assert!(done_rx.recv_timeout(WAIT).unwrap().is_ok());
        assert!(!service.stop_handle().is_stopped());
        drop(feeder);
    }

    /// Installs `next` from inside its first callback.
    struct Reregistering {
        service: Weak<UsbService>,
        next: Option<ChannelWatcher>,
    }

    impl Watcher for Reregistering {
        fn attached(&mut self, _device: &DeviceRecord) {
            if let (Some(service), Some(next)) = (self.service.upgrade(), self.next.take()) {
                service.register_watcher(Box::new(next));
            }
        }
        fn detached(&mut self, _device: &DeviceRecord) {}
        fn mount(&mut self, _device: &DeviceRecord) {}
        fn unmount(&mut self, _device: &DeviceRecord) {}
    }

    #[test]
    fn test_register_watcher_from_inside_callback() {
        let mut h = Harness::start(WatcherConfig::default());
        let (next, next_events) = ChannelWatcher::new();
        h.service.register_watcher(Box::new(Reregistering {
            service: Arc::downgrade(&h.service),
            next: Some(next),
        }));

        assert!(h.feeder.push(RawEvent::attach(DeviceRecord::new("d1"))));
        assert!(h.feeder.push(RawEvent::mount("d1", "/media/d1")));

        let event = next_events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.name(), "mount");
        assert_eq!(event.device().uid, "d1");

        h.stop().unwrap();
    }

    #[test]
    fn test_shutdown_through_shared_handle() {
        let mut h = Harness::start(WatcherConfig::default());
        h.push(RawEvent::attach(DeviceRecord::new("d1")), 1);

        h.service.shutdown();
        assert!(h.loop_thread.take().unwrap().join().unwrap().is_ok());
        // Watcher released, so its channel disconnects
        assert!(h.events.recv_timeout(WAIT).is_err());
        assert!(matches!(
            h.service.wait_for_events(),
            Err(Error::Generic { .. })
        ));
    }
}
