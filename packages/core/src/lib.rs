//! usbwatch-core: watcher and registry for removable USB storage.
//!
//! This library turns raw hotplug notifications into an ordered stream of
//! lifecycle events and a queryable device cache, and can unmount devices.
//!
//! # Modules
//!
//! - [`device`]: Device record and its boundary representation
//! - [`registry`]: Concurrent in-memory device cache
//! - [`event`]: Raw notifications and lifecycle events
//! - [`watcher`]: Event watcher loop and per-device state machine
//! - [`subscription`]: Single-slot watcher subscription and dispatcher
//! - [`source`]: Event source trait and the channel-fed source
//! - [`lsblk`]: Linux event source polling `lsblk` and sysfs
//! - [`mount`]: Physical unmount via `umount` or `umount2`
//! - [`service`]: Query, command and watch API
//! - [`config`]: Watcher configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::thread;
//! use usbwatch_core::{ChannelWatcher, LsblkEventSource, UsbService, WatcherConfig};
//!
//! let config = WatcherConfig::default();
//! let source = Arc::new(LsblkEventSource::new(&config));
//! let service = Arc::new(UsbService::new(config, source));
//!
//! let (watcher, events) = ChannelWatcher::new();
//! service.register_watcher(Box::new(watcher));
//!
//! let loop_service = Arc::clone(&service);
//! thread::spawn(move || loop_service.wait_for_events());
//!
//! for event in events {
//!     println!("{} {}", event.name(), event.device().uid);
//!     if event.device().is_mounted() {
//!         service.unmount(&event.device().uid);
//!     }
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod lsblk;
pub mod mount;
pub mod registry;
pub mod service;
pub mod source;
pub mod subscription;
pub mod watcher;

// Re-export commonly used types
pub use config::{Escalation, UnmountMethod, WatcherConfig};
pub use device::{DeviceRecord, DeviceView};
pub use error::{Error, Result};
pub use event::{EventKind, LifecycleEvent, RawEvent};
pub use lsblk::LsblkEventSource;
pub use mount::Unmounter;
pub use registry::DeviceRegistry;
pub use service::UsbService;
pub use source::{ChannelSource, EventSource, SourceFeeder, UnmountBehavior};
pub use subscription::{ChannelWatcher, Watcher, WatcherSubscription};
pub use watcher::StopHandle;
