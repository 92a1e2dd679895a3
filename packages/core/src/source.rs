//! OS event source abstraction.
//!
//! An [`EventSource`] is the collaborator that produces raw hotplug
//! notifications and performs physical unmounts. The watcher loop owns the
//! receiving end of the stream; dropping it tells the source to stop.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::event::RawEvent;

/// Producer of raw hotplug notifications.
pub trait EventSource: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Starts the notification stream.
    ///
    /// Failing here is the only fatal condition for the watcher loop. The
    /// stream ends when the sender side is dropped.
    fn start(&self) -> Result<Receiver<RawEvent>>;

    /// Called once the watcher loop has returned.
    fn stop(&self) {}

    /// Unmounts the filesystem at `mount_path`.
    ///
    /// May block; callers bound the wait themselves.
    fn perform_unmount(&self, mount_path: &Path) -> Result<()>;
}

/// Scripted outcome for [`ChannelSource::perform_unmount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmountBehavior {
    #[default]
    Succeed,
    Fail,
    /// Block for the given duration, then succeed.
    Hang(Duration),
}

/// Event source fed by the embedding application.
///
/// Useful when notifications come from a mechanism outside this crate, and
/// as the test double for the OS collaborator.
pub struct ChannelSource {
    receiver: Mutex<Option<Receiver<RawEvent>>>,
    unmount_behavior: Mutex<UnmountBehavior>,
    unmount_requests: Mutex<Vec<PathBuf>>,
}

/// Handle for pushing notifications into a [`ChannelSource`].
#[derive(Clone)]
pub struct SourceFeeder {
    sender: Sender<RawEvent>,
}

impl SourceFeeder {
    /// Queues a notification. Returns false once the stream is closed.
    pub fn push(&self, event: RawEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

impl ChannelSource {
    /// Creates the source and the feeder for its stream.
    ///
    /// The stream closes once every clone of the feeder is dropped.
    pub fn new() -> (Self, SourceFeeder) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let source = Self {
            receiver: Mutex::new(Some(receiver)),
            unmount_behavior: Mutex::new(UnmountBehavior::default()),
            unmount_requests: Mutex::new(Vec::new()),
        };
        (source, SourceFeeder { sender })
    }

    pub fn set_unmount_behavior(&self, behavior: UnmountBehavior) {
        *self.unmount_behavior.lock() = behavior;
    }

    /// Mount paths passed to `perform_unmount`, in call order.
    pub fn unmount_requests(&self) -> Vec<PathBuf> {
        self.unmount_requests.lock().clone()
    }
}

impl EventSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    fn start(&self) -> Result<Receiver<RawEvent>> {
        self.receiver
            .lock()
            .take()
            .ok_or_else(|| Error::SourceUnavailable {
                source_name: self.name().to_string(),
                message: "notification stream was already started".to_string(),
            })
    }

    fn perform_unmount(&self, mount_path: &Path) -> Result<()> {
        self.unmount_requests.lock().push(mount_path.to_path_buf());

        let behavior = *self.unmount_behavior.lock();
        match behavior {
            UnmountBehavior::Succeed => Ok(()),
            UnmountBehavior::Fail => Err(Error::Unmount {
                path: mount_path.to_path_buf(),
                message: "target is busy".to_string(),
            }),
            UnmountBehavior::Hang(duration) => {
                thread::sleep(duration);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_source_starts_once() {
        let (source, feeder) = ChannelSource::new();
        let stream = source.start().unwrap();

        assert!(feeder.push(RawEvent::detach("sdb")));
        assert_eq!(stream.recv().unwrap(), RawEvent::detach("sdb"));

        drop(feeder);
        assert!(stream.recv().is_err());
        assert!(matches!(
            source.start(),
            Err(Error::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn test_scripted_unmount() {
        let (source, _feeder) = ChannelSource::new();
        assert!(source.perform_unmount(Path::new("/media/a")).is_ok());

        source.set_unmount_behavior(UnmountBehavior::Fail);
        assert!(source.perform_unmount(Path::new("/media/b")).is_err());

        assert_eq!(
            source.unmount_requests(),
            vec![PathBuf::from("/media/a"), PathBuf::from("/media/b")]
        );
    }
}
