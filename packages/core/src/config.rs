//! Watcher configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ConfigParseSnafu, IoResultExt, Result};

/// Privilege escalation used when running the `umount` binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Escalation {
    /// Run directly.
    #[default]
    None,
    /// Wrap with `sudo` (terminal sessions).
    Sudo,
    /// Wrap with `pkexec` (polkit dialog).
    Pkexec,
}

/// How the physical unmount is performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmountMethod {
    /// Run the `umount` binary.
    #[default]
    Command,
    /// Call `umount2(2)` directly; needs CAP_SYS_ADMIN.
    Syscall,
}

/// Tunables for the watcher loop, unmount and the lsblk source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// How often the blocking loop checks for a stop request.
    pub stop_poll_interval_ms: u64,
    /// Upper bound on waiting for the event source to unmount.
    pub unmount_timeout_ms: u64,
    /// Interval between lsblk scans.
    pub scan_interval_ms: u64,
    /// Root of the sysfs tree used to look up vendor/product codes.
    pub sysfs_root: PathBuf,
    pub escalation: Escalation,
    pub unmount_method: UnmountMethod,
    /// Detach the filesystem lazily (`umount -l` / `MNT_DETACH`).
    pub lazy_unmount: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            stop_poll_interval_ms: 100,
            unmount_timeout_ms: 10_000,
            scan_interval_ms: 1_000,
            sysfs_root: PathBuf::from("/sys"),
            escalation: Escalation::None,
            unmount_method: UnmountMethod::Command,
            lazy_unmount: false,
        }
    }
}

impl WatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).config_read_context(path)?;
        serde_json::from_str(&content).context(ConfigParseSnafu { path })
    }

    pub fn with_unmount_timeout(mut self, timeout: Duration) -> Self {
        self.unmount_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_stop_poll_interval(mut self, interval: Duration) -> Self {
        self.stop_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn with_escalation(mut self, escalation: Escalation) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_unmount_method(mut self, method: UnmountMethod) -> Self {
        self.unmount_method = method;
        self
    }

    pub fn unmount_timeout(&self) -> Duration {
        Duration::from_millis(self.unmount_timeout_ms)
    }

    /// Never zero, so the loop does not spin.
    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms.max(1))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WatcherConfig::default();
        assert_eq!(config.unmount_timeout(), Duration::from_secs(10));
        assert_eq!(config.stop_poll_interval(), Duration::from_millis(100));
        assert_eq!(config.escalation, Escalation::None);
        assert_eq!(config.unmount_method, UnmountMethod::Command);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"unmount_timeout_ms": 2500, "escalation": "pkexec", "unmount_method": "syscall"}}"#
        )
        .unwrap();

        let config = WatcherConfig::from_file(file.path()).unwrap();
        assert_eq!(config.unmount_timeout(), Duration::from_millis(2500));
        assert_eq!(config.escalation, Escalation::Pkexec);
        assert_eq!(config.unmount_method, UnmountMethod::Syscall);
        assert_eq!(config.scan_interval_ms, 1_000);
        assert_eq!(config.sysfs_root, PathBuf::from("/sys"));
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            WatcherConfig::from_file(&missing),
            Err(Error::ConfigRead { .. })
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            WatcherConfig::from_file(&bad),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = WatcherConfig::new().with_stop_poll_interval(Duration::ZERO);
        assert_eq!(config.stop_poll_interval(), Duration::from_millis(1));
    }
}
