//! Unified error types for the usbwatch-core library.
//!
//! Uses SNAFU so the same underlying error type (`std::io::Error`,
//! `serde_json::Error`) can carry the context it was raised in.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The OS event source could not start its notification stream.
    #[snafu(display("event source '{source_name}' is unavailable: {message}"))]
    SourceUnavailable {
        source_name: String,
        message: String,
    },

    /// Failed to execute a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Failed to parse lsblk JSON output.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// Configuration file cannot be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for the expected schema.
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Unmount command failed.
    #[snafu(display("failed to unmount {}: {message}", path.display()))]
    Unmount { path: PathBuf, message: String },

    /// The umount2 syscall failed.
    #[snafu(display("umount2 failed for {}", path.display()))]
    UnmountSyscall {
        path: PathBuf,
        source: nix::errno::Errno,
    },

    /// The event source did not answer an unmount request in time.
    #[snafu(display("unmount of {} did not complete within {timeout:?}", path.display()))]
    UnmountTimeout { path: PathBuf, timeout: Duration },

    /// User cancelled the authentication dialog.
    #[snafu(display("authentication cancelled by user"))]
    AuthenticationCancelled,

    /// No known device matches the identifier.
    #[snafu(display("no device matches '{id}'"))]
    DeviceNotFound { id: String },

    /// The device is known but has no mount path.
    #[snafu(display("device '{uid}' is not mounted"))]
    NotMounted { uid: String },

    /// `wait_for_events` is already running for this service.
    #[snafu(display("the event watcher loop is already running"))]
    AlreadyWatching,

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_context_wraps_io_error() {
        let io: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such binary",
        ));
        let err = io.command_context("lsblk").unwrap_err();
        assert!(matches!(err, Error::CommandExecution { ref command, .. } if command == "lsblk"));
        assert_eq!(err.to_string(), "failed to execute command 'lsblk'");
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::UnmountTimeout {
            path: PathBuf::from("/media/usb"),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "unmount of /media/usb did not complete within 250ms"
        );
    }
}
