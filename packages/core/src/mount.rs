//! Unmount operations.
//!
//! The physical unmount runs either through the `umount` binary, optionally
//! wrapped with `sudo`/`pkexec`, or through the `umount2` syscall.

use std::path::Path;
use std::process::{Command, Output};

use nix::mount::{MntFlags, umount2};
use snafu::ResultExt;
use tracing::debug;

use crate::config::{Escalation, UnmountMethod, WatcherConfig};
use crate::error::{Error, IoResultExt, Result, UnmountSyscallSnafu};

/// Exit code pkexec uses when the user dismisses the dialog.
const PKEXEC_CANCELLED: i32 = 126;

/// Performs physical unmounts according to the configured method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Unmounter {
    method: UnmountMethod,
    escalation: Escalation,
    lazy: bool,
}

impl Unmounter {
    pub fn new(method: UnmountMethod, escalation: Escalation, lazy: bool) -> Self {
        Self {
            method,
            escalation,
            lazy,
        }
    }

    pub fn from_config(config: &WatcherConfig) -> Self {
        Self::new(config.unmount_method, config.escalation, config.lazy_unmount)
    }

    pub fn method(&self) -> UnmountMethod {
        self.method
    }

    pub fn escalation(&self) -> Escalation {
        self.escalation
    }

    /// Unmounts the filesystem mounted at `mount_point`.
    pub fn unmount(&self, mount_point: &Path) -> Result<()> {
        debug!(path = %mount_point.display(), method = ?self.method, "unmounting");
        match self.method {
            UnmountMethod::Command => self.unmount_with_command(mount_point),
            UnmountMethod::Syscall => self.unmount_with_syscall(mount_point),
        }
    }

    fn unmount_with_syscall(&self, mount_point: &Path) -> Result<()> {
        let flags = if self.lazy {
            MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        umount2(mount_point, flags).context(UnmountSyscallSnafu { path: mount_point })
    }

    fn unmount_with_command(&self, mount_point: &Path) -> Result<()> {
        let path = mount_point.to_string_lossy();
        let args = umount_args(&path, self.lazy);
        let output = self.run_escalated("umount", &args)?;

        if output.status.success() {
            return Ok(());
        }

        if self.escalation == Escalation::Pkexec && output.status.code() == Some(PKEXEC_CANCELLED) {
            return Err(Error::AuthenticationCancelled);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(Error::Unmount {
            path: mount_point.to_path_buf(),
            message: stderr,
        })
    }

    /// Runs `cmd` directly or behind the configured escalation wrapper.
    fn run_escalated(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let wrapper = match self.escalation {
            Escalation::None => None,
            Escalation::Sudo => Some("sudo"),
            Escalation::Pkexec => Some("pkexec"),
        };

        match wrapper {
            None => Command::new(cmd)
                .args(args)
                .output()
                .command_context(cmd),
            Some(wrapper) => Command::new(wrapper)
                .arg(cmd)
                .args(args)
                .output()
                .command_context(format!("{} {}", wrapper, cmd)),
        }
    }
}

fn umount_args(path: &str, lazy: bool) -> Vec<&str> {
    if lazy { vec!["-l", path] } else { vec![path] }
}
