//! Network-namespace attacher.
//!
//! One-shot helper run once the contained pid is known: the pid is appended
//! to the configured argument vector and "ready" means exit status zero.
//! The caller must hold child-exit notification delivery off around
//! [`NetAttacher::wait_ready`], because the exit status is load-bearing.

use crate::config::types::{CommandSpec, LauncherError, Result};
use log::{debug, info};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::process::Command;

pub struct NetAttacher {
    pid: Option<Pid>,
}

impl NetAttacher {
    /// Spawn the attacher against the contained pid.
    pub fn start(command_spec: &CommandSpec, contained: Pid) -> Result<Self> {
        let child = Command::new(&command_spec.exe)
            .args(&command_spec.args)
            .arg(contained.to_string())
            .spawn()
            .map_err(|e| {
                LauncherError::Spawn(format!(
                    "cannot spawn network attacher {}: {e}",
                    command_spec.exe.display()
                ))
            })?;
        let pid = Pid::from_raw(child.id() as i32);
        debug!("network attacher started, pid {pid}, target {contained}");
        Ok(Self { pid: Some(pid) })
    }

    /// Wait for the attacher to finish; anything but exit status zero is a
    /// service failure.
    pub fn wait_ready(&mut self) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, 0)) => {
                    self.pid = None;
                    info!("network attacher finished");
                    return Ok(());
                }
                Ok(WaitStatus::Exited(_, code)) => {
                    self.pid = None;
                    return Err(LauncherError::Service(format!(
                        "network attacher exited with status {code}"
                    )));
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.pid = None;
                    return Err(LauncherError::Service(format!(
                        "network attacher killed by signal {sig}"
                    )));
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    // The status was lost, so success cannot be confirmed.
                    self.pid = None;
                    return Err(LauncherError::Service(
                        "network attacher exit status was lost".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(LauncherError::Reap(format!("waitpid(net attacher): {e}")));
                }
            }
        }
    }

    /// Nothing to stop: the attacher is not kept running.
    pub fn stop(&mut self) {
        self.pid = None;
    }
}
