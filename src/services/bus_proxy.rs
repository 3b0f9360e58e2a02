//! Message-bus filter proxy.
//!
//! The proxy inherits the write end of a readiness pipe on a fixed fd
//! (passed as `--fd=N`) and closes it once its filtered listener is bound.
//! The launcher blocks reading the retained read end until end-of-data.

use crate::config::types::{CommandSpec, LauncherError, Result};
use crate::services::terminate_and_wait;
use log::{debug, info};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe2, Pid};
use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Fd number the helper expects its readiness pipe on.
const READY_FD: i32 = 3;

#[derive(Debug)]
pub struct BusProxy {
    pid: Option<Pid>,
    ready_read: Option<File>,
}

impl BusProxy {
    /// Spawn the proxy with the readiness pipe installed on [`READY_FD`].
    pub fn start(command_spec: &CommandSpec) -> Result<Self> {
        let (ready_read, ready_write) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| LauncherError::Spawn(format!("pipe2(bus ready): {e}")))?;
        let write_fd = ready_write.as_raw_fd();

        let mut command = Command::new(&command_spec.exe);
        command
            .arg(format!("--fd={READY_FD}"))
            .args(&command_spec.args);
        unsafe {
            command.pre_exec(move || {
                if write_fd == READY_FD {
                    // Already on the right number; just let it survive exec.
                    if libc::fcntl(write_fd, libc::F_SETFD, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(write_fd, READY_FD) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| {
            LauncherError::Spawn(format!(
                "cannot spawn bus-filter proxy {}: {e}",
                command_spec.exe.display()
            ))
        })?;
        let pid = Pid::from_raw(child.id() as i32);
        debug!("bus-filter proxy started, pid {pid}");

        // Only the helper may hold the write end now, so end-of-data on the
        // read side means the helper closed it.
        drop(ready_write);

        Ok(Self {
            pid: Some(pid),
            ready_read: Some(File::from(ready_read)),
        })
    }

    /// Block until the helper closes its end of the readiness pipe. A
    /// helper that died instead of binding is a launch failure, not
    /// readiness.
    pub fn wait_ready(&mut self) -> Result<()> {
        let mut gate = self.ready_read.take().ok_or_else(|| {
            LauncherError::Service("bus-filter proxy readiness already consumed".to_string())
        })?;
        let mut scratch = Vec::new();
        gate.read_to_end(&mut scratch)?;

        // A helper that died closes the pipe as a side effect; let the exit
        // reach the child table before sampling liveness.
        std::thread::sleep(std::time::Duration::from_millis(10));

        if let Some(pid) = self.pid {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(WaitStatus::Exited(_, code)) => {
                    self.pid = None;
                    return Err(LauncherError::Service(format!(
                        "bus-filter proxy exited with status {code} before becoming ready"
                    )));
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.pid = None;
                    return Err(LauncherError::Service(format!(
                        "bus-filter proxy killed by signal {sig} before becoming ready"
                    )));
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => {
                    self.pid = None;
                    return Err(LauncherError::Service(
                        "bus-filter proxy disappeared before becoming ready".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(LauncherError::Reap(format!("waitpid(bus proxy): {e}")));
                }
            }
        }

        info!("bus-filter proxy ready");
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(pid) = self.pid.take() {
            terminate_and_wait("bus-filter proxy", pid);
        }
    }
}

impl Drop for BusProxy {
    fn drop(&mut self) {
        self.stop();
    }
}
