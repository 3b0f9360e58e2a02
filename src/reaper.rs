//! Process-wide child collection.
//!
//! The launcher registers as an OS subreaper so orphaned grandchildren (for
//! example, processes reparented when a helper dies) attach here instead of
//! to init, and are therefore always collected. Collection is driven by a
//! SIGCHLD handler that writes one byte to a wake pipe; a background thread
//! drains the pipe and non-blockingly reaps every currently-exited child, so
//! coalesced signals cannot strand a zombie.
//!
//! The handler itself only performs async-signal-safe operations: an atomic
//! load and a `write(2)` to the non-blocking wake fd.

use crate::config::types::{LauncherError, Result};
use log::{debug, error, trace, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::prctl;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, pipe2, Pid};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::JoinHandle;

/// Write end of the wake pipe, readable from the signal handler.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn notify_child_exit(_signo: libc::c_int) {
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let buf = [1u8];
        let _ = unsafe { libc::write(fd, buf.as_ptr().cast(), 1) };
    }
}

fn install_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(notify_child_exit),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGCHLD, &action) }
        .map_err(|e| LauncherError::Reap(format!("sigaction(SIGCHLD): {e}")))?;
    Ok(())
}

fn uninstall_handler() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    if let Err(e) = unsafe { signal::sigaction(Signal::SIGCHLD, &action) } {
        warn!("failed to restore default SIGCHLD disposition: {e}");
    }
}

/// Reap every currently-exited child without blocking. An unexpected wait
/// failure here means the child table is in a state the launcher cannot
/// reason about; that aborts the launcher.
fn drain_exited() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => trace!("collected child: {status:?}"),
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("child reaper: waitpid failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

/// Subreaper registration plus the background drain task. Owned by the
/// orchestrator; the only process-global pieces are the installed handler
/// and the wake fd it writes to.
pub struct ChildReaper {
    wake_write: Option<OwnedFd>,
    drain: Option<JoinHandle<()>>,
    delivering: bool,
}

impl ChildReaper {
    /// Register as subreaper, install the SIGCHLD handler, and start the
    /// background drain thread.
    pub fn activate() -> Result<Self> {
        prctl::set_child_subreaper(true)
            .map_err(|e| LauncherError::Reap(format!("prctl(PR_SET_CHILD_SUBREAPER): {e}")))?;

        let (wake_read, wake_write) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| LauncherError::Reap(format!("pipe2(wake): {e}")))?;
        // The handler must never block on a full pipe; the read side stays
        // blocking so the drain thread sleeps between notifications.
        let write_fd = wake_write.as_raw_fd();
        let flags = unsafe { libc::fcntl(write_fd, libc::F_GETFL) };
        if flags == -1
            || unsafe { libc::fcntl(write_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
        {
            return Err(LauncherError::Reap(format!(
                "fcntl(wake, O_NONBLOCK): {}",
                std::io::Error::last_os_error()
            )));
        }
        WAKE_FD.store(wake_write.as_raw_fd(), Ordering::SeqCst);

        install_handler()?;

        let drain = std::thread::Builder::new()
            .name("child-reaper".to_string())
            .spawn(move || {
                let mut buf = [0u8; 64];
                loop {
                    match unistd::read(wake_read.as_raw_fd(), &mut buf) {
                        // One wakeup drains every currently-exited child, so
                        // coalesced notifications are handled safely.
                        Ok(n) if n > 0 => drain_exited(),
                        Ok(_) => break, // EOF: write end closed, shutting down
                        Err(Errno::EINTR) => continue,
                        Err(e) => {
                            error!("child reaper: wake pipe read failed: {e}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| LauncherError::Reap(format!("spawn(child-reaper): {e}")))?;

        debug!("child reaper active, subreaper registered");
        Ok(Self {
            wake_write: Some(wake_write),
            drain: Some(drain),
            delivering: true,
        })
    }

    /// Stop notification delivery without blocking. Opens a race-free window
    /// for an explicit specific-pid wait whose exit status must not be lost
    /// to the background drain.
    pub fn deactivate(&mut self) {
        if self.delivering {
            uninstall_handler();
            self.delivering = false;
            debug!("child-exit notification delivery stopped");
        }
    }

    /// Resume notification delivery after [`ChildReaper::deactivate`].
    pub fn resume(&mut self) -> Result<()> {
        if !self.delivering {
            install_handler()?;
            self.delivering = true;
            // Children may have exited while delivery was off; nudge the
            // drain thread so they are not stranded until the next SIGCHLD.
            self.wake();
            debug!("child-exit notification delivery resumed");
        }
        Ok(())
    }

    /// Stop delivery, blockingly reap every remaining child, then resume
    /// delivery. Used at shutdown so no helper outlives the launcher.
    pub fn quiesce_and_reap_all(&mut self) -> Result<()> {
        self.deactivate();
        loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(status) => debug!("collected child at shutdown: {status:?}"),
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    let _ = self.resume();
                    return Err(LauncherError::Reap(format!("waitpid(shutdown): {e}")));
                }
            }
        }
        self.resume()
    }

    /// Stop delivery, close the wake pipe so the drain thread exits, and
    /// join it. Idempotent.
    pub fn shutdown(&mut self) {
        self.deactivate();
        WAKE_FD.store(-1, Ordering::SeqCst);
        self.wake_write.take();
        if let Some(drain) = self.drain.take() {
            if drain.join().is_err() {
                warn!("child-reaper thread panicked during shutdown");
            }
        }
    }

    fn wake(&self) {
        if let Some(fd) = &self.wake_write {
            let _ = unistd::write(fd, &[1u8]);
        }
    }
}

impl Drop for ChildReaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::process::Command;
    use std::time::Duration;

    fn no_children_remain() -> bool {
        matches!(
            waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)),
            Err(Errno::ECHILD)
        )
    }

    #[test]
    #[serial]
    fn background_drain_collects_exited_children() {
        let mut reaper = ChildReaper::activate().unwrap();
        for _ in 0..3 {
            Command::new("/bin/true").spawn().unwrap();
        }
        std::thread::sleep(Duration::from_millis(500));
        // Stop the drain before probing so the probe itself cannot race it.
        reaper.deactivate();
        assert!(no_children_remain(), "drain left zombies behind");
        reaper.shutdown();
    }

    #[test]
    #[serial]
    fn quiesce_collects_every_remaining_child() {
        let mut reaper = ChildReaper::activate().unwrap();
        reaper.deactivate();
        for _ in 0..3 {
            Command::new("/bin/true").spawn().unwrap();
        }
        reaper.quiesce_and_reap_all().unwrap();
        reaper.deactivate();
        assert!(no_children_remain());
        reaper.shutdown();
    }

    #[test]
    #[serial]
    fn deactivated_window_preserves_explicit_wait_status() {
        let mut reaper = ChildReaper::activate().unwrap();
        reaper.deactivate();
        let child = Command::new("/bin/sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    assert_eq!(code, 3);
                    break;
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => panic!("explicit wait lost the exit status: {e}"),
            }
        }
        reaper.resume().unwrap();
        reaper.shutdown();
    }

    #[test]
    #[serial]
    fn explicit_wait_tolerates_background_collection() {
        let mut reaper = ChildReaper::activate().unwrap();
        let child = Command::new("/bin/true").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        std::thread::sleep(Duration::from_millis(500));
        // Either the drain already collected it (ECHILD) or this wait wins
        // the race; both count as collected.
        match waitpid(pid, None) {
            Err(Errno::ECHILD) | Ok(WaitStatus::Exited(_, _)) => {}
            other => panic!("unexpected wait outcome: {other:?}"),
        }
        reaper.shutdown();
    }

    #[test]
    #[serial]
    fn orphaned_grandchild_is_collected_without_an_explicit_wait() {
        use std::io::Read;
        use std::process::Stdio;

        let mut reaper = ChildReaper::activate().unwrap();
        // The shell exits immediately, orphaning the background sleep; the
        // subreaper adopts it and the drain must collect it on exit.
        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 0.3 & echo $!"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut out = String::new();
        child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        let orphan: i32 = out.trim().parse().unwrap();

        std::thread::sleep(Duration::from_millis(1500));
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{orphan}/stat")) {
            let after = stat.rsplit_once(')').map(|x| x.1).unwrap_or("");
            let mut fields = after.split_whitespace();
            let state = fields.next().unwrap_or("");
            let ppid = fields.next().unwrap_or("");
            assert!(
                !(state == "Z" && ppid == std::process::id().to_string()),
                "orphaned grandchild {orphan} was left as a zombie"
            );
        }
        reaper.shutdown();
    }

    #[test]
    #[serial]
    fn shutdown_is_idempotent() {
        let mut reaper = ChildReaper::activate().unwrap();
        reaper.shutdown();
        reaper.shutdown();
    }
}
