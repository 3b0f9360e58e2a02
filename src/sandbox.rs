//! Sandbox host controller.
//!
//! Spawns the privileged sandbox host and runs the two-channel handshake:
//! the host writes one JSON record on the info channel and closes it, then
//! blocks reading the block channel until the launcher writes the release
//! byte. The record's mandatory field is the contained application's pid;
//! unknown fields are tolerated and the raw bytes are kept for pass-through.

use crate::config::types::{LaunchConfiguration, LauncherError, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{pipe2, Pid};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::Command;

const RELEASE_BYTE: u8 = b'x';

/// The record the host writes on the info channel before blocking.
#[derive(Debug)]
pub struct InfoRecord {
    contained_pid: Pid,
    raw: Vec<u8>,
}

impl InfoRecord {
    /// Parse one serialized record. The mandatory field is a positive
    /// `child-pid`; additional fields are tolerated for forward
    /// compatibility.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        if raw.is_empty() {
            return Err(LauncherError::Protocol(
                "info channel closed without a record".to_string(),
            ));
        }
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| LauncherError::Protocol(format!("malformed info record: {e}")))?;
        let pid = value
            .get("child-pid")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| {
                LauncherError::Protocol("info record is missing 'child-pid'".to_string())
            })?;
        let pid = i32::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| {
                LauncherError::Protocol(format!("info record carries invalid child-pid {pid}"))
            })?;
        Ok(Self {
            contained_pid: Pid::from_raw(pid),
            raw,
        })
    }

    pub fn contained_pid(&self) -> Pid {
        self.contained_pid
    }

    /// Raw record bytes, for side-car pass-through.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// How the host ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostExit {
    Code(i32),
    Signaled(Signal),
}

impl HostExit {
    /// The launcher's own exit code: the host's code, or the shell
    /// convention for signal deaths.
    pub fn exit_code(self) -> i32 {
        match self {
            HostExit::Code(code) => code,
            HostExit::Signaled(sig) => 128 + sig as i32,
        }
    }
}

/// One running sandbox host instance and both handshake channel ends.
pub struct SandboxSession {
    host_pid: Pid,
    info_read: Option<File>,
    block_write: Option<File>,
    contained: Option<Pid>,
    released: bool,
    host_waited: bool,
    closed: bool,
}

/// Spawn the sandbox host in its own process group.
///
/// `extra_host_args` carries the metadata bind entries and helper socket
/// binds/env overrides collected by the orchestrator; they precede the
/// configured host arguments, which precede the `--`-terminated application
/// command line.
pub fn start_sandbox_host(
    config: &LaunchConfiguration,
    extra_host_args: &[String],
) -> Result<SandboxSession> {
    let (info_read, info_write) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| LauncherError::Spawn(format!("pipe2(info): {e}")))?;
    let (block_read, block_write) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| LauncherError::Spawn(format!("pipe2(block): {e}")))?;

    let info_fd = info_write.as_raw_fd();
    let block_fd = block_read.as_raw_fd();

    let mut command = Command::new(&config.host.exe);
    command
        .arg("--info-fd")
        .arg(info_fd.to_string())
        .arg("--block-fd")
        .arg(block_fd.to_string())
        .args(extra_host_args)
        .args(&config.host.args)
        .arg("--")
        .arg(&config.app.exe)
        .args(&config.app.args);

    unsafe {
        command.pre_exec(move || {
            // Own process group so the host and its descendants can be
            // signalled as a unit.
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // The handshake fds must survive exec.
            for fd in [info_fd, block_fd] {
                if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        LauncherError::Spawn(format!(
            "cannot spawn sandbox host {}: {e}",
            config.host.exe.display()
        ))
    })?;
    let host_pid = Pid::from_raw(child.id() as i32);
    debug!("sandbox host started, pid {host_pid}");

    // The child's pipe halves close with these drops; the session retains
    // only the launcher-side ends.
    drop(info_write);
    drop(block_read);

    Ok(SandboxSession {
        host_pid,
        info_read: Some(File::from(info_read)),
        block_write: Some(File::from(block_write)),
        contained: None,
        released: false,
        host_waited: false,
        closed: false,
    })
}

impl SandboxSession {
    pub fn host_pid(&self) -> Pid {
        self.host_pid
    }

    /// Block until the info channel reaches end-of-data and parse the
    /// record. Fails with a protocol error when no positive contained pid is
    /// present.
    pub fn await_ready(&mut self) -> Result<InfoRecord> {
        let mut channel = self.info_read.take().ok_or_else(|| {
            LauncherError::Protocol("info channel already consumed".to_string())
        })?;
        let mut raw = Vec::new();
        channel.read_to_end(&mut raw)?;
        let record = InfoRecord::parse(raw)?;
        self.contained = Some(record.contained_pid());
        info!("sandbox host reported contained pid {}", record.contained_pid());
        Ok(record)
    }

    /// Write the sentinel byte and close the block channel, letting the
    /// contained application start. A second call is a no-op.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        let mut gate = self.block_write.take().ok_or_else(|| {
            LauncherError::Protocol("block channel already closed".to_string())
        })?;
        gate.write_all(&[RELEASE_BYTE]).map_err(|e| {
            LauncherError::Protocol(format!("sandbox host abandoned the block channel: {e}"))
        })?;
        self.released = true;
        debug!("released contained application");
        Ok(())
    }

    /// Block for host exit. The outcome is the launcher's own exit status,
    /// not an internal error. A status lost to a drain race degrades to
    /// success with a warning.
    pub fn await_host_exit(&mut self) -> Result<HostExit> {
        loop {
            match waitpid(self.host_pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.host_waited = true;
                    debug!("sandbox host exited with status {code}");
                    return Ok(HostExit::Code(code));
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.host_waited = true;
                    debug!("sandbox host terminated by signal {sig}");
                    return Ok(HostExit::Signaled(sig));
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    warn!("sandbox host exit status was collected in the background");
                    self.host_waited = true;
                    return Ok(HostExit::Code(0));
                }
                Err(e) => {
                    return Err(LauncherError::Reap(format!("waitpid(host): {e}")));
                }
            }
        }
    }

    /// Wait for the contained application. "No such child" is success: the
    /// background reaper and this wait agree a no-longer-existent process is
    /// a collected one.
    pub fn await_contained_exit(&mut self) -> Result<()> {
        let Some(pid) = self.contained else {
            return Ok(());
        };
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    self.contained = None;
                    debug!("contained process {pid} collected");
                    return Ok(());
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    self.contained = None;
                    debug!("contained process {pid} already collected");
                    return Ok(());
                }
                Err(e) => {
                    return Err(LauncherError::Reap(format!("waitpid(contained): {e}")));
                }
            }
        }
    }

    /// Signal the contained application, then wait for it. "No such
    /// process" means it is already gone, which is the goal.
    pub fn force_stop_contained(&mut self) -> Result<()> {
        if let Some(pid) = self.contained {
            match signal::kill(pid, Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("cannot signal contained process {pid}: {e}"),
            }
        }
        self.await_contained_exit()
    }

    /// Idempotent terminal cleanup: release both channel ends and, if the
    /// host was never waited for, terminate its process group and wait.
    /// Safe to call repeatedly and after partial setup failure.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.info_read.take();
        self.block_write.take();

        if !self.host_waited {
            // Group signal first; fall back to the pid when the group is
            // already gone.
            if signal::kill(Pid::from_raw(-self.host_pid.as_raw()), Signal::SIGTERM).is_err() {
                let _ = signal::kill(self.host_pid, Signal::SIGTERM);
            }
            loop {
                match waitpid(self.host_pid, None) {
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                    Ok(_) => continue,
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => break,
                    Err(e) => {
                        warn!("close: waitpid(host): {e}");
                        break;
                    }
                }
            }
            self.host_waited = true;
        }
        debug!("sandbox session closed");
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::CommandSpec;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn write_host_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-host.sh");
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    const ARG_PARSER: &str = r#"#!/bin/sh
info_fd=""
block_fd=""
while [ "$#" -gt 0 ]; do
    case "$1" in
        --info-fd) info_fd="$2"; shift 2 ;;
        --block-fd) block_fd="$2"; shift 2 ;;
        --) shift; break ;;
        *) shift ;;
    esac
done
"#;

    fn test_config(host_exe: &Path) -> LaunchConfiguration {
        LaunchConfiguration {
            instance_id: "testinstance".to_string(),
            host: CommandSpec::new(host_exe, Vec::new()),
            app: CommandSpec::new("/bin/true", Vec::new()),
            bus_proxy: None,
            display_proxy: None,
            net_attach: None,
            info_template: None,
        }
    }

    #[test]
    fn parse_accepts_record_with_unknown_fields() {
        let record =
            InfoRecord::parse(br#"{"child-pid": 4242, "future-field": [1, 2]}"#.to_vec()).unwrap();
        assert_eq!(record.contained_pid(), Pid::from_raw(4242));
        assert!(record.raw().starts_with(b"{"));
    }

    #[test]
    fn parse_rejects_empty_missing_and_nonpositive() {
        for raw in [
            &b""[..],
            &br#"{}"#[..],
            &br#"{"child-pid": 0}"#[..],
            &br#"{"child-pid": -5}"#[..],
            &br#"not json"#[..],
        ] {
            let err = InfoRecord::parse(raw.to_vec()).unwrap_err();
            assert!(matches!(err, LauncherError::Protocol(_)), "raw {raw:?} gave {err:?}");
        }
    }

    #[test]
    fn signal_deaths_map_to_shell_convention() {
        assert_eq!(HostExit::Code(7).exit_code(), 7);
        assert_eq!(HostExit::Signaled(Signal::SIGKILL).exit_code(), 137);
    }

    #[test]
    #[serial]
    fn handshake_reports_pid_releases_and_propagates_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let script = format!(
            "{ARG_PARSER}\
eval \"printf '%s' '{{\\\"child-pid\\\": 4242}}' >&$info_fd\"
eval \"exec $info_fd>&-\"
eval \"read -r gate <&$block_fd\" || :
exit 7
"
        );
        let host = write_host_script(tmp.path(), &script);
        let mut session = start_sandbox_host(&test_config(&host), &[]).unwrap();

        let record = session.await_ready().unwrap();
        assert_eq!(record.contained_pid(), Pid::from_raw(4242));

        session.release().unwrap();
        session.release().unwrap(); // second call is a no-op

        let exit = session.await_host_exit().unwrap();
        assert_eq!(exit, HostExit::Code(7));

        // pid 4242 is not our child; the wait treats that as collected.
        session.await_contained_exit().unwrap();

        session.close();
        session.close();
    }

    #[test]
    #[serial]
    fn host_stays_blocked_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("released");
        let script = format!(
            "{ARG_PARSER}\
eval \"printf '%s' '{{\\\"child-pid\\\": 99}}' >&$info_fd\"
eval \"exec $info_fd>&-\"
eval \"read -r gate <&$block_fd\" || :
: > {marker}
exit 0
",
            marker = marker.display()
        );
        let host = write_host_script(tmp.path(), &script);
        let mut session = start_sandbox_host(&test_config(&host), &[]).unwrap();

        session.await_ready().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(!marker.exists(), "host ran past the block channel early");

        session.release().unwrap();
        assert_eq!(session.await_host_exit().unwrap(), HostExit::Code(0));
        assert!(marker.exists());
        session.close();
    }

    #[test]
    #[serial]
    fn empty_info_channel_is_a_protocol_error() {
        let tmp = tempfile::tempdir().unwrap();
        let script = format!("{ARG_PARSER}eval \"exec $info_fd>&-\"\nexit 0\n");
        let host = write_host_script(tmp.path(), &script);
        let mut session = start_sandbox_host(&test_config(&host), &[]).unwrap();

        let err = session.await_ready().unwrap_err();
        assert!(matches!(err, LauncherError::Protocol(_)), "got {err:?}");

        // Cleanup after the failed handshake must not hang or error.
        session.close();
        session.close();
    }

    #[test]
    #[serial]
    fn close_terminates_an_unwaited_host() {
        let tmp = tempfile::tempdir().unwrap();
        let script = format!(
            "{ARG_PARSER}\
eval \"printf '%s' '{{\\\"child-pid\\\": 17}}' >&$info_fd\"
eval \"exec $info_fd>&-\"
sleep 60
"
        );
        let host = write_host_script(tmp.path(), &script);
        let mut session = start_sandbox_host(&test_config(&host), &[]).unwrap();

        session.await_ready().unwrap();
        session.close();
        // The host was signalled and waited; nothing is left to collect.
        assert!(matches!(
            waitpid(session.host_pid(), Some(nix::sys::wait::WaitPidFlag::WNOHANG)),
            Err(Errno::ECHILD)
        ));
    }
}
