//! Display protocol proxy.
//!
//! Readiness is the appearance of the socket file the helper binds. The
//! watch is scoped to that file name within its parent directory, and the
//! existence check runs after the watch is armed so a socket created in
//! between is never missed.

use crate::config::types::{DisplayProxyConfig, LauncherError, Result};
use crate::services::terminate_and_wait;
use log::{debug, info};
use nix::unistd::Pid;
use notify::{Event, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::process::Command;
use std::sync::mpsc;

/// Path the socket is bound to inside the sandbox; absolute display names
/// are valid, so the same value doubles as the display-name override.
pub const SANDBOX_SOCKET_PATH: &str = "/run/display/wayland.sock";
/// Display-name environment variable overridden inside the sandbox.
pub const DISPLAY_ENV: &str = "WAYLAND_DISPLAY";

pub struct DisplayProxy {
    pid: Option<Pid>,
    socket: PathBuf,
    ready: bool,
}

impl DisplayProxy {
    pub fn start(config: &DisplayProxyConfig) -> Result<Self> {
        let child = Command::new(&config.command.exe)
            .args(&config.command.args)
            .spawn()
            .map_err(|e| {
                LauncherError::Spawn(format!(
                    "cannot spawn display proxy {}: {e}",
                    config.command.exe.display()
                ))
            })?;
        let pid = Pid::from_raw(child.id() as i32);
        debug!("display proxy started, pid {pid}");
        Ok(Self {
            pid: Some(pid),
            socket: config.socket.clone(),
            ready: false,
        })
    }

    /// Block until the socket file exists.
    pub fn wait_ready(&mut self) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        let dir = self.socket.parent().ok_or_else(|| {
            LauncherError::Config(format!(
                "display socket path {} has no parent directory",
                self.socket.display()
            ))
        })?;
        let target = self.socket.file_name().map(|n| n.to_owned()).ok_or_else(|| {
            LauncherError::Config(format!(
                "display socket path {} has no file name",
                self.socket.display()
            ))
        })?;

        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(target.as_os_str()))
                    {
                        let _ = tx.send(());
                    }
                }
            },
        )
        .map_err(|e| LauncherError::Spawn(format!("cannot create socket watcher: {e}")))?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                LauncherError::Spawn(format!("cannot watch {}: {e}", dir.display()))
            })?;

        // The watch is armed; a socket that already exists can no longer
        // slip past it.
        while !self.socket.exists() {
            rx.recv().map_err(|_| {
                LauncherError::Service("display proxy socket watch ended unexpectedly".to_string())
            })?;
        }

        self.ready = true;
        info!("display proxy ready at {}", self.socket.display());
        Ok(())
    }

    /// Bind the proxy socket into the sandbox and point the display name at
    /// it. Only meaningful once ready.
    pub fn host_args(&self) -> Vec<String> {
        vec![
            "--bind".to_string(),
            self.socket.display().to_string(),
            SANDBOX_SOCKET_PATH.to_string(),
            "--setenv".to_string(),
            DISPLAY_ENV.to_string(),
            SANDBOX_SOCKET_PATH.to_string(),
        ]
    }

    /// A handle in the ready state with no process behind it, for argument
    /// composition tests.
    #[cfg(test)]
    pub(crate) fn started_for_tests(config: &DisplayProxyConfig) -> Self {
        Self {
            pid: None,
            socket: config.socket.clone(),
            ready: true,
        }
    }

    pub fn stop(&mut self) {
        if let Some(pid) = self.pid.take() {
            terminate_and_wait("display proxy", pid);
        }
        // Stale socket removal is best-effort.
        if self.socket.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket) {
                debug!("leaving stale socket {}: {e}", self.socket.display());
            }
        }
    }
}

impl Drop for DisplayProxy {
    fn drop(&mut self) {
        self.stop();
    }
}
