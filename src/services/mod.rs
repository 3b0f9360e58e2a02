//! Ancillary service coordination.
//!
//! Three helper kinds share one capability shape (start, wait ready, stop)
//! but implement their own readiness primitive: the bus-filter proxy closes
//! an inherited pipe, the display proxy creates a named socket file, and the
//! one-shot network attacher simply exits with status zero.

pub mod bus_proxy;
pub mod display_proxy;
pub mod net_attach;

pub use bus_proxy::BusProxy;
pub use display_proxy::DisplayProxy;
pub use net_attach::NetAttacher;

use crate::config::types::Result;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// Closed set of helper variants behind the uniform lifecycle interface.
pub enum AncillaryService {
    Bus(BusProxy),
    Display(DisplayProxy),
    Net(NetAttacher),
}

impl AncillaryService {
    pub fn name(&self) -> &'static str {
        match self {
            AncillaryService::Bus(_) => "bus-filter proxy",
            AncillaryService::Display(_) => "display proxy",
            AncillaryService::Net(_) => "network attacher",
        }
    }

    /// Block until the helper's readiness condition holds.
    pub fn wait_ready(&mut self) -> Result<()> {
        match self {
            AncillaryService::Bus(svc) => svc.wait_ready(),
            AncillaryService::Display(svc) => svc.wait_ready(),
            AncillaryService::Net(svc) => svc.wait_ready(),
        }
    }

    /// Terminate the helper where applicable; tolerates already-exited.
    pub fn stop(&mut self) {
        match self {
            AncillaryService::Bus(svc) => svc.stop(),
            AncillaryService::Display(svc) => svc.stop(),
            AncillaryService::Net(svc) => svc.stop(),
        }
    }

    /// Bind-mount pairs and env overrides this helper contributes to the
    /// sandbox host's argument vector.
    pub fn host_args(&self) -> Vec<String> {
        match self {
            AncillaryService::Display(svc) => svc.host_args(),
            AncillaryService::Bus(_) | AncillaryService::Net(_) => Vec::new(),
        }
    }
}

/// SIGTERM a helper and wait for it, tolerating "already gone" on both
/// steps. Shared by the long-lived helper variants.
pub(crate) fn terminate_and_wait(name: &str, pid: Pid) {
    match signal::kill(pid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("cannot signal {name} ({pid}): {e}"),
    }
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                debug!("{name} ({pid}) stopped");
                return;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                debug!("{name} ({pid}) already collected");
                return;
            }
            Err(e) => {
                warn!("wait for {name} ({pid}) failed: {e}");
                return;
            }
        }
    }
}
