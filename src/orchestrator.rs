//! Session orchestration.
//!
//! Startup order: reaper, instance metadata, long-lived helpers (started,
//! then all ready), sandbox host, info handshake, one-shot network attacher,
//! release. Teardown is the strict reverse and runs on every exit path:
//! whatever the run body managed to acquire lands in the session struct, and
//! a single idempotent `teardown` unwinds it after the body returns, success
//! or error.

use crate::config::types::{LaunchConfiguration, Result};
use crate::instance::InstanceMetadata;
use crate::reaper::ChildReaper;
use crate::sandbox::{start_sandbox_host, SandboxSession};
use crate::services::{AncillaryService, BusProxy, DisplayProxy, NetAttacher};
use log::{debug, info, warn};

/// Run one sandbox session to completion and return the launcher's exit
/// code (the host's own exit status).
pub fn run(config: &LaunchConfiguration) -> Result<i32> {
    let mut reaper = ChildReaper::activate()?;
    let mut session = LaunchSession::new(config);
    let outcome = session.run(&mut reaper);
    session.teardown();
    let shutdown_reap = reaper.quiesce_and_reap_all();
    reaper.shutdown();

    let code = outcome?;
    shutdown_reap?;
    Ok(code)
}

struct LaunchSession<'a> {
    config: &'a LaunchConfiguration,
    metadata: Option<InstanceMetadata>,
    services: Vec<AncillaryService>,
    sandbox: Option<SandboxSession>,
    info_raw: Option<Vec<u8>>,
    torn_down: bool,
}

impl<'a> LaunchSession<'a> {
    fn new(config: &'a LaunchConfiguration) -> Self {
        Self {
            config,
            metadata: None,
            services: Vec::new(),
            sandbox: None,
            info_raw: None,
            torn_down: false,
        }
    }

    fn run(&mut self, reaper: &mut ChildReaper) -> Result<i32> {
        let config = self.config;

        if let Some(template) = &config.info_template {
            self.metadata = Some(InstanceMetadata::materialize(
                &config.instance_id,
                template,
            )?);
        }

        if let Some(spec) = &config.bus_proxy {
            self.services.push(AncillaryService::Bus(BusProxy::start(spec)?));
        }
        if let Some(display) = &config.display_proxy {
            self.services
                .push(AncillaryService::Display(DisplayProxy::start(display)?));
        }
        // Every long-lived helper is fully ready before the host starts;
        // their bind paths and env overrides feed host construction.
        for service in &mut self.services {
            service.wait_ready()?;
        }

        let host_args = collect_host_args(self.metadata.as_ref(), &self.services);
        let mut sandbox = start_sandbox_host(config, &host_args)?;
        let outcome = self.drive(&mut sandbox, reaper);
        self.sandbox = Some(sandbox);
        outcome
    }

    fn drive(
        &mut self,
        sandbox: &mut SandboxSession,
        reaper: &mut ChildReaper,
    ) -> Result<i32> {
        let config = self.config;

        let record = sandbox.await_ready()?;
        self.info_raw = Some(record.raw().to_vec());

        if let Some(spec) = &config.net_attach {
            // The attacher's exit status decides readiness; keep it away
            // from the background drain.
            reaper.deactivate();
            let attached = NetAttacher::start(spec, record.contained_pid())
                .and_then(|mut attacher| {
                    let ready = attacher.wait_ready();
                    self.services.push(AncillaryService::Net(attacher));
                    ready
                });
            let resumed = reaper.resume();
            attached?;
            resumed?;
        }

        // The host's exit status becomes the launcher's own; open the
        // race-free window before the release that lets it run out.
        reaper.deactivate();
        sandbox.release()?;
        let exit = sandbox.await_host_exit()?;
        let contained = sandbox.await_contained_exit();
        let resumed = reaper.resume();
        contained?;
        resumed?;

        info!("sandbox session ended with status {}", exit.exit_code());
        Ok(exit.exit_code())
    }

    /// Reverse-order unwind of everything acquired so far. Idempotent; safe
    /// after any partial failure.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(sandbox) = &mut self.sandbox {
            if let Err(e) = sandbox.force_stop_contained() {
                warn!("teardown: {e}");
            }
            sandbox.close();
        }
        for service in self.services.iter_mut().rev() {
            debug!("stopping {}", service.name());
            service.stop();
        }
        if let Some(meta) = &mut self.metadata {
            if let Some(raw) = &self.info_raw {
                meta.persist_record(raw);
            }
            meta.remove();
        }
    }
}

/// Metadata binds come first, then each ready helper's contribution, in
/// start order. Disabled facilities contribute nothing.
fn collect_host_args(
    metadata: Option<&InstanceMetadata>,
    services: &[AncillaryService],
) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(meta) = metadata {
        args.extend(meta.host_args());
    }
    for service in services {
        args.extend(service.host_args());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{CommandSpec, DisplayProxyConfig};
    use std::path::{Path, PathBuf};

    #[test]
    fn no_enabled_facilities_contribute_no_host_args() {
        assert!(collect_host_args(None, &[]).is_empty());
    }

    #[test]
    fn metadata_binds_appear_only_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let template = tmp.path().join("tpl");
        std::fs::write(&template, "[Application]\n").unwrap();
        let meta = InstanceMetadata::materialize_in(tmp.path(), "idX", &template).unwrap();

        let args = collect_host_args(Some(&meta), &[]);
        assert!(args.contains(&"--ro-bind".to_string()));
        assert!(args.contains(&crate::instance::RUNTIME_MOUNT_POINT.to_string()));
    }

    #[test]
    fn display_socket_bind_appears_only_when_display_is_enabled() {
        let display = DisplayProxy::started_for_tests(
            &DisplayProxyConfig {
                command: CommandSpec::new(Path::new("/bin/true"), Vec::new()),
                socket: PathBuf::from("/nonexistent/display/proxy.sock"),
            },
        );
        let services = vec![AncillaryService::Display(display)];
        let args = collect_host_args(None, &services);
        assert!(args.contains(&"/nonexistent/display/proxy.sock".to_string()));
        assert!(args.contains(&crate::services::display_proxy::DISPLAY_ENV.to_string()));
    }

    #[test]
    fn teardown_on_an_empty_session_is_a_no_op() {
        let config = LaunchConfiguration {
            instance_id: "x".to_string(),
            host: CommandSpec::new("/bin/true", Vec::new()),
            app: CommandSpec::new("/bin/true", Vec::new()),
            bus_proxy: None,
            display_proxy: None,
            net_attach: None,
            info_template: None,
        };
        let mut session = LaunchSession::new(&config);
        session.teardown();
        session.teardown();
    }
}
