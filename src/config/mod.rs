//! Launch configuration: environment resolution and the value mini-language.
//!
//! The launcher is configured entirely through environment variables set by
//! the packaging layer. `*_ARGS` variables name JSON argument files in the
//! mini-language (see [`resolver`]); helper facilities are enabled by the
//! presence of their variable, disabled by its absence.

pub mod resolver;
pub mod types;

use crate::config::resolver::{derive_instance_id, Resolver};
use crate::config::types::{
    CommandSpec, DisplayProxyConfig, LaunchConfiguration, LauncherError, Result,
};
use log::debug;
use std::path::{Path, PathBuf};

/// Sandbox host executable; defaults to `bwrap`.
pub const HOST_EXE_ENV: &str = "BOLTHOLE_HOST_EXE";
/// Host argument file (required).
pub const HOST_ARGS_ENV: &str = "BOLTHOLE_HOST_ARGS";
/// Contained application executable (required).
pub const APP_EXE_ENV: &str = "BOLTHOLE_APP_EXE";
/// Optional application name; namespaces the instance identifier.
pub const APP_NAME_ENV: &str = "BOLTHOLE_APP_NAME";
/// Bus-filter proxy argument file; presence enables the proxy.
pub const BUS_PROXY_ARGS_ENV: &str = "BOLTHOLE_BUS_PROXY_ARGS";
/// Bus-filter proxy executable; defaults to `xdg-dbus-proxy`.
pub const BUS_PROXY_EXE_ENV: &str = "BOLTHOLE_BUS_PROXY_EXE";
/// Display proxy argument file; presence enables the proxy.
pub const DISPLAY_PROXY_ARGS_ENV: &str = "BOLTHOLE_DISPLAY_PROXY_ARGS";
/// Display proxy executable (required when the proxy is enabled).
pub const DISPLAY_PROXY_EXE_ENV: &str = "BOLTHOLE_DISPLAY_PROXY_EXE";
/// Socket path the display proxy creates (required when enabled).
pub const DISPLAY_SOCKET_ENV: &str = "BOLTHOLE_DISPLAY_SOCKET";
/// Network attacher executable; presence enables the attacher.
pub const NET_ATTACH_EXE_ENV: &str = "BOLTHOLE_NET_ATTACH_EXE";
/// Network attacher argument file (optional).
pub const NET_ATTACH_ARGS_ENV: &str = "BOLTHOLE_NET_ATTACH_ARGS";
/// Metadata template path; presence enables metadata materialization.
pub const INFO_TEMPLATE_ENV: &str = "BOLTHOLE_INFO_TEMPLATE";

const DEFAULT_HOST_EXE: &str = "bwrap";
const DEFAULT_BUS_PROXY_EXE: &str = "xdg-dbus-proxy";

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_var(name).unwrap_or_else(|| default.to_string())
}

fn required(name: &str) -> Result<String> {
    env_var(name).ok_or_else(|| LauncherError::Config(format!("{name} is not set")))
}

impl LaunchConfiguration {
    /// Resolve the full configuration from the environment; `app_args` is the
    /// launcher's own trailing argv, passed through to the application.
    pub fn from_env(app_args: Vec<String>) -> Result<Self> {
        let instance_id = derive_instance_id(env_var(APP_NAME_ENV).as_deref());
        let resolver = Resolver::new(&instance_id);

        let host_args = resolver.eval_args_file(Path::new(&required(HOST_ARGS_ENV)?))?;
        let host = CommandSpec::new(env_or(HOST_EXE_ENV, DEFAULT_HOST_EXE), host_args);
        let app = CommandSpec::new(required(APP_EXE_ENV)?, app_args);

        let bus_proxy = env_var(BUS_PROXY_ARGS_ENV)
            .map(|args_file| {
                let args = resolver.eval_args_file(Path::new(&args_file))?;
                Ok::<_, LauncherError>(CommandSpec::new(
                    env_or(BUS_PROXY_EXE_ENV, DEFAULT_BUS_PROXY_EXE),
                    args,
                ))
            })
            .transpose()?;

        let display_proxy = env_var(DISPLAY_PROXY_ARGS_ENV)
            .map(|args_file| {
                let args = resolver.eval_args_file(Path::new(&args_file))?;
                let exe = required(DISPLAY_PROXY_EXE_ENV)?;
                let socket = PathBuf::from(required(DISPLAY_SOCKET_ENV)?);
                Ok::<_, LauncherError>(DisplayProxyConfig {
                    command: CommandSpec::new(exe, args),
                    socket,
                })
            })
            .transpose()?;

        let net_attach = env_var(NET_ATTACH_EXE_ENV)
            .map(|exe| {
                let args = match env_var(NET_ATTACH_ARGS_ENV) {
                    Some(args_file) => resolver.eval_args_file(Path::new(&args_file))?,
                    None => Vec::new(),
                };
                Ok::<_, LauncherError>(CommandSpec::new(exe, args))
            })
            .transpose()?;

        let info_template = env_var(INFO_TEMPLATE_ENV).map(PathBuf::from);

        debug!(
            "resolved configuration: instance {instance_id}, bus proxy {}, display proxy {}, \
             network attacher {}, metadata {}",
            bus_proxy.is_some(),
            display_proxy.is_some(),
            net_attach.is_some(),
            info_template.is_some(),
        );

        Ok(Self {
            instance_id,
            host,
            app,
            bus_proxy,
            display_proxy,
            net_attach,
            info_template,
        })
    }
}
