/// Core types for the launcher: resolved configuration and the error taxonomy.
use std::path::PathBuf;
use thiserror::Error;

/// A resolved executable plus its argument vector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub exe: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(exe: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            exe: exe.into(),
            args,
        }
    }
}

/// Display-proxy helper plus the socket path it will create once bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayProxyConfig {
    pub command: CommandSpec,
    pub socket: PathBuf,
}

/// Immutable launch configuration, built once by the resolver.
///
/// Helper fields are `None` when the corresponding facility is disabled;
/// `info_template` doubles as the metadata enablement flag.
#[derive(Clone, Debug)]
pub struct LaunchConfiguration {
    pub instance_id: String,
    pub host: CommandSpec,
    pub app: CommandSpec,
    pub bus_proxy: Option<CommandSpec>,
    pub display_proxy: Option<DisplayProxyConfig>,
    pub net_attach: Option<CommandSpec>,
    pub info_template: Option<PathBuf>,
}

/// Launcher error taxonomy.
///
/// A non-zero host exit is not represented here: it is the routine outcome
/// and propagates as the launcher's own exit status. "Child not found" on a
/// specific-pid wait is likewise not an error; both collection mechanisms
/// agree a no-longer-existent child is a collected child.
#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("handshake protocol error: {0}")]
    Protocol(String),

    #[error("failed to launch subprocess: {0}")]
    Spawn(String),

    #[error("helper service error: {0}")]
    Service(String),

    #[error("child collection error: {0}")]
    Reap(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for LauncherError {
    fn from(err: nix::errno::Errno) -> Self {
        LauncherError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, LauncherError>;
