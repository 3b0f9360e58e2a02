//! bolthole: a sandbox launcher.
//!
//! Starts a privileged sandboxing host (bubblewrap-style), synchronizes with
//! it over an info/block channel pair, coordinates optional helper services,
//! and guarantees that every descendant process is eventually collected.
//!
//! # Architecture
//!
//! - [`config`]: launch configuration — environment resolution, the
//!   tagged-value argument mini-language, error taxonomy
//! - [`reaper`]: subreaper registration and SIGCHLD-driven child collection
//! - [`sandbox`]: sandbox host controller and the info/block handshake
//! - [`services`]: bus-filter proxy, display proxy, network attacher behind
//!   one start/ready/stop lifecycle
//! - [`instance`]: per-instance runtime directory and metadata file
//! - [`orchestrator`]: startup sequencing and guaranteed reverse teardown
//! - [`cli`]: command-line entrypoint wiring
//!
//! The launcher manages exactly one sandbox session per invocation and exits
//! with the host's own exit status.

pub mod cli;
pub mod config;
pub mod instance;
pub mod orchestrator;
pub mod reaper;
pub mod sandbox;
pub mod services;

pub use config::types::{LaunchConfiguration, LauncherError, Result};
