//! Configuration-value mini-language.
//!
//! Argument files are JSON arrays whose elements are either plain strings or
//! tagged objects: `env` (environment lookup with optional `or` fallback),
//! `concat` (two sub-values joined), `instanceId` (the resolved instance
//! identifier), `mkdir` (create a directory and yield its path). The
//! evaluator carries the instance identifier as context; it holds no global
//! mutable state.

use crate::config::types::{LauncherError, Result};
use log::debug;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

/// One element of an argument file.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Literal(String),
    Tagged(TaggedValue),
}

/// Closed set of tagged configuration values.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaggedValue {
    Env {
        key: String,
        #[serde(default)]
        or: Option<Box<ArgValue>>,
    },
    Concat {
        a: Box<ArgValue>,
        b: Box<ArgValue>,
    },
    InstanceId,
    Mkdir {
        dir: Box<ArgValue>,
    },
}

/// Evaluates argument files against a fixed instance identifier.
pub struct Resolver<'a> {
    instance_id: &'a str,
}

impl<'a> Resolver<'a> {
    pub fn new(instance_id: &'a str) -> Self {
        Self { instance_id }
    }

    /// Read and evaluate a whole argument file.
    pub fn eval_args_file(&self, path: &Path) -> Result<Vec<String>> {
        let text = fs::read_to_string(path).map_err(|e| {
            LauncherError::Config(format!(
                "cannot read argument file {}: {e}",
                path.display()
            ))
        })?;
        let values: Vec<ArgValue> = serde_json::from_str(&text).map_err(|e| {
            LauncherError::Config(format!(
                "argument file {} is not a JSON array of values: {e}",
                path.display()
            ))
        })?;
        values.iter().map(|v| self.eval(v)).collect()
    }

    /// Evaluate a single value to its final string.
    pub fn eval(&self, value: &ArgValue) -> Result<String> {
        match value {
            ArgValue::Literal(s) => Ok(s.clone()),
            ArgValue::Tagged(TaggedValue::Env { key, or }) => {
                // An empty variable counts as unset, matching shell conventions
                // for the display/session variables this is used with.
                match std::env::var(key) {
                    Ok(val) if !val.is_empty() => Ok(val),
                    _ => match or {
                        Some(fallback) => self.eval(fallback),
                        None => Err(LauncherError::Config(format!(
                            "environment variable '{key}' is not set"
                        ))),
                    },
                }
            }
            ArgValue::Tagged(TaggedValue::Concat { a, b }) => {
                Ok(format!("{}{}", self.eval(a)?, self.eval(b)?))
            }
            ArgValue::Tagged(TaggedValue::InstanceId) => Ok(self.instance_id.to_string()),
            ArgValue::Tagged(TaggedValue::Mkdir { dir }) => {
                let path = self.eval(dir)?;
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(&path)
                    .map_err(|e| {
                        LauncherError::Config(format!("cannot create directory {path}: {e}"))
                    })?;
                debug!("created directory {path}");
                Ok(path)
            }
        }
    }
}

/// Alphabet used for instance identifiers; kept compatible with the runtime
/// directories other desktop tooling expects to be able to list.
const INSTANCE_ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Derive the instance identifier from the launcher's pid, optionally
/// namespaced by application name. Uniqueness is best-effort; pid-reuse
/// collisions are accepted.
pub fn derive_instance_id(app_name: Option<&str>) -> String {
    instance_id_for(std::process::id(), app_name)
}

fn instance_id_for(pid: u32, app_name: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    if let Some(name) = app_name {
        hasher.update(name.as_bytes());
        hasher.update(b"/");
    }
    hasher.update(pid.to_string().as_bytes());
    let digest = hasher.finalize();
    encode_instance(&digest[..16])
}

/// Base32 with the custom alphabet, most significant bits first, no padding.
fn encode_instance(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 8 / 5 + 1);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(INSTANCE_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(INSTANCE_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}
