//! Per-instance runtime directory and metadata file.
//!
//! When metadata is enabled, the launcher materializes a runtime directory
//! named after the instance identifier, copies the configured template into
//! it with an identity section appended, and exposes both paths to the
//! sandbox as bind mounts and environment values. After the session ends the
//! raw info-channel record is persisted as a side-car file, then the whole
//! directory is removed.

use crate::config::types::Result;
use log::{debug, warn};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// In-sandbox mount point of the runtime directory.
pub const RUNTIME_MOUNT_POINT: &str = "/run/.instance";
/// In-sandbox mount point of the metadata file.
pub const INFO_MOUNT_POINT: &str = "/.app-info";
/// Environment variable naming the runtime directory inside the sandbox.
pub const RUNTIME_DIR_ENV: &str = "SANDBOX_RUNTIME_DIR";
/// Environment variable naming the metadata file inside the sandbox.
pub const INFO_FILE_ENV: &str = "SANDBOX_INFO_FILE";

const INFO_FILE_NAME: &str = "app-info";
const SIDECAR_FILE_NAME: &str = "host-info.json";
const ID_PLACEHOLDER: &str = "@INSTANCE_ID@";
const IDENTITY_SECTION: &str = "\n[Instance]\ninstance-id=@INSTANCE_ID@\n";

pub struct InstanceMetadata {
    runtime_dir: PathBuf,
    info_file: PathBuf,
    removed: bool,
}

/// Parent of all per-instance runtime directories.
pub fn runtime_base_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".bolthole")
}

impl InstanceMetadata {
    /// Create the runtime directory and the populated metadata file under
    /// the default base.
    pub fn materialize(instance_id: &str, template: &Path) -> Result<Self> {
        Self::materialize_in(&runtime_base_dir(), instance_id, template)
    }

    /// As [`InstanceMetadata::materialize`], rooted at `base`.
    pub fn materialize_in(base: &Path, instance_id: &str, template: &Path) -> Result<Self> {
        let runtime_dir = base.join(instance_id);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&runtime_dir)?;

        let text = fs::read_to_string(template)?;
        let identity = IDENTITY_SECTION.replace(ID_PLACEHOLDER, instance_id);
        let info_file = runtime_dir.join(INFO_FILE_NAME);
        fs::write(&info_file, format!("{text}{identity}"))?;

        debug!("instance metadata materialized at {}", runtime_dir.display());
        Ok(Self {
            runtime_dir,
            info_file,
            removed: false,
        })
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn info_file(&self) -> &Path {
        &self.info_file
    }

    /// Bind-mount pairs and env values contributed to the sandbox host's
    /// argument vector.
    pub fn host_args(&self) -> Vec<String> {
        vec![
            "--bind".to_string(),
            self.runtime_dir.display().to_string(),
            RUNTIME_MOUNT_POINT.to_string(),
            "--ro-bind".to_string(),
            self.info_file.display().to_string(),
            INFO_MOUNT_POINT.to_string(),
            "--setenv".to_string(),
            RUNTIME_DIR_ENV.to_string(),
            RUNTIME_MOUNT_POINT.to_string(),
            "--setenv".to_string(),
            INFO_FILE_ENV.to_string(),
            INFO_MOUNT_POINT.to_string(),
        ]
    }

    /// Persist the raw info-channel record next to the metadata file.
    /// Best-effort: failures are logged, never escalated.
    pub fn persist_record(&self, raw: &[u8]) {
        if self.removed {
            return;
        }
        let sidecar = self.runtime_dir.join(SIDECAR_FILE_NAME);
        if let Err(e) = fs::write(&sidecar, raw) {
            warn!("cannot persist info record to {}: {e}", sidecar.display());
        }
    }

    /// Remove the whole runtime directory. Best-effort and idempotent.
    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        if let Err(e) = fs::remove_dir_all(&self.runtime_dir) {
            warn!(
                "cannot remove runtime directory {}: {e}",
                self.runtime_dir.display()
            );
        } else {
            debug!("removed runtime directory {}", self.runtime_dir.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("app-info.template");
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn materialize_copies_template_and_appends_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let tpl = template(tmp.path(), "[Application]\nname=org.example.App\n");
        let meta =
            InstanceMetadata::materialize_in(tmp.path(), "abc123", &tpl).unwrap();

        assert!(meta.runtime_dir().ends_with("abc123"));
        let text = fs::read_to_string(meta.info_file()).unwrap();
        assert!(text.starts_with("[Application]\nname=org.example.App\n"));
        assert!(text.contains("[Instance]\ninstance-id=abc123\n"));
        assert!(!text.contains(ID_PLACEHOLDER));
    }

    #[test]
    fn host_args_reference_both_mounts_and_env_values() {
        let tmp = tempfile::tempdir().unwrap();
        let tpl = template(tmp.path(), "x\n");
        let meta = InstanceMetadata::materialize_in(tmp.path(), "id1", &tpl).unwrap();
        let args = meta.host_args();
        assert_eq!(args.len(), 12);
        assert!(args.contains(&meta.runtime_dir().display().to_string()));
        assert!(args.contains(&meta.info_file().display().to_string()));
        assert!(args.contains(&RUNTIME_DIR_ENV.to_string()));
        assert!(args.contains(&INFO_FILE_ENV.to_string()));
    }

    #[test]
    fn persist_then_remove_cleans_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let tpl = template(tmp.path(), "x\n");
        let mut meta = InstanceMetadata::materialize_in(tmp.path(), "id2", &tpl).unwrap();
        let dir = meta.runtime_dir().to_path_buf();

        meta.persist_record(br#"{"child-pid": 7}"#);
        assert_eq!(
            fs::read(dir.join(SIDECAR_FILE_NAME)).unwrap(),
            br#"{"child-pid": 7}"#
        );

        meta.remove();
        assert!(!dir.exists());
        meta.remove(); // idempotent
        meta.persist_record(b"ignored after removal");
        assert!(!dir.exists());
    }

    #[test]
    fn missing_template_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.template");
        assert!(InstanceMetadata::materialize_in(tmp.path(), "id3", &missing).is_err());
    }
}
