//! On-disk layout of one launched instance.
//!
//! ```text
//! <clones_dir>/<clone_id>/
//!   bot.credential      secret, mode 0600
//!   instance.toml       manifest read by `understudy run --instance`
//!   logs/bot.log        stdout + stderr of the process
//! ```
//!
//! Every instance is described by the same manifest, serialized with
//! `toml` rather than assembled by hand, so paths and ids never need
//! escaping.

use crate::credential::{self, Credential};
use crate::error::FleetError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "instance.toml";
pub const CREDENTIAL_FILE: &str = "bot.credential";
pub const LOG_FILE: &str = "bot.log";

/// Behavior switches for a launched instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceFeatures {
    /// Run the health monitor while standing by.
    pub monitor: bool,
    /// Answer admin commands (/fleet, /clone, /drill).
    pub admin_commands: bool,
}

impl Default for InstanceFeatures {
    fn default() -> Self {
        Self {
            monitor: true,
            admin_commands: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceManifest {
    pub clone_id: String,
    pub credential_file: PathBuf,
    pub log_file: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub features: InstanceFeatures,
}

impl InstanceManifest {
    pub fn dir(&self) -> Option<&Path> {
        self.credential_file.parent()
    }

    /// Load `<dir>/instance.toml`.
    pub fn load(dir: &Path) -> color_eyre::Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| color_eyre::eyre::eyre!("failed to read {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| color_eyre::eyre::eyre!("failed to parse {}: {e}", path.display()))
    }

    /// The credential stored beside the manifest.
    pub fn credential(&self) -> Result<Credential, FleetError> {
        match credential::read_credential_file(&self.credential_file)? {
            Some(raw) => Credential::parse(&raw),
            None => Err(FleetError::InvalidCredential {
                reason: "credential file is empty",
            }),
        }
    }
}

/// Render the manifest text for an instance.
pub fn render_manifest(manifest: &InstanceManifest) -> String {
    // Serializing plain strings, paths and a timestamp cannot fail.
    toml::to_string_pretty(manifest).unwrap_or_default()
}

/// Create the instance directory with its credential, log file and
/// manifest.
pub fn materialize(
    clones_dir: &Path,
    clone_id: &str,
    credential: &Credential,
    features: InstanceFeatures,
) -> Result<InstanceManifest, FleetError> {
    let dir = clones_dir.join(clone_id);
    let logs = dir.join("logs");
    std::fs::create_dir_all(&logs).map_err(|e| FleetError::io(&logs, e))?;

    let credential_file = dir.join(CREDENTIAL_FILE);
    credential::write_credential_file(&credential_file, credential)?;

    let log_file = logs.join(LOG_FILE);
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .map_err(|e| FleetError::io(&log_file, e))?;

    let manifest = InstanceManifest {
        clone_id: clone_id.to_owned(),
        credential_file,
        log_file,
        created_at: Utc::now(),
        features,
    };
    let path = dir.join(MANIFEST_FILE);
    std::fs::write(&path, render_manifest(&manifest)).map_err(|e| FleetError::io(&path, e))?;
    Ok(manifest)
}

/// Last `lines` lines of `path`, or an empty string if unreadable.
pub fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialized_instance_round_trips_through_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let cred = Credential::parse(&format!("42:{}", "x".repeat(32))).unwrap();
        let manifest =
            materialize(dir.path(), "clone_1_deadbeef", &cred, InstanceFeatures::default())
                .unwrap();

        let loaded = InstanceManifest::load(&dir.path().join("clone_1_deadbeef")).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.credential().unwrap(), cred);
        assert!(loaded.log_file.exists());
    }

    #[test]
    fn manifest_survives_awkward_paths() {
        let dir = tempfile::tempdir().unwrap();
        let awkward = dir.path().join("dir with \"quotes\" {braces}");
        let cred = Credential::parse(&format!("42:{}", "y".repeat(32))).unwrap();
        materialize(&awkward, "clone_2_cafe", &cred, InstanceFeatures::default()).unwrap();
        let loaded = InstanceManifest::load(&awkward.join("clone_2_cafe")).unwrap();
        assert_eq!(loaded.dir(), Some(awkward.join("clone_2_cafe").as_path()));
    }

    #[test]
    fn tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.log");
        let text: Vec<String> = (1..=30).map(|i| format!("line {i}")).collect();
        std::fs::write(&path, text.join("\n")).unwrap();
        let tail = log_tail(&path, 3);
        assert_eq!(tail, "line 28\nline 29\nline 30");
        assert_eq!(log_tail(&dir.path().join("nope"), 3), "");
    }
}
