//! Fleet registry, lineage, and backup-credential list.
//!
//! All three are append-only or upsert-by-key JSON documents under the state
//! directory. Nothing is ever purged: entries for dead processes stay and are
//! marked `stopped` when next read, so readers must tolerate a registry that
//! grows slowly and carries stale pids.

use crate::error::FleetError;
use crate::state::{load_for_update, load_or_default, save_state};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetStatus {
    Running,
    Stopped,
    Unknown,
}

impl std::fmt::Display for FleetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One launched bot process.
///
/// `status` is a cache: it is recomputed from pid liveness on every listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetEntry {
    #[serde(skip)]
    pub clone_id: String,
    pub pid: u32,
    #[serde(rename = "token_preview")]
    pub credential_preview: String,
    #[serde(rename = "start_time")]
    pub launched_at: DateTime<Utc>,
    pub status: FleetStatus,
    /// Preview of the credential of the process that launched this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_dir: Option<PathBuf>,
}

/// `processes.json`: clone id → entry.
#[derive(Debug, Clone)]
pub struct FleetRegistry {
    path: PathBuf,
}

impl FleetRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> BTreeMap<String, FleetEntry> {
        with_ids(load_or_default(&self.path))
    }

    fn load_strict(&self) -> Result<BTreeMap<String, FleetEntry>, FleetError> {
        load_for_update(&self.path).map(with_ids)
    }

    /// Insert or replace the entry keyed by `entry.clone_id`.
    ///
    /// Fails without writing if the existing registry cannot be parsed.
    pub fn record_process(&self, entry: FleetEntry) -> Result<(), FleetError> {
        let mut map = self.load_strict()?;
        map.insert(entry.clone_id.clone(), entry);
        save_state(&self.path, &map)
    }

    pub fn get(&self, clone_id: &str) -> Option<FleetEntry> {
        self.load().remove(clone_id)
    }

    /// All entries, oldest launch first, with persisted (possibly stale) status.
    pub fn entries(&self) -> Vec<FleetEntry> {
        let mut entries: Vec<FleetEntry> = self.load().into_values().collect();
        entries.sort_by_key(|e| e.launched_at);
        entries
    }

    /// Persist new statuses for the given clones. Unknown ids are ignored.
    pub fn update_statuses(&self, updates: &[(String, FleetStatus)]) -> Result<(), FleetError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut map = self.load_strict()?;
        let mut changed = false;
        for (id, status) in updates {
            if let Some(entry) = map.get_mut(id)
                && entry.status != *status
            {
                entry.status = *status;
                changed = true;
            }
        }
        if changed {
            save_state(&self.path, &map)?;
        }
        Ok(())
    }
}

fn with_ids(mut map: BTreeMap<String, FleetEntry>) -> BTreeMap<String, FleetEntry> {
    for (id, entry) in map.iter_mut() {
        entry.clone_id.clone_from(id);
    }
    map
}

/// `lineage.json`: owner credential → credentials it launched.
#[derive(Debug, Clone)]
pub struct Lineage {
    path: PathBuf,
}

impl Lineage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Record that `owner` launched `spawned`. Returns false if the pair was
    /// already recorded (the file is left untouched). An unparseable file is
    /// an error and is never overwritten.
    pub fn record_launch(&self, owner: &str, spawned: &str) -> Result<bool, FleetError> {
        let mut map: BTreeMap<String, Vec<String>> = load_for_update(&self.path)?;
        let children = map.entry(owner.to_owned()).or_default();
        if children.iter().any(|c| c == spawned) {
            return Ok(false);
        }
        children.push(spawned.to_owned());
        save_state(&self.path, &map)?;
        Ok(true)
    }

    pub fn spawned_by(&self, owner: &str) -> Vec<String> {
        let mut map: BTreeMap<String, Vec<String>> = load_or_default(&self.path);
        map.remove(owner).unwrap_or_default()
    }

    /// Whether `owner` has launched any standby.
    pub fn has_spawned(&self, owner: &str) -> bool {
        !self.spawned_by(owner).is_empty()
    }
}

/// `backups.json`: every credential ever launched as a standby.
#[derive(Debug, Clone)]
pub struct BackupList {
    path: PathBuf,
}

impl BackupList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append a credential unless already present.
    pub fn add(&self, credential: &str) -> Result<bool, FleetError> {
        let mut list: Vec<String> = load_for_update(&self.path)?;
        if list.iter().any(|c| c == credential) {
            return Ok(false);
        }
        list.push(credential.to_owned());
        save_state(&self.path, &list)?;
        Ok(true)
    }

    pub fn list(&self) -> Vec<String> {
        load_or_default(&self.path)
    }

    pub fn has_backups(&self) -> bool {
        !self.list().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, pid: u32, secs: i64) -> FleetEntry {
        FleetEntry {
            clone_id: id.into(),
            pid,
            credential_preview: "123456:AAA...".into(),
            launched_at: DateTime::from_timestamp(secs, 0).unwrap(),
            status: FleetStatus::Running,
            owner: None,
            instance_dir: None,
        }
    }

    #[test]
    fn registry_upserts_by_clone_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FleetRegistry::new(dir.path().join("processes.json"));
        registry.record_process(entry("clone_b", 20, 200)).unwrap();
        registry.record_process(entry("clone_a", 10, 100)).unwrap();
        registry.record_process(entry("clone_b", 21, 300)).unwrap();

        let entries = registry.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].clone_id, "clone_a");
        assert_eq!(entries[1].clone_id, "clone_b");
        assert_eq!(entries[1].pid, 21);
    }

    #[test]
    fn registry_file_uses_flat_map_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processes.json");
        FleetRegistry::new(&path)
            .record_process(entry("clone_a", 10, 100))
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["clone_a"]["pid"], 10);
        assert_eq!(json["clone_a"]["status"], "running");
        assert_eq!(json["clone_a"]["token_preview"], "123456:AAA...");
        assert!(json["clone_a"]["start_time"].is_string());
    }

    #[test]
    fn update_statuses_marks_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FleetRegistry::new(dir.path().join("processes.json"));
        registry.record_process(entry("clone_a", 10, 100)).unwrap();
        registry
            .update_statuses(&[
                ("clone_a".into(), FleetStatus::Stopped),
                ("ghost".into(), FleetStatus::Stopped),
            ])
            .unwrap();
        assert_eq!(
            registry.get("clone_a").unwrap().status,
            FleetStatus::Stopped
        );
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn lineage_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let lineage = Lineage::new(dir.path().join("lineage.json"));
        assert!(!lineage.has_spawned("ownerA"));
        assert!(lineage.record_launch("ownerA", "cloneX").unwrap());
        assert!(!lineage.record_launch("ownerA", "cloneX").unwrap());
        assert!(lineage.record_launch("ownerA", "cloneY").unwrap());
        assert_eq!(lineage.spawned_by("ownerA"), vec!["cloneX", "cloneY"]);
        assert!(lineage.has_spawned("ownerA"));
        assert!(!lineage.has_spawned("ownerB"));
    }

    #[test]
    fn backups_deduplicate() {
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupList::new(dir.path().join("backups.json"));
        assert!(!backups.has_backups());
        assert!(backups.add("a").unwrap());
        assert!(!backups.add("a").unwrap());
        assert_eq!(backups.list(), vec!["a"]);
    }
}
