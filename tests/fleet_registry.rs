//! Fleet registry, lineage and backup documents as seen by several
//! processes sharing one state directory.

use chrono::{DateTime, Utc};
use understudy::fleet::{BackupList, FleetEntry, FleetRegistry, FleetStatus, Lineage};

fn entry(id: &str, pid: u32, launched_at: DateTime<Utc>) -> FleetEntry {
    FleetEntry {
        clone_id: id.into(),
        pid,
        credential_preview: "123456:AAA...".into(),
        launched_at,
        status: FleetStatus::Running,
        owner: Some("42:OOOOOOO...".into()),
        instance_dir: None,
    }
}

#[test]
fn lineage_deduplicates_repeated_launch() {
    let dir = tempfile::tempdir().unwrap();
    let lineage = Lineage::new(dir.path().join("lineage.json"));

    assert!(lineage.record_launch("ownerA", "cloneX").unwrap());
    assert!(!lineage.record_launch("ownerA", "cloneX").unwrap());

    let reopened = Lineage::new(dir.path().join("lineage.json"));
    assert_eq!(reopened.spawned_by("ownerA"), vec!["cloneX"]);
    assert!(reopened.has_spawned("ownerA"));
    assert!(!reopened.has_spawned("ownerB"));
}

#[test]
fn lineage_file_uses_plain_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lineage.json");
    let lineage = Lineage::new(&path);
    lineage.record_launch("ownerA", "cloneX").unwrap();
    lineage.record_launch("ownerA", "cloneY").unwrap();

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(doc, serde_json::json!({"ownerA": ["cloneX", "cloneY"]}));
}

#[test]
fn registry_entries_survive_and_keep_stopped_processes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("processes.json");
    let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

    let writer = FleetRegistry::new(&path);
    writer.record_process(entry("clone_b", 11, t0 + chrono::Duration::seconds(5))).unwrap();
    writer.record_process(entry("clone_a", 10, t0)).unwrap();
    writer
        .update_statuses(&[("clone_a".into(), FleetStatus::Stopped)])
        .unwrap();

    let reader = FleetRegistry::new(&path);
    let entries = reader.entries();
    let ids: Vec<&str> = entries.iter().map(|e| e.clone_id.as_str()).collect();
    assert_eq!(ids, ["clone_a", "clone_b"]);
    assert_eq!(entries[0].status, FleetStatus::Stopped);

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(doc["clone_b"]["pid"], 11);
    assert_eq!(doc["clone_b"]["token_preview"], "123456:AAA...");
    assert_eq!(doc["clone_b"]["status"], "running");
    assert!(doc["clone_b"].get("clone_id").is_none());
}

#[test]
fn backups_are_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let backups = BackupList::new(dir.path().join("backups.json"));
    assert!(!backups.has_backups());
    assert!(backups.add("777:abc").unwrap());
    assert!(!backups.add("777:abc").unwrap());
    assert_eq!(backups.list(), vec!["777:abc"]);
}

#[test]
fn malformed_lineage_is_never_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lineage.json");
    let lineage = Lineage::new(&path);
    lineage.record_launch("ownerA", "cloneX").unwrap();
    lineage.record_launch("ownerB", "cloneY").unwrap();

    let damaged = std::fs::read_to_string(&path).unwrap().replace("\"cloneY\"", "\"cloneY\",");
    std::fs::write(&path, &damaged).unwrap();

    let err = lineage.record_launch("ownerC", "cloneZ").unwrap_err();
    assert!(matches!(err, understudy::FleetError::StoreFormat { .. }));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), damaged);
    // Reads still degrade to empty.
    assert!(lineage.spawned_by("ownerA").is_empty());
}

#[test]
fn malformed_registry_and_backups_reject_writes() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = dir.path().join("processes.json");
    let backups_path = dir.path().join("backups.json");
    std::fs::write(&registry_path, "{\"clone_a\": {").unwrap();
    std::fs::write(&backups_path, "[\"777:abc\",]").unwrap();

    let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    let registry = FleetRegistry::new(&registry_path);
    assert!(registry.record_process(entry("clone_b", 11, t0)).is_err());
    assert!(
        registry
            .update_statuses(&[("clone_a".into(), FleetStatus::Stopped)])
            .is_err()
    );
    assert_eq!(std::fs::read_to_string(&registry_path).unwrap(), "{\"clone_a\": {");
    assert!(registry.entries().is_empty());

    let backups = BackupList::new(&backups_path);
    assert!(backups.add("888:def").is_err());
    assert_eq!(std::fs::read_to_string(&backups_path).unwrap(), "[\"777:abc\",]");
}
