//! JSON state documents shared between fleet processes.
//!
//! Every document is read and written whole. Writes go to a sibling temp file
//! that is renamed over the target, so concurrent readers see either the old
//! or the new document, never a torn one. Concurrent writers race with
//! last-writer-wins semantics.

use crate::error::FleetError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Load a JSON document. A missing file is `Ok(None)`.
pub fn load_state<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, FleetError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FleetError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| FleetError::StoreFormat {
            path: path.to_path_buf(),
            source,
        })
}

/// Load a JSON document, degrading to the default on any failure.
///
/// Read failures are logged and treated as "no data".
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match load_state(path) {
        Ok(Some(v)) => v,
        Ok(None) => T::default(),
        Err(e) => {
            tracing::warn!("{e}; treating as empty");
            T::default()
        }
    }
}

/// Load a document that is about to be rewritten.
///
/// Unlike [`load_or_default`], a malformed or unreadable document is an
/// error, so a read-modify-write never replaces existing data it could not
/// parse.
pub fn load_for_update<T: DeserializeOwned + Default>(path: &Path) -> Result<T, FleetError> {
    Ok(load_state(path)?.unwrap_or_default())
}

/// Atomically replace a JSON document.
pub fn save_state<T: Serialize>(path: &Path, value: &T) -> Result<(), FleetError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| FleetError::io(dir, e))?;
    }
    let tmp = tmp_path(path);
    let json = serde_json::to_string_pretty(value).map_err(|source| FleetError::StoreFormat {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(&tmp, json).map_err(|e| FleetError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        FleetError::io(path, e)
    })
}

/// Remove a document if present.
pub fn remove_state(path: &Path) -> Result<(), FleetError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FleetError::io(path, e)),
    }
}

// Unique per process and per write, so two writers never share a temp file.
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!("{name}.tmp.{}.{seq}", std::process::id()))
}
