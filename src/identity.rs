//! The identity record: the single authoritative answer to "who is primary".
//!
//! Persisted as `identity.json` with the field names the fleet has always
//! used (`is_main`, `promoted_token`, `promoted_at`, `original_main_token`).
//! Only promotion writes it; every process reads it at startup.

use crate::credential::Credential;
use crate::error::FleetError;
use crate::state::{load_state, save_state};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The persisted primary identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(rename = "is_main")]
    pub is_primary: bool,

    /// Credential of the current primary. Shape-validated on load, so a
    /// record with `is_primary == true` always carries a usable credential.
    #[serde(rename = "promoted_token")]
    pub active_credential: Credential,

    #[serde(default)]
    pub promoted_at: Option<DateTime<Utc>>,

    #[serde(
        rename = "original_main_token",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub predecessor_credential: Option<Credential>,
}

impl IdentityRecord {
    /// Record for `credential` taking over from `predecessor` now.
    pub fn promoted(credential: Credential, predecessor: Option<Credential>) -> Self {
        Self {
            is_primary: true,
            active_credential: credential,
            promoted_at: Some(Utc::now()),
            predecessor_credential: predecessor,
        }
    }

    /// Whether this record names `credential` as the primary.
    pub fn names_primary(&self, credential: &Credential) -> bool {
        self.is_primary && self.active_credential == *credential
    }
}

/// File-backed access to the identity record.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record, surfacing I/O and format errors.
    pub fn try_read(&self) -> Result<Option<IdentityRecord>, FleetError> {
        load_state(&self.path)
    }

    /// Read the record. `None` means no promotion has happened (or the
    /// document is unreadable, which is logged and treated the same).
    pub fn read(&self) -> Option<IdentityRecord> {
        match self.try_read() {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("{e}; assuming no promotion has occurred");
                None
            }
        }
    }

    /// Atomically replace the record.
    pub fn write(&self, record: &IdentityRecord) -> Result<(), FleetError> {
        save_state(&self.path, record)
    }

    /// The credential currently acting as primary: the promoted one if a
    /// promotion happened, else the statically configured one.
    pub fn current_primary(&self, static_primary: Option<&Credential>) -> Option<Credential> {
        match self.read() {
            Some(record) if record.is_primary => Some(record.active_credential),
            _ => static_primary.cloned(),
        }
    }
}

/// Whether this process serves as primary or waits as a standby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Standby,
}

impl Role {
    /// Decide the role of a process holding `mine`.
    ///
    /// Only the identity record answers this. With no promotion recorded,
    /// the primary seat (the unmanaged `run` entry point) is primary and
    /// every launched instance is a standby.
    pub fn determine(record: Option<&IdentityRecord>, mine: &Credential, primary_seat: bool) -> Self {
        match record {
            Some(r) if r.is_primary => {
                if r.active_credential == *mine {
                    Self::Primary
                } else {
                    Self::Standby
                }
            }
            _ if primary_seat => Self::Primary,
            _ => Self::Standby,
        }
    }

    pub fn is_primary(self) -> bool {
        self == Self::Primary
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Standby => write!(f, "standby"),
        }
    }
}
