//! Error taxonomy for the failover core.
//!
//! Library code returns [`FleetError`]; the CLI and the bot runner wrap it in
//! `color_eyre` reports. Health-check failures and promotion races are not
//! errors: they are values of [`crate::channel::ApiCheck`] and
//! [`crate::promotion::PromotionOutcome`].

use std::path::PathBuf;

/// Generic text shown to chat users when an internal store fails.
pub const GENERIC_FAILURE: &str = "Something went wrong on our side. Please try again later.";

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("invalid credential: {reason}")]
    InvalidCredential { reason: &'static str },

    #[error("no credential could be resolved (checked identity record, {env}, credential file, {dir})")]
    CredentialUnresolved { env: &'static str, dir: PathBuf },

    #[error("failed to access {}: {source}", path.display())]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed state document {}: {source}", path.display())]
    StoreFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("launch of {clone_id} failed: {reason}")]
    LaunchFailure {
        clone_id: String,
        reason: String,
        output_tail: String,
    },

    #[error("launch of {clone_id} (pid {pid}) did not settle within {timeout_secs}s")]
    LaunchTimeout {
        clone_id: String,
        pid: u32,
        timeout_secs: u64,
    },

    #[error("unknown clone {0}")]
    UnknownClone(String),
}

impl FleetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StoreIo {
            path: path.into(),
            source,
        }
    }

    /// Text safe to send back to the chat user who triggered the failure.
    ///
    /// Store errors are replaced by [`GENERIC_FAILURE`]; their detail only
    /// goes to the log.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidCredential { reason } => format!("Invalid credential: {reason}."),
            Self::LaunchFailure {
                reason,
                output_tail,
                ..
            } => {
                if output_tail.is_empty() {
                    format!("Launch failed: {reason}")
                } else {
                    format!("Launch failed: {reason}\n\nLast output:\n{output_tail}")
                }
            }
            Self::LaunchTimeout { timeout_secs, .. } => {
                format!("The new standby did not report ready within {timeout_secs}s.")
            }
            Self::UnknownClone(id) => format!("No clone named {id}."),
            Self::CredentialUnresolved { .. } | Self::StoreIo { .. } | Self::StoreFormat { .. } => {
                GENERIC_FAILURE.to_owned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_hide_detail_from_users() {
        let err = FleetError::io(
            "/var/lib/understudy/identity.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.user_message(), GENERIC_FAILURE);
        assert!(err.to_string().contains("identity.json"));
    }

    #[test]
    fn launch_failure_includes_output_tail() {
        let err = FleetError::LaunchFailure {
            clone_id: "clone_1_ab".into(),
            reason: "process exited".into(),
            output_tail: "panicked at main.rs".into(),
        };
        let msg = err.user_message();
        assert!(msg.contains("process exited"));
        assert!(msg.contains("panicked at main.rs"));
    }
}
