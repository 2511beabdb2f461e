//! Bot credentials: shape validation, redacted display, and startup resolution.
//!
//! A credential is the bearer token a bot presents to the messaging platform:
//! a numeric bot id, a colon, and a 30-50 character secret drawn from
//! `[A-Za-z0-9_-]`. Only [`Credential::preview`] is ever printed.

use crate::error::FleetError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable holding an explicit credential.
pub const CREDENTIAL_ENV: &str = "UNDERSTUDY_CREDENTIAL";

/// Environment variable holding the path of a credential file.
pub const CREDENTIAL_FILE_ENV: &str = "UNDERSTUDY_CREDENTIAL_FILE";

/// Extension of credential files picked up by the directory scan.
pub const CREDENTIAL_EXT: &str = "credential";

const PREVIEW_LEN: usize = 10;
const SECRET_MIN: usize = 30;
const SECRET_MAX: usize = 50;

/// Returns true iff `raw` has the shape `^\d+:[A-Za-z0-9_-]{30,50}$`.
pub fn is_valid_credential(raw: &str) -> bool {
    shape_error(raw).is_none()
}

fn shape_error(raw: &str) -> Option<&'static str> {
    let Some((id, secret)) = raw.split_once(':') else {
        return Some("missing ':' separator");
    };
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Some("bot id must be numeric");
    }
    if secret.len() < SECRET_MIN {
        return Some("secret is too short");
    }
    if secret.len() > SECRET_MAX {
        return Some("secret is too long");
    }
    if !secret
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Some("secret contains invalid characters");
    }
    None
}

/// A shape-validated bot credential.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Credential(String);

impl Credential {
    /// Validate and wrap a raw credential string (surrounding whitespace is
    /// ignored).
    pub fn parse(raw: &str) -> Result<Self, FleetError> {
        let trimmed = raw.trim();
        match shape_error(trimmed) {
            None => Ok(Self(trimmed.to_owned())),
            Some(reason) => Err(FleetError::InvalidCredential { reason }),
        }
    }

    /// The raw secret, for the wire and for credential files only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Numeric bot id segment.
    pub fn bot_id(&self) -> &str {
        self.0.split_once(':').map_or("", |(id, _)| id)
    }

    /// First characters of the credential followed by an ellipsis.
    pub fn preview(&self) -> String {
        preview(&self.0)
    }
}

/// Short preview of an arbitrary (possibly invalid) credential string.
pub fn preview(raw: &str) -> String {
    let head: String = raw.chars().take(PREVIEW_LEN).collect();
    format!("{head}...")
}

impl TryFrom<String> for Credential {
    type Error = FleetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Credential> for String {
    fn from(value: Credential) -> Self {
        value.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.preview()).finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.preview())
    }
}

/// Where the startup credential came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// The identity record names this seat's promoted credential.
    Promotion,
    /// `UNDERSTUDY_CREDENTIAL` or an equivalent explicit value.
    Explicit,
    /// A configured credential file.
    File(PathBuf),
    /// First `*.credential` file found in the scan directory.
    Scan(PathBuf),
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Promotion => write!(f, "identity record"),
            Self::Explicit => write!(f, "{CREDENTIAL_ENV}"),
            Self::File(p) => write!(f, "file {}", p.display()),
            Self::Scan(p) => write!(f, "scanned file {}", p.display()),
        }
    }
}

/// Inputs to startup resolution, in priority order.
#[derive(Debug, Default, Clone)]
pub struct CredentialSources {
    pub promoted: Option<Credential>,
    pub explicit: Option<String>,
    pub file: Option<PathBuf>,
    pub scan_dir: Option<PathBuf>,
}

impl CredentialSources {
    /// Fill the explicit and file sources from the process environment,
    /// keeping any value already set.
    pub fn with_env(mut self) -> Self {
        if self.explicit.is_none() {
            self.explicit = std::env::var(CREDENTIAL_ENV).ok();
        }
        if self.file.is_none() {
            self.file = std::env::var_os(CREDENTIAL_FILE_ENV).map(PathBuf::from);
        }
        self
    }
}

/// A credential together with the source that supplied it.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub credential: Credential,
    pub source: CredentialSource,
}

/// Resolve the credential a process should start with. First match wins:
/// promotion, explicit value, credential file, directory scan.
///
/// A source that yields a malformed credential is an error rather than a
/// reason to fall through to the next one.
pub fn resolve(sources: &CredentialSources) -> Result<Resolved, FleetError> {
    if let Some(credential) = &sources.promoted {
        return Ok(Resolved {
            credential: credential.clone(),
            source: CredentialSource::Promotion,
        });
    }

    if let Some(raw) = sources.explicit.as_deref().filter(|s| !s.trim().is_empty()) {
        return Ok(Resolved {
            credential: Credential::parse(raw)?,
            source: CredentialSource::Explicit,
        });
    }

    if let Some(path) = &sources.file {
        match read_credential_file(path) {
            Ok(Some(raw)) => {
                return Ok(Resolved {
                    credential: Credential::parse(&raw)?,
                    source: CredentialSource::File(path.clone()),
                });
            }
            Ok(None) => tracing::warn!("credential file {} is empty", path.display()),
            Err(e) => tracing::warn!("{e}"),
        }
    }

    if let Some(dir) = &sources.scan_dir
        && let Some((path, raw)) = scan_dir(dir)
    {
        return Ok(Resolved {
            credential: Credential::parse(&raw)?,
            source: CredentialSource::Scan(path),
        });
    }

    Err(FleetError::CredentialUnresolved {
        env: CREDENTIAL_ENV,
        dir: sources.scan_dir.clone().unwrap_or_default(),
    })
}

/// Read a credential file, returning `None` when it is blank.
pub fn read_credential_file(path: &Path) -> Result<Option<String>, FleetError> {
    let raw = std::fs::read_to_string(path).map_err(|e| FleetError::io(path, e))?;
    let trimmed = raw.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_owned()))
}

/// Write a credential file readable only by the owner.
///
/// The file is created with mode 0600 under a temp name and renamed into
/// place, so the secret is never readable by others and readers never see
/// a truncated file.
pub fn write_credential_file(path: &Path, credential: &Credential) -> Result<(), FleetError> {
    use std::io::Write;

    let tmp = crate::state::tmp_path(path);
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let written = options
        .open(&tmp)
        .and_then(|mut file| {
            file.write_all(credential.expose().as_bytes())?;
            file.sync_all()
        })
        .and_then(|()| std::fs::rename(&tmp, path));
    written.map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        FleetError::io(path, e)
    })
}

fn scan_dir(dir: &Path) -> Option<(PathBuf, String)> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == CREDENTIAL_EXT))
        .collect();
    candidates.sort();

    candidates.into_iter().find_map(|path| match read_credential_file(&path) {
        Ok(Some(raw)) => Some((path, raw)),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!("{e}");
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "123456:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    #[test]
    fn accepts_typical_credential() {
        assert!(is_valid_credential(VALID));
        assert!(is_valid_credential(
            "7000000000:AAH-x_yz0123456789abcdefghijKLMNOPQR"
        ));
    }

    #[test]
    fn rejects_malformed_credentials() {
        assert!(!is_valid_credential("abc:xyz"));
        assert!(!is_valid_credential("123456:short"));
        assert!(!is_valid_credential(""));
        assert!(!is_valid_credential("123456AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"));
        assert!(!is_valid_credential(":AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"));
        assert!(!is_valid_credential("12a456:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"));
        assert!(!is_valid_credential("123456:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA!A"));
        assert!(!is_valid_credential(&format!("1:{}", "A".repeat(51))));
    }

    #[test]
    fn secret_length_bounds_are_inclusive() {
        assert!(is_valid_credential(&format!("1:{}", "A".repeat(30))));
        assert!(!is_valid_credential(&format!("1:{}", "A".repeat(29))));
        assert!(is_valid_credential(&format!("1:{}", "A".repeat(50))));
    }

    #[test]
    fn parse_trims_whitespace() {
        let c = Credential::parse(&format!("  {VALID}\n")).unwrap();
        assert_eq!(c.expose(), VALID);
        assert_eq!(c.bot_id(), "123456");
    }

    #[test]
    fn debug_and_display_only_show_preview() {
        let c = Credential::parse(VALID).unwrap();
        assert_eq!(c.to_string(), "123456:AAA...");
        let debug = format!("{c:?}");
        assert!(!debug.contains(VALID));
        assert!(debug.contains("123456:AAA..."));
    }

    #[test]
    fn serde_rejects_invalid_shape() {
        let ok: Credential = serde_json::from_str(&format!("\"{VALID}\"")).unwrap();
        assert_eq!(ok.expose(), VALID);
        assert!(serde_json::from_str::<Credential>("\"abc:xyz\"").is_err());
    }

    #[test]
    fn resolution_prefers_promotion() {
        let promoted = Credential::parse(&format!("42:{}", "B".repeat(35))).unwrap();
        let sources = CredentialSources {
            promoted: Some(promoted.clone()),
            explicit: Some(VALID.into()),
            ..Default::default()
        };
        let resolved = resolve(&sources).unwrap();
        assert_eq!(resolved.credential, promoted);
        assert_eq!(resolved.source, CredentialSource::Promotion);
    }

    #[test]
    fn resolution_rejects_invalid_explicit_value() {
        let sources = CredentialSources {
            explicit: Some("abc:xyz".into()),
            ..Default::default()
        };
        assert!(matches!(
            resolve(&sources),
            Err(FleetError::InvalidCredential { .. })
        ));
    }

    #[test]
    fn resolution_falls_back_to_file_then_scan() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("primary.txt");
        std::fs::write(&file, format!("{VALID}\n")).unwrap();

        let sources = CredentialSources {
            explicit: Some("   ".into()),
            file: Some(file.clone()),
            scan_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let resolved = resolve(&sources).unwrap();
        assert_eq!(resolved.source, CredentialSource::File(file));

        let scan_dir = dir.path().join("creds");
        std::fs::create_dir_all(&scan_dir).unwrap();
        std::fs::write(scan_dir.join("notes.txt"), "ignored").unwrap();
        std::fs::write(scan_dir.join("b.credential"), VALID).unwrap();
        std::fs::write(scan_dir.join("a.credential"), "").unwrap();

        let sources = CredentialSources {
            file: Some(dir.path().join("missing.txt")),
            scan_dir: Some(scan_dir.clone()),
            ..Default::default()
        };
        let resolved = resolve(&sources).unwrap();
        assert_eq!(
            resolved.source,
            CredentialSource::Scan(scan_dir.join("b.credential"))
        );
    }

    #[test]
    fn resolution_fails_when_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let sources = CredentialSources {
            scan_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(
            resolve(&sources),
            Err(FleetError::CredentialUnresolved { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn credential_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.credential");
        write_credential_file(&path, &Credential::parse(VALID).unwrap()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(read_credential_file(&path).unwrap().as_deref(), Some(VALID));
    }

    #[cfg(unix)]
    #[test]
    fn rewrite_replaces_open_file_and_leaves_no_temp() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.txt");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_credential_file(&path, &Credential::parse(VALID).unwrap()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(read_credential_file(&path).unwrap().as_deref(), Some(VALID));

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["legacy.txt"]);
    }
}
