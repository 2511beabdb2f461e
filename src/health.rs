//! Layered primary health checks.
//!
//! Checks run cheapest first and stop at the first unambiguous failure:
//! service unit, then process table, then the platform's `getMe`. A failed
//! service or process check means `down`; any API-level failure means
//! `degraded`, since the process may be alive but briefly unreachable.

use crate::channel::{ApiCheck, Gateway};
use crate::config::FleetConfig;
use crate::credential::{self, Credential};
use crate::error::FleetError;
use crate::identity::IdentityStore;
use crate::process::{ProbeOutcome, ProcessManager};
use crate::state::{load_state, remove_state, save_state};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Degraded,
    Down,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// The check that produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckLevel {
    Supervisor,
    Process,
    Api,
}

impl std::fmt::Display for CheckLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supervisor => write!(f, "supervisor"),
            Self::Process => write!(f, "process"),
            Self::Api => write!(f, "api"),
        }
    }
}

/// Result of one round of checks. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthAssessment {
    pub verdict: Verdict,
    pub level: CheckLevel,
    pub detail: String,
    pub checked_at: DateTime<Utc>,
}

impl HealthAssessment {
    pub fn new(verdict: Verdict, level: CheckLevel, detail: impl Into<String>) -> Self {
        Self {
            verdict,
            level,
            detail: detail.into(),
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.verdict == Verdict::Healthy
    }

    /// One-line summary, e.g. `down/supervisor: service imlerih_bot is inactive`.
    pub fn summary(&self) -> String {
        format!("{}/{}: {}", self.verdict, self.level, self.detail)
    }
}

/// The three checks against the current primary.
#[async_trait]
pub trait PrimaryProbe: Send + Sync {
    async fn supervisor_check(&self) -> ProbeOutcome;
    async fn process_check(&self) -> ProbeOutcome;
    async fn api_check(&self) -> ApiCheck;
}

/// Run the layered checks, short-circuiting on the first `down`.
///
/// An `Unknown` outcome (the check itself could not run) does not decide
/// anything; the next level is consulted.
pub async fn assess<P: PrimaryProbe + ?Sized>(probe: &P) -> HealthAssessment {
    match probe.supervisor_check().await {
        ProbeOutcome::Down(detail) => {
            return HealthAssessment::new(Verdict::Down, CheckLevel::Supervisor, detail);
        }
        ProbeOutcome::Unknown(detail) => {
            tracing::debug!("supervisor check inconclusive: {detail}");
        }
        ProbeOutcome::Up(_) => {}
    }

    match probe.process_check().await {
        ProbeOutcome::Down(detail) => {
            return HealthAssessment::new(Verdict::Down, CheckLevel::Process, detail);
        }
        ProbeOutcome::Unknown(detail) => {
            tracing::debug!("process check inconclusive: {detail}");
        }
        ProbeOutcome::Up(_) => {}
    }

    let api = probe.api_check().await;
    let verdict = if api.is_ok() {
        Verdict::Healthy
    } else {
        Verdict::Degraded
    };
    HealthAssessment::new(verdict, CheckLevel::Api, api.describe())
}

// ── Outage drill ─────────────────────────────────────────

/// Persisted marker for a simulated primary outage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillState {
    pub active: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub primary_credential_preview: Option<String>,
}

/// `drill.json`: while present and active, the supervisor check reports
/// the primary as down.
#[derive(Debug, Clone)]
pub struct Drill {
    path: PathBuf,
}

impl Drill {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn start(&self, primary: Option<&Credential>) -> Result<(), FleetError> {
        let state = DrillState {
            active: true,
            started_at: Utc::now(),
            primary_credential_preview: primary.map(Credential::preview),
        };
        save_state(&self.path, &state)
    }

    pub fn stop(&self) -> Result<(), FleetError> {
        remove_state(&self.path)
    }

    pub fn state(&self) -> Option<DrillState> {
        load_state::<DrillState>(&self.path)
            .ok()
            .flatten()
            .filter(|s| s.active)
    }
}

// ── Live probe ───────────────────────────────────────────

/// Where the primary lives and how it authenticates.
#[derive(Debug, Clone)]
pub struct PrimaryTarget {
    pub service: String,
    pub process_pattern: String,
    /// Statically configured primary credential, used until a promotion
    /// is recorded.
    pub static_credential: Option<Credential>,
}

/// Probe backed by real processes and the real gateway.
pub struct LivePrimaryProbe {
    processes: Arc<dyn ProcessManager>,
    gateway: Arc<dyn Gateway>,
    identity: IdentityStore,
    drill: Drill,
    target: PrimaryTarget,
    api_timeout: Duration,
}

impl LivePrimaryProbe {
    pub fn new(
        processes: Arc<dyn ProcessManager>,
        gateway: Arc<dyn Gateway>,
        identity: IdentityStore,
        drill: Drill,
        target: PrimaryTarget,
        api_timeout: Duration,
    ) -> Self {
        Self {
            processes,
            gateway,
            identity,
            drill,
            target,
            api_timeout,
        }
    }

    /// Probe the primary described by `config`.
    pub fn from_config(
        config: &FleetConfig,
        processes: Arc<dyn ProcessManager>,
        gateway: Arc<dyn Gateway>,
    ) -> Self {
        Self::new(
            processes,
            gateway,
            IdentityStore::new(config.identity_path()),
            Drill::new(config.drill_path()),
            PrimaryTarget {
                service: config.primary.service.clone(),
                process_pattern: config.primary.process_pattern.clone(),
                static_credential: load_static_primary(config.primary.credential_file.as_deref()),
            },
            config.monitor.api_timeout(),
        )
    }

    pub fn static_primary(&self) -> Option<&Credential> {
        self.target.static_credential.as_ref()
    }

    /// The credential currently acting as primary.
    pub fn primary_credential(&self) -> Option<Credential> {
        self.identity
            .current_primary(self.target.static_credential.as_ref())
    }
}

#[async_trait]
impl PrimaryProbe for LivePrimaryProbe {
    async fn supervisor_check(&self) -> ProbeOutcome {
        if let Some(drill) = self.drill.state() {
            return ProbeOutcome::Down(format!(
                "outage drill in progress since {}",
                drill.started_at.format("%H:%M:%S")
            ));
        }
        self.processes.service_state(&self.target.service).await
    }

    async fn process_check(&self) -> ProbeOutcome {
        self.processes
            .find_process(&self.target.process_pattern)
            .await
    }

    async fn api_check(&self) -> ApiCheck {
        match self.primary_credential() {
            Some(credential) => self.gateway.who_am_i(&credential, self.api_timeout).await,
            None => ApiCheck::ApiError("primary credential is not configured".into()),
        }
    }
}

/// Read the statically configured primary credential, if any.
pub fn load_static_primary(path: Option<&std::path::Path>) -> Option<Credential> {
    let path = path?;
    match credential::read_credential_file(path) {
        Ok(Some(raw)) => match Credential::parse(&raw) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!("primary credential in {}: {e}", path.display());
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            tracing::warn!("{e}");
            None
        }
    }
}
