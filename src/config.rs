//! Fleet configuration loaded from `understudy.toml`.
//!
//! Every field has a default so a standby can start with no file at all.

use color_eyre::eyre::{Result, eyre};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "understudy.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    /// Directory holding the shared state documents and clone instances.
    pub state_dir: PathBuf,

    /// Credential file for the primary seat (resolution step 3).
    pub credential_file: Option<PathBuf>,

    /// Directory scanned for `*.credential` files (resolution step 4).
    /// Defaults to `<state_dir>/credentials`.
    pub credentials_dir: Option<PathBuf>,

    /// Users allowed to run admin commands. Empty disables admin commands.
    pub admin_user_ids: Vec<i64>,

    /// Chats that receive "primary is down" alerts. Empty = the admins'
    /// private chats.
    pub alert_chat_ids: Vec<i64>,

    pub primary: PrimaryConfig,
    pub monitor: MonitorConfig,
    pub launch: LaunchConfig,
    pub telegram: TelegramConfig,
    pub pending: PendingConfig,
}

pub const DEFAULT_PROCESS_PATTERN: &str = "understudy( (-c|--config) [^ ]+)? run$";

/// How to find and judge the primary process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrimaryConfig {
    /// Service unit that runs the primary (`systemctl is-active <service>`).
    pub service: String,

    /// Extended regex for the primary's command line (`pgrep -f <pattern>`).
    ///
    /// The default matches the primary seat started as `understudy run` or
    /// `understudy -c <path> run`, and not launched instances, whose command
    /// line ends in `run --instance <dir>`.
    pub process_pattern: String,

    /// Statically configured primary credential. Also the legacy file that
    /// promotion mirrors the new credential into.
    pub credential_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    /// Consecutive non-healthy cycles before operators are alerted.
    pub failure_threshold: u32,
    pub api_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    /// Wait after spawning before sampling liveness.
    pub probe_delay_secs: u64,
    /// Hard upper bound on the whole launch wait.
    pub timeout_secs: u64,
    /// Program to launch for new instances. Defaults to this executable.
    pub program: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelegramConfig {
    pub api_base: String,
    pub poll_timeout_secs: u64,
}

/// Bounds for the per-user "waiting for a credential" cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PendingConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".understudy"),
            credential_file: None,
            credentials_dir: None,
            admin_user_ids: Vec::new(),
            alert_chat_ids: Vec::new(),
            primary: PrimaryConfig::default(),
            monitor: MonitorConfig::default(),
            launch: LaunchConfig::default(),
            telegram: TelegramConfig::default(),
            pending: PendingConfig::default(),
        }
    }
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            service: "imlerih_bot".into(),
            process_pattern: DEFAULT_PROCESS_PATTERN.into(),
            credential_file: None,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            failure_threshold: 2,
            api_timeout_secs: 10,
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            probe_delay_secs: 3,
            timeout_secs: 30,
            program: None,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".into(),
            poll_timeout_secs: 30,
        }
    }
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            capacity: 1024,
        }
    }
}

impl FleetConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(eyre!("failed to read {}: {e}", path.display())),
        };
        let config: Self = toml::from_str(&content)
            .map_err(|e| eyre!("failed to parse {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.monitor.failure_threshold == 0 {
            return Err(eyre!("monitor.failure_threshold must be at least 1"));
        }
        if self.monitor.interval_secs == 0 {
            return Err(eyre!("monitor.interval_secs must be at least 1"));
        }
        if self.launch.probe_delay_secs >= self.launch.timeout_secs {
            return Err(eyre!(
                "launch.probe_delay_secs ({}) must be below launch.timeout_secs ({})",
                self.launch.probe_delay_secs,
                self.launch.timeout_secs
            ));
        }
        Ok(())
    }

    /// Check if a user may run admin commands.
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_user_ids.contains(&user_id)
    }

    /// Chats that receive monitor alerts.
    pub fn alert_chats(&self) -> &[i64] {
        if self.alert_chat_ids.is_empty() {
            &self.admin_user_ids
        } else {
            &self.alert_chat_ids
        }
    }

    pub fn identity_path(&self) -> PathBuf {
        self.state_dir.join("identity.json")
    }

    pub fn backups_path(&self) -> PathBuf {
        self.state_dir.join("backups.json")
    }

    pub fn lineage_path(&self) -> PathBuf {
        self.state_dir.join("lineage.json")
    }

    pub fn processes_path(&self) -> PathBuf {
        self.state_dir.join("processes.json")
    }

    pub fn drill_path(&self) -> PathBuf {
        self.state_dir.join("drill.json")
    }

    pub fn texts_path(&self) -> PathBuf {
        self.state_dir.join("texts.json")
    }

    pub fn clones_dir(&self) -> PathBuf {
        self.state_dir.join("clones")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.credentials_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("credentials"))
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}
