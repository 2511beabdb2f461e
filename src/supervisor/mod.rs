//! Launching and tracking standby instances.
//!
//! `launch` validates the credential, materializes an instance directory,
//! starts `understudy run --instance <dir>` detached, then waits a bounded
//! time to learn whether the process stayed up and the platform accepts
//! the credential. Callers get one answer: a [`LaunchReport`] or a
//! [`FleetError`] carrying the instance's recent output.

pub mod instance;

use crate::channel::{ApiCheck, Gateway};
use crate::config::FleetConfig;
use crate::credential::{CREDENTIAL_FILE_ENV, Credential};
use crate::error::FleetError;
use crate::fleet::{BackupList, FleetEntry, FleetRegistry, FleetStatus, Lineage};
use crate::process::{ProcessManager, SpawnSpec};
use chrono::Utc;
use instance::{InstanceFeatures, InstanceManifest};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const TAIL_LINES: usize = 20;

/// Successful launch.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub clone_id: String,
    pub pid: u32,
    pub credential_preview: String,
    pub username: Option<String>,
    pub instance_dir: PathBuf,
}

impl LaunchReport {
    pub fn describe(&self) -> String {
        let name = self
            .username
            .as_deref()
            .map(|u| format!(" (@{u})"))
            .unwrap_or_default();
        format!(
            "Standby {}{name} is running as pid {} with credential {}.",
            self.clone_id, self.pid, self.credential_preview
        )
    }
}

enum Probe {
    Exited,
    Alive(ApiCheck),
}

pub struct Supervisor {
    processes: Arc<dyn ProcessManager>,
    gateway: Arc<dyn Gateway>,
    registry: FleetRegistry,
    lineage: Lineage,
    backups: BackupList,
    clones_dir: PathBuf,
    program: PathBuf,
    config_path: PathBuf,
    workdir: PathBuf,
    features: InstanceFeatures,
    probe_delay: Duration,
    launch_timeout: Duration,
    api_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        config: &FleetConfig,
        config_path: &Path,
        processes: Arc<dyn ProcessManager>,
        gateway: Arc<dyn Gateway>,
    ) -> Result<Self, FleetError> {
        let program = match &config.launch.program {
            Some(p) => p.clone(),
            None => std::env::current_exe().map_err(|e| FleetError::io("current executable", e))?,
        };
        let workdir = std::env::current_dir().map_err(|e| FleetError::io(".", e))?;
        Ok(Self {
            processes,
            gateway,
            registry: FleetRegistry::new(config.processes_path()),
            lineage: Lineage::new(config.lineage_path()),
            backups: BackupList::new(config.backups_path()),
            clones_dir: config.clones_dir(),
            program,
            config_path: config_path.to_path_buf(),
            workdir,
            features: InstanceFeatures::default(),
            probe_delay: Duration::from_secs(config.launch.probe_delay_secs),
            launch_timeout: Duration::from_secs(config.launch.timeout_secs),
            api_timeout: config.monitor.api_timeout(),
        })
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    pub fn backups(&self) -> &BackupList {
        &self.backups
    }

    /// Launch a standby holding `raw`, on behalf of `owner` if known.
    pub async fn launch(
        &self,
        owner: Option<&Credential>,
        raw: &str,
    ) -> Result<LaunchReport, FleetError> {
        let credential = Credential::parse(raw)?;
        let clone_id = new_clone_id();
        let manifest = instance::materialize(
            &self.clones_dir,
            &clone_id,
            &credential,
            self.features.clone(),
        )?;
        tracing::info!(%clone_id, credential = %credential, "launching standby");

        let pid = match self.spawn(&manifest).await {
            Ok(pid) => pid,
            Err(e) => {
                self.discard_instance(&clone_id);
                return Err(e);
            }
        };
        let entry = FleetEntry {
            clone_id: clone_id.clone(),
            pid,
            credential_preview: credential.preview(),
            launched_at: Utc::now(),
            status: FleetStatus::Running,
            owner: owner.map(Credential::preview),
            instance_dir: manifest.dir().map(Path::to_path_buf),
        };

        let report = match self.settle(&entry, &manifest, &credential).await {
            Ok(report) => report,
            Err(e) => {
                // A registered clone keeps its directory so it can be stopped or relaunched.
                if self.registry.get(&clone_id).is_none() && !self.processes.is_alive(pid).await {
                    self.discard_instance(&clone_id);
                }
                return Err(e);
            }
        };
        if let Some(owner) = owner
            && let Err(e) = self.lineage.record_launch(owner.expose(), credential.expose())
        {
            tracing::warn!("lineage not updated: {e}");
        }
        if let Err(e) = self.backups.add(credential.expose()) {
            tracing::warn!("backup list not updated: {e}");
        }
        Ok(report)
    }

    /// All fleet entries with status recomputed from the process table.
    /// Changed statuses are written back.
    pub async fn list(&self) -> Result<Vec<FleetEntry>, FleetError> {
        let mut entries = self.registry.entries();
        let mut updates = Vec::new();
        for entry in &mut entries {
            let status = if self.processes.is_alive(entry.pid).await {
                FleetStatus::Running
            } else {
                FleetStatus::Stopped
            };
            if status != entry.status {
                updates.push((entry.clone_id.clone(), status));
                entry.status = status;
            }
        }
        self.registry.update_statuses(&updates)?;
        Ok(entries)
    }

    /// Terminate a clone and mark it stopped.
    pub async fn stop(&self, clone_id: &str) -> Result<FleetEntry, FleetError> {
        let mut entry = self
            .registry
            .get(clone_id)
            .ok_or_else(|| FleetError::UnknownClone(clone_id.to_owned()))?;
        if self.processes.is_alive(entry.pid).await {
            self.processes.stop(entry.pid).await?;
            tracing::info!(clone_id, pid = entry.pid, "stopped standby");
        }
        entry.status = FleetStatus::Stopped;
        self.registry.record_process(entry.clone())?;
        Ok(entry)
    }

    /// Restart a clone from its instance directory.
    pub async fn relaunch(&self, clone_id: &str) -> Result<LaunchReport, FleetError> {
        let mut entry = self
            .registry
            .get(clone_id)
            .ok_or_else(|| FleetError::UnknownClone(clone_id.to_owned()))?;
        let manifest = self.manifest_for(&entry)?;
        let credential = manifest.credential()?;

        if self.processes.is_alive(entry.pid).await {
            self.processes.stop(entry.pid).await?;
        }
        entry.pid = self.spawn(&manifest).await?;
        entry.launched_at = Utc::now();
        entry.status = FleetStatus::Running;
        tracing::info!(clone_id, pid = entry.pid, "relaunched standby");
        self.settle(&entry, &manifest, &credential).await
    }

    /// A systemd unit that runs the clone as a managed service.
    pub fn render_systemd_unit(&self, clone_id: &str) -> Result<String, FleetError> {
        let entry = self
            .registry
            .get(clone_id)
            .ok_or_else(|| FleetError::UnknownClone(clone_id.to_owned()))?;
        let manifest = self.manifest_for(&entry)?;
        let dir = manifest.dir().unwrap_or(&self.clones_dir);
        Ok(format!(
            "[Unit]\n\
             Description=understudy standby {clone_id}\n\
             After=network-online.target\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             WorkingDirectory={workdir}\n\
             Environment={env}={credential_file}\n\
             ExecStart={program} -c {config} run --instance {dir}\n\
             Restart=on-failure\n\
             RestartSec=5\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            workdir = self.workdir.display(),
            env = CREDENTIAL_FILE_ENV,
            credential_file = manifest.credential_file.display(),
            program = self.program.display(),
            config = self.config_path.display(),
            dir = dir.display(),
        ))
    }

    /// Remove the directory of a launch that never came up, credential included.
    fn discard_instance(&self, clone_id: &str) {
        let dir = self.clones_dir.join(clone_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => tracing::debug!(clone_id, "removed instance directory of failed launch"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(clone_id, "instance directory not removed: {e}"),
        }
    }

    fn manifest_for(&self, entry: &FleetEntry) -> Result<InstanceManifest, FleetError> {
        let dir = entry
            .instance_dir
            .clone()
            .unwrap_or_else(|| self.clones_dir.join(&entry.clone_id));
        InstanceManifest::load(&dir).map_err(|e| FleetError::LaunchFailure {
            clone_id: entry.clone_id.clone(),
            reason: e.to_string(),
            output_tail: String::new(),
        })
    }

    async fn spawn(&self, manifest: &InstanceManifest) -> Result<u32, FleetError> {
        let dir = manifest.dir().unwrap_or(&self.clones_dir);
        let spec = SpawnSpec {
            program: self.program.clone(),
            args: vec![
                "-c".into(),
                self.config_path.display().to_string(),
                "run".into(),
                "--instance".into(),
                dir.display().to_string(),
            ],
            env: vec![(
                CREDENTIAL_FILE_ENV.to_owned(),
                manifest.credential_file.display().to_string(),
            )],
            cwd: self.workdir.clone(),
            log_file: manifest.log_file.clone(),
        };
        self.processes
            .spawn_detached(&spec)
            .await
            .map_err(|e| FleetError::LaunchFailure {
                clone_id: manifest.clone_id.clone(),
                reason: e.to_string(),
                output_tail: String::new(),
            })
    }

    /// Wait for the new process to settle, register it if alive, and turn
    /// the outcome into a report or an error.
    async fn settle(
        &self,
        entry: &FleetEntry,
        manifest: &InstanceManifest,
        credential: &Credential,
    ) -> Result<LaunchReport, FleetError> {
        let probe = tokio::time::timeout(self.launch_timeout, self.probe(entry.pid, credential));
        let api = match probe.await {
            Ok(Probe::Alive(api)) => api,
            Ok(Probe::Exited) => {
                return Err(FleetError::LaunchFailure {
                    clone_id: entry.clone_id.clone(),
                    reason: "process exited during startup".into(),
                    output_tail: instance::log_tail(&manifest.log_file, TAIL_LINES),
                });
            }
            Err(_) => {
                if self.processes.is_alive(entry.pid).await {
                    self.registry.record_process(entry.clone())?;
                }
                return Err(FleetError::LaunchTimeout {
                    clone_id: entry.clone_id.clone(),
                    pid: entry.pid,
                    timeout_secs: self.launch_timeout.as_secs(),
                });
            }
        };

        // Alive: visible in the fleet whatever the platform said.
        self.registry.record_process(entry.clone())?;
        match api {
            ApiCheck::Ok { username, .. } => Ok(LaunchReport {
                clone_id: entry.clone_id.clone(),
                pid: entry.pid,
                credential_preview: entry.credential_preview.clone(),
                username,
                instance_dir: entry.instance_dir.clone().unwrap_or_default(),
            }),
            other => Err(FleetError::LaunchFailure {
                clone_id: entry.clone_id.clone(),
                reason: format!("process is up but the platform check failed: {}", other.describe()),
                output_tail: instance::log_tail(&manifest.log_file, TAIL_LINES),
            }),
        }
    }

    async fn probe(&self, pid: u32, credential: &Credential) -> Probe {
        tokio::time::sleep(self.probe_delay).await;
        if !self.processes.is_alive(pid).await {
            return Probe::Exited;
        }
        Probe::Alive(self.gateway.who_am_i(credential, self.api_timeout).await)
    }
}

/// `clone_<unix seconds>_<8 hex chars>`.
pub fn new_clone_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("clone_{}_{}", Utc::now().timestamp(), &suffix[..8])
}
