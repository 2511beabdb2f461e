//! OS process management behind a trait, so launch and monitoring logic can
//! run against a fake in tests.

use crate::error::FleetError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to start a detached process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// stdout and stderr are appended here.
    pub log_file: PathBuf,
}

/// Result of a liveness query that may itself fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Up(String),
    Down(String),
    /// The query could not be answered (tool missing, timeout, ...).
    Unknown(String),
}

#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Start a process in its own process group so it outlives us.
    async fn spawn_detached(&self, spec: &SpawnSpec) -> Result<u32, FleetError>;

    async fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to terminate (SIGTERM).
    async fn stop(&self, pid: u32) -> Result<(), FleetError>;

    /// Whether the named service unit is active.
    async fn service_state(&self, service: &str) -> ProbeOutcome;

    /// Whether any process's command line matches `pattern`.
    async fn find_process(&self, pattern: &str) -> ProbeOutcome;
}

/// Real implementation using `kill`, `systemctl`, and `pgrep`.
#[derive(Debug, Default)]
pub struct OsProcessManager {
    // Children we spawned, kept so they can be reaped: a dead but unreaped
    // child still answers `kill -0`.
    children: Mutex<HashMap<u32, std::process::Child>>,
}

impl OsProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(alive)` if `pid` is one of our children.
    fn child_alive(&self, pid: u32) -> Option<bool> {
        let mut children = self.children.lock().ok()?;
        let child = children.get_mut(&pid)?;
        match child.try_wait() {
            Ok(None) => Some(true),
            Ok(Some(_)) | Err(_) => {
                children.remove(&pid);
                Some(false)
            }
        }
    }
}

#[async_trait]
impl ProcessManager for OsProcessManager {
    async fn spawn_detached(&self, spec: &SpawnSpec) -> Result<u32, FleetError> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)
            .map_err(|e| FleetError::io(&spec.log_file, e))?;
        let stderr_log = log
            .try_clone()
            .map_err(|e| FleetError::io(&spec.log_file, e))?;

        let mut cmd = std::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(stderr_log);

        // Detach from our process group so the instance survives our exit.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| FleetError::io(&spec.program, e))?;
        let pid = child.id();
        if let Ok(mut children) = self.children.lock() {
            children.insert(pid, child);
        }
        tracing::info!(pid, program = %spec.program.display(), "spawned detached process");
        Ok(pid)
    }

    async fn is_alive(&self, pid: u32) -> bool {
        if let Some(alive) = self.child_alive(pid) {
            return alive;
        }
        run_quiet("kill", &["-0", &pid.to_string()])
            .await
            .is_some_and(|out| out.status.success())
    }

    async fn stop(&self, pid: u32) -> Result<(), FleetError> {
        let status = tokio::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| FleetError::io("kill", e))?;
        if !status.success() {
            tracing::warn!(pid, "kill -TERM reported failure (process already gone?)");
        }
        // Reap if it was ours.
        let _ = self.child_alive(pid);
        Ok(())
    }

    async fn service_state(&self, service: &str) -> ProbeOutcome {
        match run_quiet("systemctl", &["is-active", service]).await {
            Some(out) => {
                let state = String::from_utf8_lossy(&out.stdout).trim().to_owned();
                if state == "active" {
                    ProbeOutcome::Up(state)
                } else if state.is_empty() {
                    ProbeOutcome::Unknown(String::from_utf8_lossy(&out.stderr).trim().to_owned())
                } else {
                    ProbeOutcome::Down(format!("service {service} is {state}"))
                }
            }
            None => ProbeOutcome::Unknown("systemctl unavailable or timed out".into()),
        }
    }

    async fn find_process(&self, pattern: &str) -> ProbeOutcome {
        match run_quiet("pgrep", &["-f", pattern]).await {
            Some(out) if out.status.success() => {
                let pids: Vec<String> = String::from_utf8_lossy(&out.stdout)
                    .split_whitespace()
                    .map(str::to_owned)
                    .collect();
                ProbeOutcome::Up(format!("pids {}", pids.join(",")))
            }
            // pgrep exits 1 when nothing matches, >1 on usage errors.
            Some(out) if out.status.code() == Some(1) => {
                ProbeOutcome::Down(format!("no process matching {pattern:?}"))
            }
            Some(out) => ProbeOutcome::Unknown(format!(
                "pgrep failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
            None => ProbeOutcome::Unknown("pgrep unavailable or timed out".into()),
        }
    }
}

async fn run_quiet(program: &str, args: &[&str]) -> Option<std::process::Output> {
    let fut = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(Ok(out)) => Some(out),
        Ok(Err(e)) => {
            tracing::debug!("{program} failed to run: {e}");
            None
        }
        Err(_) => {
            tracing::debug!("{program} timed out");
            None
        }
    }
}
