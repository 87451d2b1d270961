//! Config-apply transaction: snapshot → write → validate → reload, with
//! rollback on reload failure.
//!
//! Mutations to a managed file are serialized: at most one apply runs per
//! file, later commands queue FIFO on the per-file lock. A validate failure
//! restores the snapshot and reports without reloading. A reload failure
//! rolls back and reloads the original; if that reload also fails the file
//! is marked degraded (persisted) and further applies are refused until an
//! operator clears the flag.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::agent::backup::BackupRing;
use crate::config::AgentConfig;

/// Upper bound on validator and reload runs.
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// External commands used to validate and control the proxy.
#[derive(Debug, Clone)]
pub struct ProxyControl {
    /// Config validation, e.g. `nginx -t`.
    pub validate: Vec<String>,
    /// Orderly reload, e.g. `systemctl reload nginx` or `nginx -s reload`.
    pub reload: Vec<String>,
    /// Service restart.
    pub restart: Vec<String>,
    /// Service stop.
    pub stop: Vec<String>,
}

impl ProxyControl {
    /// Derive the command set from configuration: the service-manager path
    /// is preferred when a unit is configured, else the binary's signals.
    ///
    /// Signals cannot express a full process restart — `-s reload` is the
    /// closest real action (workers are respawned with the current
    /// config), so restart maps to it. A cold restart needs a configured
    /// service unit.
    pub fn from_config(config: &AgentConfig) -> Self {
        let binary = config.proxy_binary.to_string_lossy().into_owned();
        match &config.service_unit {
            Some(unit) => Self {
                validate: vec![binary, "-t".into()],
                reload: vec!["systemctl".into(), "reload".into(), unit.clone()],
                restart: vec!["systemctl".into(), "restart".into(), unit.clone()],
                stop: vec!["systemctl".into(), "stop".into(), unit.clone()],
            },
            None => Self {
                validate: vec![binary.clone(), "-t".into()],
                reload: vec![binary.clone(), "-s".into(), "reload".into()],
                restart: vec![binary.clone(), "-s".into(), "reload".into()],
                stop: vec![binary, "-s".into(), "quit".into()],
            },
        }
    }

    /// Run one command with the step timeout, capturing output.
    pub async fn run(&self, argv: &[String]) -> Result<Output> {
        run_step(argv).await
    }
}

/// Successful apply report.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// Snapshot directory captured before the write.
    pub backup_path: PathBuf,
}

/// Failed apply report. `critical` marks a failed rollback reload.
#[derive(Debug, Clone)]
pub struct ApplyFailure {
    pub message: String,
    /// Snapshot directory, when the failure happened after Snapshotting.
    pub backup_path: Option<PathBuf>,
    pub critical: bool,
}

impl std::fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Persisted set of files refused for apply until operator clearance.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DegradedFlags {
    files: Vec<PathBuf>,
}

/// Owns the per-file locks, the backup ring, and the degraded set.
pub struct ConfigApplier {
    control: ProxyControl,
    backups: BackupRing,
    /// Per-managed-file mutexes; tokio mutexes queue waiters FIFO.
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    degraded_path: PathBuf,
    degraded: std::sync::Mutex<Vec<PathBuf>>,
}

impl ConfigApplier {
    pub fn new(control: ProxyControl, backups: BackupRing, state_dir: &Path) -> Self {
        let degraded_path = state_dir.join("degraded.json");
        let degraded = fs::read_to_string(&degraded_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<DegradedFlags>(&raw).ok())
            .map(|flags| flags.files)
            .unwrap_or_default();
        if !degraded.is_empty() {
            log::warn!(
                "[Apply] {} file(s) marked degraded from a previous run",
                degraded.len()
            );
        }
        Self {
            control,
            backups,
            locks: Mutex::new(HashMap::new()),
            degraded_path,
            degraded: std::sync::Mutex::new(degraded),
        }
    }

    /// Build from agent configuration.
    pub fn from_config(config: &AgentConfig) -> Self {
        let state_dir = config
            .backup_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.backup_dir.clone());
        Self::new(
            ProxyControl::from_config(config),
            BackupRing::new(&config.backup_dir, config.backup_ring_size),
            &state_dir,
        )
    }

    /// The proxy control command set (restart/stop commands reuse it).
    pub fn control(&self) -> &ProxyControl {
        &self.control
    }

    /// Replace the whole file with `content`.
    pub async fn apply_snippet(
        &self,
        path: &Path,
        content: &[u8],
    ) -> Result<ApplyReport, ApplyFailure> {
        self.apply_inner(path, content.to_vec(), "apply").await
    }

    /// Append `snippet` to the current contents.
    pub async fn apply_augment(
        &self,
        path: &Path,
        snippet: &[u8],
    ) -> Result<ApplyReport, ApplyFailure> {
        let mut content = fs::read(path).map_err(|e| ApplyFailure {
            message: format!("reading {} for augment: {e}", path.display()),
            backup_path: None,
            critical: false,
        })?;
        content.extend_from_slice(snippet);
        self.apply_inner(path, content, "augment").await
    }

    /// Reload without touching the file (ReloadConfig command).
    pub async fn reload_only(&self) -> Result<String> {
        let output = run_step(&self.control.reload).await?;
        if !output.status.success() {
            anyhow::bail!("reload failed: {}", stderr_of(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// The whole snapshot→write→validate→reload transaction.
    async fn apply_inner(
        &self,
        path: &Path,
        new_content: Vec<u8>,
        reason: &str,
    ) -> Result<ApplyReport, ApplyFailure> {
        if self.is_degraded(path) {
            return Err(ApplyFailure {
                message: format!(
                    "{} is marked degraded after a failed rollback; operator clearance required",
                    path.display()
                ),
                backup_path: None,
                critical: false,
            });
        }

        let lock = self.file_lock(path).await;
        let _guard = lock.lock().await;

        // Snapshotting
        let backup_path = self.backups.snapshot(path, reason).map_err(|e| ApplyFailure {
            message: format!("snapshot failed: {e:#}"),
            backup_path: None,
            critical: false,
        })?;
        let snapshot = self
            .backups
            .latest(path)
            .ok()
            .flatten()
            .expect("snapshot just captured");

        // Writing
        if let Err(e) = write_atomic(path, &new_content, Some(snapshot.mode)) {
            return Err(ApplyFailure {
                message: format!("write failed: {e:#}"),
                backup_path: Some(backup_path),
                critical: false,
            });
        }

        // Validating
        match run_step(&self.control.validate).await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                // Restore the snapshot so the failed content never reloads.
                let restore = self.backups.restore(path, &snapshot);
                let mut message = format!("validation failed: {}", stderr_of(&output));
                if let Err(e) = restore {
                    message.push_str(&format!("; restore also failed: {e:#}"));
                }
                return Err(ApplyFailure {
                    message,
                    backup_path: Some(backup_path),
                    critical: false,
                });
            }
            Err(e) => {
                let _ = self.backups.restore(path, &snapshot);
                return Err(ApplyFailure {
                    message: format!("validator did not run: {e:#}"),
                    backup_path: Some(backup_path),
                    critical: false,
                });
            }
        }

        // Reloading
        match self.reload_step().await {
            Ok(()) => {
                log::info!("[Apply] {} applied and reloaded", path.display());
                Ok(ApplyReport { backup_path })
            }
            Err(reload_err) => {
                // RollingBack: restore the original and reload it.
                log::warn!(
                    "[Apply] reload failed for {}, rolling back: {reload_err:#}",
                    path.display()
                );
                if let Err(e) = self.backups.restore(path, &snapshot) {
                    self.mark_degraded(path);
                    return Err(ApplyFailure {
                        message: format!(
                            "reload failed: {reload_err:#}; rollback restore also failed: {e:#}"
                        ),
                        backup_path: Some(backup_path),
                        critical: true,
                    });
                }
                match self.reload_step().await {
                    Ok(()) => Err(ApplyFailure {
                        message: format!("reload failed, rolled back: {reload_err:#}"),
                        backup_path: Some(backup_path),
                        critical: false,
                    }),
                    Err(rollback_err) => {
                        self.mark_degraded(path);
                        Err(ApplyFailure {
                            message: format!(
                                "rollback also failed: {rollback_err:#} (original reload failure: {reload_err:#})"
                            ),
                            backup_path: Some(backup_path),
                            critical: true,
                        })
                    }
                }
            }
        }
    }

    async fn reload_step(&self) -> Result<()> {
        let output = run_step(&self.control.reload).await?;
        if !output.status.success() {
            anyhow::bail!("{}", stderr_of(&output));
        }
        Ok(())
    }

    async fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Files currently refused for apply (heartbeat surface).
    pub fn degraded_files(&self) -> Vec<String> {
        self.degraded
            .lock()
            .expect("degraded mutex poisoned")
            .iter()
            .map(|p| p.display().to_string())
            .collect()
    }

    /// True when `path` carries the persisted degraded flag.
    pub fn is_degraded(&self, path: &Path) -> bool {
        self.degraded
            .lock()
            .expect("degraded mutex poisoned")
            .iter()
            .any(|p| p == path)
    }

    /// Operator clearance: drop the degraded flag for `path`.
    pub fn clear_degraded(&self, path: &Path) {
        let mut degraded = self.degraded.lock().expect("degraded mutex poisoned");
        degraded.retain(|p| p != path);
        persist_degraded(&self.degraded_path, &degraded);
    }

    fn mark_degraded(&self, path: &Path) {
        log::error!(
            "[Apply] marking {} degraded; operator clearance required",
            path.display()
        );
        let mut degraded = self.degraded.lock().expect("degraded mutex poisoned");
        if !degraded.iter().any(|p| p == path) {
            degraded.push(path.to_path_buf());
        }
        persist_degraded(&self.degraded_path, &degraded);
    }
}

fn persist_degraded(path: &Path, files: &[PathBuf]) {
    let flags = DegradedFlags {
        files: files.to_vec(),
    };
    let write = || -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&flags)?)?;
        Ok(())
    };
    if let Err(e) = write() {
        log::error!("[Apply] persisting degraded flags failed: {e:#}");
    }
}

/// Atomically replace `path` with `content`: write to a temp file in the
/// same directory, fsync, rename over the target. Mode is preserved from
/// `mode` (or the existing file when `None`).
pub fn write_atomic(path: &Path, content: &[u8], mode: Option<u32>) -> Result<()> {
    let dir = path.parent().context("target has no parent directory")?;
    let mode = match mode {
        Some(mode) => mode,
        None => fs::metadata(path)?.permissions().mode(),
    };

    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .context("target has no file name")?
            .to_string_lossy(),
        std::process::id()
    ));
    fs::write(&tmp, content).with_context(|| format!("writing {}", tmp.display()))?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
    fs::File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("renaming over {}", path.display()))?;
    Ok(())
}

/// Run one argv with the 5 s step timeout, capturing stdout/stderr.
async fn run_step(argv: &[String]) -> Result<Output> {
    let (program, args) = argv.split_first().context("empty command")?;
    let future = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(STEP_TIMEOUT, future).await {
        Ok(result) => result.with_context(|| format!("running {program}")),
        Err(_) => anyhow::bail!("{program} timed out after {STEP_TIMEOUT:?}"),
    }
}

fn stderr_of(output: &Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        format!("exit status {}", output.status)
    } else {
        trimmed.to_string()
    }
}
