//! Self-update: signed-manifest polling, checksum-verified download, and
//! crash-safe binary swap.
//!
//! The manifest lives at `<update_server>/version.json`:
//!
//! ```json
//! { "version": "1.2.0",
//!   "release_date": "2026-07-01T00:00:00Z",
//!   "binaries": {
//!     "linux-x86_64": { "url": "https://...", "sha256": "<64-hex>" }
//!   } }
//! ```
//!
//! Every step is safe against power loss: the canonical executable path
//! always holds either the old binary or a complete, digest-verified new
//! one. The download streams through a SHA-256 hasher into a temp file on
//! the same filesystem as the executable; a digest mismatch aborts and
//! deletes the temp without touching the binary.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The running agent version, from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Guard against concurrent install attempts (poll loop racing a command).
static INSTALL_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

/// One downloadable binary in the manifest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BinaryEntry {
    pub url: String,
    /// Hex SHA-256 of the exact bytes at `url`.
    pub sha256: String,
}

/// The update manifest served at `<update_server>/version.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub version: String,
    pub release_date: String,
    /// Keyed by `<os>-<arch>`.
    pub binaries: HashMap<String, BinaryEntry>,
}

/// Result of comparing the manifest version against the running build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpdateAvailable { current: String, latest: String },
    UpToDate { version: String },
    AheadOfRelease { current: String, latest: String },
}

/// Outcome of an install attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Binary swapped; the process should restart.
    Applied { version: String },
    /// Manifest version equals (or is behind) the running one.
    AlreadyCurrent,
}

/// How the process should hand control back after a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartStrategy {
    /// Containerized: exit with code 100, the orchestrator restarts us.
    OrchestratorExit,
    /// Ask the service manager to restart the unit.
    ServiceManager,
    /// Plain exit; a supervisor relaunches.
    SupervisorExit,
}

/// Distinguished exit code meaning "updated, please restart me".
pub const UPDATED_EXIT_CODE: i32 = 100;

/// `<os>-<arch>` key into the manifest's binaries map.
pub fn arch_key() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Fetch and parse the manifest. Blocking; runs on the update thread.
pub fn fetch_manifest(update_server: &str) -> Result<Manifest> {
    let url = format!("{}/version.json", update_server.trim_end_matches('/'));
    let response = reqwest::blocking::Client::new()
        .get(&url)
        .header("User-Agent", format!("drover-agent/{VERSION}"))
        .send()
        .with_context(|| format!("requesting {url}"))?;
    if !response.status().is_success() {
        bail!("manifest fetch returned {}", response.status());
    }
    response.json().context("parsing update manifest")
}

/// Compare the manifest against the running version.
pub fn check(update_server: &str) -> Result<UpdateStatus> {
    let manifest = fetch_manifest(update_server)?;
    let current = Version::parse(VERSION)?;
    let latest = Version::parse(&manifest.version)
        .with_context(|| format!("manifest version {:?}", manifest.version))?;

    Ok(match latest.cmp(&current) {
        std::cmp::Ordering::Greater => UpdateStatus::UpdateAvailable {
            current: VERSION.to_string(),
            latest: manifest.version,
        },
        std::cmp::Ordering::Equal => UpdateStatus::UpToDate {
            version: VERSION.to_string(),
        },
        std::cmp::Ordering::Less => UpdateStatus::AheadOfRelease {
            current: VERSION.to_string(),
            latest: manifest.version,
        },
    })
}

/// Full install sequence against the running executable.
///
/// Downloads, verifies, and swaps; does NOT restart — the caller picks the
/// restart path from [`restart_strategy`].
pub fn install(update_server: &str, helper: Option<&Path>) -> Result<UpdateOutcome> {
    let exe = std::env::current_exe().context("locating current executable")?;
    install_at(update_server, &exe, helper)
}

/// Install against an explicit executable path (unit-testable).
pub fn install_at(
    update_server: &str,
    exe_path: &Path,
    helper: Option<&Path>,
) -> Result<UpdateOutcome> {
    if INSTALL_IN_PROGRESS.swap(true, Ordering::SeqCst) {
        bail!("update already in progress");
    }
    let result = install_inner(update_server, exe_path, helper);
    INSTALL_IN_PROGRESS.store(false, Ordering::SeqCst);
    result
}

fn install_inner(
    update_server: &str,
    exe_path: &Path,
    helper: Option<&Path>,
) -> Result<UpdateOutcome> {
    let manifest = fetch_manifest(update_server)?;
    let current = Version::parse(VERSION)?;
    let latest = Version::parse(&manifest.version)
        .with_context(|| format!("manifest version {:?}", manifest.version))?;
    if latest <= current {
        log::info!("[Update] already current ({VERSION} >= {})", manifest.version);
        return Ok(UpdateOutcome::AlreadyCurrent);
    }

    let key = arch_key();
    let entry = manifest
        .binaries
        .get(&key)
        .with_context(|| format!("manifest has no binary for {key}"))?;

    apply_binary(entry, exe_path, helper)?;
    log::info!("[Update] swapped in version {}", manifest.version);
    Ok(UpdateOutcome::Applied {
        version: manifest.version,
    })
}

/// Download `entry`, verify its digest, and atomically replace `exe_path`.
pub fn apply_binary(entry: &BinaryEntry, exe_path: &Path, helper: Option<&Path>) -> Result<()> {
    let _lock = SwapLock::acquire(exe_path)?;

    let temp_path = download_verified(entry, exe_path)?;

    // chmod 0755 before the swap so the new binary is immediately runnable.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o755))?;
    }

    swap_into_place(&temp_path, exe_path, helper)
}

/// Stream the download through a SHA-256 hasher into a temp file next to
/// the executable (same filesystem). Digest mismatch deletes the temp.
fn download_verified(entry: &BinaryEntry, exe_path: &Path) -> Result<PathBuf> {
    let temp_path = exe_path.with_extension("new");

    let mut response = reqwest::blocking::Client::new()
        .get(&entry.url)
        .header("User-Agent", format!("drover-agent/{VERSION}"))
        .send()
        .with_context(|| format!("downloading {}", entry.url))?;
    if !response.status().is_success() {
        bail!("download returned {}", response.status());
    }

    let file = fs::File::create(&temp_path)
        .with_context(|| format!("creating {}", temp_path.display()))?;
    let mut writer = HashingWriter {
        file,
        hasher: Sha256::new(),
    };
    if let Err(e) = std::io::copy(&mut response, &mut writer) {
        let _ = fs::remove_file(&temp_path);
        return Err(e).context("streaming download");
    }
    writer.file.sync_all()?;

    let digest = format!("{:x}", writer.hasher.finalize());
    if !digest.eq_ignore_ascii_case(&entry.sha256) {
        let _ = fs::remove_file(&temp_path);
        bail!(
            "checksum mismatch: manifest {} but downloaded {digest}",
            entry.sha256
        );
    }
    log::info!("[Update] checksum verified ({digest})");
    Ok(temp_path)
}

/// Swap ladder: rename, then copy-then-replace, then the configured
/// privileged helper. All three keep the canonical path valid.
fn swap_into_place(temp_path: &Path, exe_path: &Path, helper: Option<&Path>) -> Result<()> {
    let rename_err = match fs::rename(temp_path, exe_path) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    log::warn!("[Update] rename failed ({rename_err}), trying copy-then-replace");

    // Copy into a sibling of the target (same filesystem), then rename.
    let staging = exe_path.with_extension("staged");
    let copy_result = fs::copy(temp_path, &staging)
        .map_err(anyhow::Error::from)
        .and_then(|_| fs::rename(&staging, exe_path).map_err(anyhow::Error::from));
    match copy_result {
        Ok(()) => {
            let _ = fs::remove_file(temp_path);
            return Ok(());
        }
        Err(copy_err) => {
            let _ = fs::remove_file(&staging);
            log::warn!("[Update] copy-then-replace failed: {copy_err:#}");
        }
    }

    // Privileged helper, only when explicitly configured.
    let Some(helper) = helper else {
        let _ = fs::remove_file(temp_path);
        bail!("swap failed: {rename_err}; no update helper configured");
    };
    log::warn!(
        "[Update] invoking privileged helper {} for the swap",
        helper.display()
    );
    let status = std::process::Command::new(helper)
        .arg(temp_path)
        .arg(exe_path)
        .status()
        .with_context(|| format!("running helper {}", helper.display()))?;
    let _ = fs::remove_file(temp_path);
    if !status.success() {
        bail!("update helper exited with {status}");
    }
    Ok(())
}

/// Detect a container orchestrator environment.
pub fn is_containerized() -> bool {
    Path::new("/.dockerenv").exists()
        || Path::new("/var/run/secrets/kubernetes.io/serviceaccount").exists()
}

/// Pick the restart path for the current environment.
pub fn restart_strategy(service_unit: Option<&str>) -> RestartStrategy {
    if is_containerized() {
        RestartStrategy::OrchestratorExit
    } else if service_unit.is_some() {
        RestartStrategy::ServiceManager
    } else {
        RestartStrategy::SupervisorExit
    }
}

/// Advisory lock on the executable path held for the duration of a swap.
struct SwapLock {
    path: PathBuf,
}

impl SwapLock {
    fn acquire(exe_path: &Path) -> Result<Self> {
        let path = exe_path.with_extension("swap-lock");
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                bail!("another update holds the swap lock at {}", path.display())
            }
            Err(e) => Err(e).with_context(|| format!("creating {}", path.display())),
        }
    }
}

impl Drop for SwapLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

struct HashingWriter {
    file: fs::File,
    hasher: Sha256,
}

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.file.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}
