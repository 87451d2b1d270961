//! Bounded ring of config-file snapshots used for rollback.
//!
//! Layout under the backup root, one bucket per managed file:
//!
//! ```text
//! <root>/<bucket>/<YYYYMMDDHHMMSS>_<reason>/<file-name>
//! ```
//!
//! Snapshot directories sort lexicographically by creation time; when the
//! ring exceeds its capacity the eldest directory is removed. Each snapshot
//! preserves the file's exact contents and mode.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};

/// One restorable snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Snapshot directory (the command-result artifact).
    pub dir: PathBuf,
    /// Captured file contents.
    pub contents: Vec<u8>,
    /// Captured permission bits.
    pub mode: u32,
}

/// Bounded, timestamp-ordered snapshot store.
#[derive(Debug, Clone)]
pub struct BackupRing {
    root: PathBuf,
    capacity: usize,
}

impl BackupRing {
    pub fn new(root: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            root: root.into(),
            capacity: capacity.max(1),
        }
    }

    /// Capture the current state of `target` into a new snapshot and prune
    /// the ring down to capacity. Returns the snapshot directory.
    pub fn snapshot(&self, target: &Path, reason: &str) -> Result<PathBuf> {
        let contents = fs::read(target)
            .with_context(|| format!("reading {} for snapshot", target.display()))?;
        let mode = fs::metadata(target)?.permissions().mode();

        let bucket = self.bucket_dir(target);
        fs::create_dir_all(&bucket)?;

        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let mut dir = bucket.join(format!("{stamp}_{}", sanitize(reason)));
        // Same-second collision: suffix keeps names unique and ordered.
        let mut attempt = 1;
        while dir.exists() {
            attempt += 1;
            dir = bucket.join(format!("{stamp}_{}_{attempt}", sanitize(reason)));
        }
        fs::create_dir(&dir)?;

        let file_name = target
            .file_name()
            .context("snapshot target has no file name")?;
        let copy_path = dir.join(file_name);
        fs::write(&copy_path, &contents)?;
        fs::set_permissions(&copy_path, fs::Permissions::from_mode(mode))?;
        // Flush the copy so a crash right after apply still has the backup.
        fs::File::open(&copy_path)?.sync_all()?;

        self.prune(&bucket)?;
        log::info!(
            "[Backup] captured {} -> {}",
            target.display(),
            dir.display()
        );
        Ok(dir)
    }

    /// Most recent snapshot for `target`, if any.
    pub fn latest(&self, target: &Path) -> Result<Option<Snapshot>> {
        Ok(self.entries(target)?.pop())
    }

    /// All snapshots for `target`, eldest first.
    pub fn entries(&self, target: &Path) -> Result<Vec<Snapshot>> {
        let bucket = self.bucket_dir(target);
        if !bucket.exists() {
            return Ok(Vec::new());
        }
        let file_name = target
            .file_name()
            .context("snapshot target has no file name")?;

        let mut dirs: Vec<PathBuf> = fs::read_dir(&bucket)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        let mut snapshots = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let copy_path = dir.join(file_name);
            let contents = fs::read(&copy_path)
                .with_context(|| format!("reading snapshot {}", copy_path.display()))?;
            let mode = fs::metadata(&copy_path)?.permissions().mode();
            snapshots.push(Snapshot {
                dir,
                contents,
                mode,
            });
        }
        Ok(snapshots)
    }

    /// Restore `snapshot` over `target` (atomic replace, mode preserved).
    pub fn restore(&self, target: &Path, snapshot: &Snapshot) -> Result<()> {
        crate::agent::apply::write_atomic(target, &snapshot.contents, Some(snapshot.mode))
            .with_context(|| format!("restoring {}", target.display()))?;
        log::info!(
            "[Backup] restored {} from {}",
            target.display(),
            snapshot.dir.display()
        );
        Ok(())
    }

    fn prune(&self, bucket: &Path) -> Result<()> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(bucket)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        while dirs.len() > self.capacity {
            let eldest = dirs.remove(0);
            log::debug!("[Backup] evicting {}", eldest.display());
            fs::remove_dir_all(&eldest)?;
        }
        Ok(())
    }

    /// Per-file bucket: readable stem plus a short path hash to keep
    /// distinct files with the same name apart.
    fn bucket_dir(&self, target: &Path) -> PathBuf {
        let stem = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".to_string());
        let mut hasher = Sha256::new();
        hasher.update(target.as_os_str().as_encoded_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.root.join(format!("{}_{}", sanitize(&stem), &digest[..8]))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
