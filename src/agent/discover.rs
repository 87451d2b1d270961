//! Proxy process discovery.
//!
//! The rest of the agent only depends on the [`ProxyDiscovery`] trait; the
//! default implementation scans `/proc` for processes whose binary looks
//! like a reverse proxy. Version and config-path detection are best-effort.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::proto::DiscoveredProxy;

/// Binary names treated as proxy processes by the `/proc` scanner.
const PROXY_BINARY_NAMES: &[&str] = &["nginx", "openresty", "haproxy", "envoy"];

/// Discovery seam. The agent polls this on the heartbeat path.
pub trait ProxyDiscovery: Send + Sync {
    /// Enumerate local proxy processes.
    fn discover(&self) -> Result<Vec<DiscoveredProxy>>;
}

/// `/proc`-scanning discovery for Linux hosts.
#[derive(Debug, Default)]
pub struct ProcScanner;

impl ProxyDiscovery for ProcScanner {
    fn discover(&self) -> Result<Vec<DiscoveredProxy>> {
        let mut found = Vec::new();
        for entry in fs::read_dir("/proc")? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Some(proxy) = inspect_pid(&entry.path(), pid) else {
                continue;
            };
            found.push(proxy);
        }
        // Master processes first, stable order for heartbeat diffing.
        found.sort_by_key(|p| p.pid);
        Ok(found)
    }
}

/// Read one `/proc/<pid>` entry; `None` unless it is a proxy master/worker
/// we can see.
fn inspect_pid(proc_dir: &Path, pid: u32) -> Option<DiscoveredProxy> {
    let exe = fs::read_link(proc_dir.join("exe")).ok()?;
    let file_name = exe.file_name()?.to_str()?;
    // The kernel appends " (deleted)" after an upgrade-in-place.
    let base = file_name.strip_suffix(" (deleted)").unwrap_or(file_name);
    if !PROXY_BINARY_NAMES.iter().any(|n| base == *n) {
        return None;
    }

    let cmdline = fs::read(proc_dir.join("cmdline")).unwrap_or_default();
    let args: Vec<String> = cmdline
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();

    Some(DiscoveredProxy {
        pid,
        binary_path: exe.display().to_string(),
        version: None,
        config_path: config_path_from_args(&args),
    })
}

/// Pull `-c <path>` out of the process arguments when present.
fn config_path_from_args(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-c" {
            return iter.next().cloned();
        }
        if let Some(path) = arg.strip_prefix("-c") {
            if !path.is_empty() {
                return Some(path.to_string());
            }
        }
    }
    None
}

/// Ask the proxy binary for its version (`-v` prints to stderr).
pub async fn detect_version(binary: &Path) -> Option<String> {
    let output = tokio::process::Command::new(binary)
        .arg("-v")
        .output()
        .await
        .ok()?;
    let text = String::from_utf8_lossy(&output.stderr);
    parse_version_line(&text)
}

/// `nginx version: nginx/1.24.0` → `1.24.0`.
fn parse_version_line(text: &str) -> Option<String> {
    let line = text.lines().next()?;
    let after_slash = line.rsplit('/').next()?;
    let version: String = after_slash
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

/// Fixed discovery result, for tests and non-Linux development hosts.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    pub proxies: Vec<DiscoveredProxy>,
}

impl ProxyDiscovery for StaticDiscovery {
    fn discover(&self) -> Result<Vec<DiscoveredProxy>> {
        Ok(self.proxies.clone())
    }
}
