//! Agent identity: stable across restarts, pinned by the gateway.
//!
//! The identity is `{hostname, primary_ipv4, agent_key_fingerprint}`. The
//! fingerprint is the SHA-256 of a random key generated on first run and
//! persisted (0600) under the config directory, so reinstalls on the same
//! host keep the same fleet identity as long as the key file survives.

use std::fs;
use std::net::UdpSocket;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::proto::AgentIdentity;

/// File name of the persisted agent key inside the config dir.
const KEY_FILE: &str = "agent.key";

/// Load the identity, generating and persisting the key on first run.
///
/// # Errors
///
/// Returns an error if the config directory is unwritable or the hostname
/// cannot be determined.
pub fn load_or_create(config_dir: &Path) -> Result<AgentIdentity> {
    let key = load_or_create_key(config_dir)?;

    let mut hasher = Sha256::new();
    hasher.update(&key);
    let fingerprint = format!("{:x}", hasher.finalize());

    let hostname = hostname::get()
        .context("could not determine hostname")?
        .to_string_lossy()
        .into_owned();

    Ok(AgentIdentity {
        hostname,
        primary_ipv4: primary_ipv4(),
        agent_key_fingerprint: fingerprint,
    })
}

/// Read the persisted key, or generate 32 random bytes and save them 0600.
fn load_or_create_key(config_dir: &Path) -> Result<Vec<u8>> {
    let path = config_dir.join(KEY_FILE);
    if path.exists() {
        return fs::read(&path).with_context(|| format!("reading {}", path.display()));
    }

    fs::create_dir_all(config_dir)?;
    // Two v4 UUIDs give 32 bytes of OS randomness without an extra dep.
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());

    fs::write(&path, &key).with_context(|| format!("writing {}", path.display()))?;
    #[cfg(unix)]
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

    log::info!("[Identity] generated new agent key at {}", path.display());
    Ok(key)
}

/// Best-effort primary IPv4: the source address the OS would route to a
/// public destination. No packet is sent. Falls back to loopback.
fn primary_ipv4() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}
