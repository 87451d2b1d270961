//! Fleet registry: per-agent identity pinning, liveness, and eviction.
//!
//! One entry per `agent_id`. Identity is pinned at first hello; a
//! fingerprint mismatch on a later hello is rejected. A new stream from a
//! valid identity supersedes the previous one (the old connection notices
//! its command channel closing). The background sweeper marks agents
//! Evicted once silent past the retention window and removes entries that
//! stay Evicted for another window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::proto::{AgentIdentity, DiscoveredProxy};

/// Stream state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Connected,
    Idle,
    Evicted,
}

/// Why a hello was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error("identity fingerprint mismatch for pinned agent {0}")]
    IdentityMismatch(String),
    #[error("gateway is shutting down")]
    ShuttingDown,
}

/// One agent's registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEntry {
    pub agent_id: String,
    pub identity: AgentIdentity,
    pub last_seen_unix_ns: u64,
    pub address: String,
    pub discovered_proxies: Vec<DiscoveredProxy>,
    pub agent_version: String,
    pub last_ack_sequence: u64,
    pub stream_state: StreamState,
    /// Set when the entry transitioned to Evicted (drives removal).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evicted_at_unix_ns: Option<u64>,
    /// Last error reported for this agent (degraded files, halts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Connection epoch; bumped on every accepted hello.
    #[serde(skip)]
    pub epoch: u64,
}

/// Outcome of an accepted hello.
#[derive(Debug, Clone, Copy)]
pub struct HelloOutcome {
    /// First sequence the gateway expects on this connection.
    pub resume_from_sequence: u64,
    /// Epoch token identifying this connection in the entry.
    pub epoch: u64,
    /// True when a previous live stream was superseded.
    pub superseded: bool,
}

/// How an observed telemetry sequence relates to the dedup cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceObservation {
    /// Next expected sequence.
    Fresh,
    /// At-least-once replay; ack but do not ingest again.
    Duplicate,
    /// Jumped past the expected value; ingested, gap reported.
    Gap { expected: u64 },
}

/// The fleet table. Readers dominate (liveness queries, UI snapshots).
pub struct Registry {
    entries: RwLock<HashMap<String, AgentEntry>>,
    retention: Duration,
}

impl Registry {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Validate and register a hello. Pins identity on first contact.
    pub async fn on_hello(
        &self,
        identity: &AgentIdentity,
        address: String,
        agent_version: String,
        discovered_proxies: Vec<DiscoveredProxy>,
        agent_last_ack: u64,
    ) -> Result<HelloOutcome, RejectReason> {
        let agent_id = identity.agent_id();
        let mut entries = self.entries.write().await;

        match entries.get_mut(&agent_id) {
            Some(entry) => {
                if entry.identity.agent_key_fingerprint != identity.agent_key_fingerprint {
                    return Err(RejectReason::IdentityMismatch(agent_id));
                }
                let superseded = entry.stream_state == StreamState::Connected;
                if superseded {
                    log::warn!(
                        "[Registry] {agent_id} reconnected while Connected; superseding previous stream"
                    );
                }
                entry.identity = identity.clone();
                entry.address = address;
                entry.agent_version = agent_version;
                entry.discovered_proxies = discovered_proxies;
                entry.stream_state = StreamState::Connected;
                entry.evicted_at_unix_ns = None;
                entry.last_seen_unix_ns = now_ns();
                entry.epoch += 1;
                Ok(HelloOutcome {
                    resume_from_sequence: entry.last_ack_sequence + 1,
                    epoch: entry.epoch,
                    superseded,
                })
            }
            None => {
                log::info!("[Registry] new agent {agent_id} from {address}");
                entries.insert(
                    agent_id.clone(),
                    AgentEntry {
                        agent_id,
                        identity: identity.clone(),
                        last_seen_unix_ns: now_ns(),
                        address,
                        discovered_proxies,
                        agent_version,
                        last_ack_sequence: agent_last_ack,
                        stream_state: StreamState::Connected,
                        evicted_at_unix_ns: None,
                        last_error: None,
                        epoch: 1,
                    },
                );
                Ok(HelloOutcome {
                    resume_from_sequence: agent_last_ack + 1,
                    epoch: 1,
                    superseded: false,
                })
            }
        }
    }

    /// Bump liveness on any inbound envelope.
    pub async fn on_envelope(&self, agent_id: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(agent_id) {
            entry.last_seen_unix_ns = now_ns();
        }
    }

    /// Update the fleet model from a heartbeat.
    pub async fn on_heartbeat(
        &self,
        agent_id: &str,
        proxies: Vec<DiscoveredProxy>,
        agent_version: String,
        degraded_files: &[String],
    ) {
        if let Some(entry) = self.entries.write().await.get_mut(agent_id) {
            entry.last_seen_unix_ns = now_ns();
            entry.discovered_proxies = proxies;
            entry.agent_version = agent_version;
            entry.last_error = if degraded_files.is_empty() {
                None
            } else {
                Some(format!("degraded config files: {}", degraded_files.join(", ")))
            };
        }
    }

    /// Dedup/gap bookkeeping for a sequenced telemetry envelope.
    pub async fn observe_sequence(&self, agent_id: &str, sequence: u64) -> SequenceObservation {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(agent_id) else {
            return SequenceObservation::Fresh;
        };
        entry.last_seen_unix_ns = now_ns();

        if sequence <= entry.last_ack_sequence {
            return SequenceObservation::Duplicate;
        }
        let expected = entry.last_ack_sequence + 1;
        entry.last_ack_sequence = sequence;
        if sequence == expected {
            SequenceObservation::Fresh
        } else {
            SequenceObservation::Gap { expected }
        }
    }

    /// Mark the stream Idle; the entry is kept.
    pub async fn on_disconnect(&self, agent_id: &str, epoch: u64) {
        if let Some(entry) = self.entries.write().await.get_mut(agent_id) {
            if entry.epoch != epoch {
                // A newer connection superseded this one; nothing to do.
                return;
            }
            if entry.stream_state == StreamState::Connected {
                entry.stream_state = StreamState::Idle;
                log::info!("[Registry] {agent_id} disconnected");
            }
        }
    }

    /// One sweep: evict the silent, remove the long-evicted.
    ///
    /// Returns the ids evicted or removed in this pass.
    pub async fn sweep(&self) -> Vec<String> {
        let now = now_ns();
        let retention_ns = self.retention.as_nanos() as u64;
        let mut touched = Vec::new();
        let mut entries = self.entries.write().await;

        entries.retain(|agent_id, entry| {
            if let Some(evicted_at) = entry.evicted_at_unix_ns {
                if now.saturating_sub(evicted_at) > retention_ns {
                    log::info!("[Registry] removing long-evicted {agent_id}");
                    touched.push(agent_id.clone());
                    return false;
                }
            }
            true
        });

        for (agent_id, entry) in entries.iter_mut() {
            if entry.stream_state != StreamState::Evicted
                && now.saturating_sub(entry.last_seen_unix_ns) > retention_ns
            {
                log::warn!("[Registry] evicting {agent_id}: silent past retention window");
                entry.stream_state = StreamState::Evicted;
                entry.evicted_at_unix_ns = Some(now);
                touched.push(agent_id.clone());
            }
        }
        touched
    }

    /// Run [`Registry::sweep`] every `interval` until shutdown.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let touched = registry.sweep().await;
                        if !touched.is_empty() {
                            log::info!("[Registry] sweep touched {} entr(ies)", touched.len());
                        }
                    }
                    _ = shutdown.changed() => {
                        log::debug!("[Registry] sweeper stopping");
                        return;
                    }
                }
            }
        })
    }

    /// Full fleet snapshot for the UI layer.
    pub async fn snapshot(&self) -> Vec<AgentEntry> {
        let entries = self.entries.read().await;
        let mut list: Vec<AgentEntry> = entries.values().cloned().collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }

    /// Look up one entry.
    pub async fn get(&self, agent_id: &str) -> Option<AgentEntry> {
        self.entries.read().await.get(agent_id).cloned()
    }

    /// Stream state for `agent_id`, if known.
    pub async fn stream_state(&self, agent_id: &str) -> Option<StreamState> {
        self.entries.read().await.get(agent_id).map(|e| e.stream_state)
    }

    /// Test/maintenance hook: rewrite an entry's last-seen timestamp.
    pub async fn set_last_seen(&self, agent_id: &str, last_seen_unix_ns: u64) {
        if let Some(entry) = self.entries.write().await.get_mut(agent_id) {
            entry.last_seen_unix_ns = last_seen_unix_ns;
            entry.stream_state = StreamState::Idle;
        }
    }
}

fn now_ns() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(host: &str, fingerprint: &str) -> AgentIdentity {
        AgentIdentity {
            hostname: host.to_string(),
            primary_ipv4: "10.0.0.1".to_string(),
            agent_key_fingerprint: fingerprint.to_string(),
        }
    }

    async fn hello(registry: &Registry, id: &AgentIdentity) -> Result<HelloOutcome, RejectReason> {
        registry
            .on_hello(id, "10.0.0.1:55555".into(), "0.4.1".into(), vec![], 0)
            .await
    }

    #[tokio::test]
    async fn test_first_hello_registers_and_pins() {
        let registry = Registry::new(Duration::from_secs(3600));
        let id = identity("web-01", "aabbccddeeff0011");
        let outcome = hello(&registry, &id).await.unwrap();
        assert_eq!(outcome.resume_from_sequence, 1);
        assert!(!outcome.superseded);

        let entry = registry.get(&id.agent_id()).await.unwrap();
        assert_eq!(entry.stream_state, StreamState::Connected);
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_rejected() {
        let registry = Registry::new(Duration::from_secs(3600));
        let id = identity("web-01", "aabbccddeeff0011");
        hello(&registry, &id).await.unwrap();

        // Same hostname and fingerprint prefix (same agent_id), different key.
        let imposter = identity("web-01", "aabbccddeeff0022");
        assert_eq!(imposter.agent_id(), id.agent_id());
        let err = hello(&registry, &imposter).await.unwrap_err();
        assert!(matches!(err, RejectReason::IdentityMismatch(_)));
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_and_bumps_epoch() {
        let registry = Registry::new(Duration::from_secs(3600));
        let id = identity("web-01", "aabbccddeeff0011");
        let first = hello(&registry, &id).await.unwrap();
        let second = hello(&registry, &id).await.unwrap();
        assert!(second.superseded);
        assert!(second.epoch > first.epoch);

        // The stale connection's disconnect must not mark the entry Idle.
        registry.on_disconnect(&id.agent_id(), first.epoch).await;
        assert_eq!(
            registry.stream_state(&id.agent_id()).await,
            Some(StreamState::Connected)
        );

        registry.on_disconnect(&id.agent_id(), second.epoch).await;
        assert_eq!(
            registry.stream_state(&id.agent_id()).await,
            Some(StreamState::Idle)
        );
    }

    #[tokio::test]
    async fn test_resume_continues_from_acked_sequence() {
        let registry = Registry::new(Duration::from_secs(3600));
        let id = identity("web-01", "aabbccddeeff0011");
        hello(&registry, &id).await.unwrap();
        let agent_id = id.agent_id();

        assert_eq!(
            registry.observe_sequence(&agent_id, 1).await,
            SequenceObservation::Fresh
        );
        assert_eq!(
            registry.observe_sequence(&agent_id, 2).await,
            SequenceObservation::Fresh
        );

        let outcome = hello(&registry, &id).await.unwrap();
        assert_eq!(outcome.resume_from_sequence, 3);
    }

    #[tokio::test]
    async fn test_sequence_dedup_and_gap() {
        let registry = Registry::new(Duration::from_secs(3600));
        let id = identity("web-01", "aabbccddeeff0011");
        hello(&registry, &id).await.unwrap();
        let agent_id = id.agent_id();

        assert_eq!(
            registry.observe_sequence(&agent_id, 1).await,
            SequenceObservation::Fresh
        );
        assert_eq!(
            registry.observe_sequence(&agent_id, 1).await,
            SequenceObservation::Duplicate
        );
        assert_eq!(
            registry.observe_sequence(&agent_id, 5).await,
            SequenceObservation::Gap { expected: 2 }
        );
        // After the gap, the cursor adopts the observed sequence.
        assert_eq!(
            registry.observe_sequence(&agent_id, 6).await,
            SequenceObservation::Fresh
        );
    }

    #[tokio::test]
    async fn test_sweep_evicts_then_removes() {
        let registry = Registry::new(Duration::from_secs(10));
        let id = identity("web-01", "aabbccddeeff0011");
        hello(&registry, &id).await.unwrap();
        let agent_id = id.agent_id();

        // Nothing happens while fresh.
        assert!(registry.sweep().await.is_empty());

        // Simulate silence past the retention window.
        let stale = now_ns() - Duration::from_secs(11).as_nanos() as u64;
        registry.set_last_seen(&agent_id, stale).await;
        let touched = registry.sweep().await;
        assert_eq!(touched, vec![agent_id.clone()]);
        assert_eq!(
            registry.stream_state(&agent_id).await,
            Some(StreamState::Evicted)
        );

        // Entry survives until it has been Evicted for a full window.
        assert!(registry.get(&agent_id).await.is_some());

        // Force the evicted-at stamp into the past and sweep again.
        {
            let mut entries = registry.entries.write().await;
            entries.get_mut(&agent_id).unwrap().evicted_at_unix_ns = Some(stale);
        }
        let touched = registry.sweep().await;
        assert_eq!(touched, vec![agent_id.clone()]);
        assert!(registry.get(&agent_id).await.is_none());
    }
}
