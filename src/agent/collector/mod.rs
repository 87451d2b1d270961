//! Telemetry collectors: one worker task per input source.
//!
//! Workers share only the [`TelemetryQueue`], which serializes envelope
//! construction and WAL appends under the buffer's mutex. Collectors never
//! block on the network side: a WAL append failure (disk full) drops that
//! record and increments the drop counter surfaced in heartbeats.

pub mod logtail;
pub mod status;
pub mod system;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{AgentConfig, LogFormat};
use crate::proto::{Envelope, EnvelopePayload, LogType};
use crate::wal::WalBuffer;

use logtail::LogTailer;
use system::SystemSampler;

/// How often tailers poll their files for new lines.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Shared enqueue path from collectors into the WAL.
///
/// Sequence assignment and the append happen under the WAL lock, so the
/// sequence embedded in the envelope always matches the record's position.
pub struct TelemetryQueue {
    wal: Arc<WalBuffer>,
    agent_id: String,
    dropped: AtomicU64,
}

impl TelemetryQueue {
    pub fn new(wal: Arc<WalBuffer>, agent_id: String) -> Self {
        Self {
            wal,
            agent_id,
            dropped: AtomicU64::new(0),
        }
    }

    /// Serialize `payload` into a sequenced envelope and append it.
    ///
    /// Failures are absorbed here: the record is dropped, counted, and
    /// logged. Collectors keep running.
    pub fn enqueue(&self, payload: EnvelopePayload) {
        let kind = payload.kind_str();
        let result = self.wal.append_with(|sequence| {
            let envelope = Envelope {
                sequence,
                agent_id: self.agent_id.clone(),
                payload,
            };
            serde_json::to_vec(&envelope).expect("envelope serialization cannot fail")
        });
        if let Err(e) = result {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::error!("[Collector] dropping {kind} record, WAL append failed: {e}");
        }
    }

    /// Records dropped since startup.
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// The underlying buffer (backlog introspection for heartbeats).
    pub fn wal(&self) -> &Arc<WalBuffer> {
        &self.wal
    }
}

/// Spawn every collector configured for this agent.
///
/// Returns the task handles; each exits once `shutdown` flips to true,
/// finishing its current sample first.
pub fn spawn_all(
    queue: Arc<TelemetryQueue>,
    config: &AgentConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_status_collector(
            Arc::clone(&queue),
            config.status_url.clone(),
            config.metrics_interval(),
            shutdown.clone(),
        ),
        spawn_system_collector(
            Arc::clone(&queue),
            config.metrics_interval(),
            shutdown.clone(),
        ),
        spawn_log_collector(
            Arc::clone(&queue),
            LogTailer::new(&config.access_log_path),
            LogType::Access,
            config.log_format,
            shutdown.clone(),
        ),
        spawn_log_collector(
            queue,
            LogTailer::new(&config.error_log_path),
            LogType::Error,
            config.log_format,
            shutdown,
        ),
    ]
}

/// Scrape the proxy status endpoint on the metrics cadence.
pub fn spawn_status_collector(
    queue: Arc<TelemetryQueue>,
    status_url: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client builds");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match status::scrape(&client, &status_url).await {
                        Ok(metric) => queue.enqueue(EnvelopePayload::ProxyMetric(metric)),
                        Err(e) => log::warn!("[Collector] status scrape failed: {e:#}"),
                    }
                }
                _ = shutdown.changed() => {
                    log::debug!("[Collector] status collector stopping");
                    return;
                }
            }
        }
    })
}

/// Sample host CPU/memory/network on the metrics cadence.
pub fn spawn_system_collector(
    queue: Arc<TelemetryQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sampler = SystemSampler::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sampler.sample() {
                        Ok(metric) => queue.enqueue(EnvelopePayload::SystemMetric(metric)),
                        Err(e) => log::warn!("[Collector] system sample failed: {e:#}"),
                    }
                }
                _ = shutdown.changed() => {
                    log::debug!("[Collector] system collector stopping");
                    return;
                }
            }
        }
    })
}

/// Tail one log file, parsing each complete line into a record.
pub fn spawn_log_collector(
    queue: Arc<TelemetryQueue>,
    mut tailer: LogTailer,
    log_type: LogType,
    format: LogFormat,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TAIL_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let lines = match tailer.poll() {
                        Ok(lines) => lines,
                        Err(e) => {
                            log::warn!(
                                "[Collector] tail of {} failed: {e:#}",
                                tailer.path().display()
                            );
                            continue;
                        }
                    };
                    for line in lines {
                        let record = match log_type {
                            LogType::Access => logtail::parse_access_line(&line, format),
                            LogType::Error => logtail::parse_error_line(&line),
                        };
                        queue.enqueue(EnvelopePayload::LogRecord(record));
                    }
                }
                _ = shutdown.changed() => {
                    log::debug!(
                        "[Collector] tail of {} stopping",
                        tailer.path().display()
                    );
                    return;
                }
            }
        }
    })
}
