//! Ingest pipeline: normalize envelopes, batch per kind, flush to sinks.
//!
//! Telemetry envelopes are buffered in memory keyed by kind and flushed to
//! the store sink when a batch reaches `batch_size` or `flush_interval`
//! elapses, whichever comes first. A failed flush retries with backoff up
//! to five attempts, then the batch is dropped and counted. Acks to agents
//! are decoupled from sink success: an envelope is "durably received" the
//! moment it sits in the flush buffer — a deliberate throughput trade-off.
//!
//! The optional event bus receives a best-effort copy that never blocks
//! the main path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::gateway::sink::{BatchSink, IngestRow};
use crate::proto::{Envelope, EnvelopePayload};
use crate::retry::Backoff;

/// Flush retry attempts before a batch is dropped.
const MAX_FLUSH_ATTEMPTS: u32 = 5;

/// Depth of the submit channel between connections and the batcher.
const SUBMIT_QUEUE_DEPTH: usize = 16 * 1024;

/// Handle connections use to feed the batcher.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<Envelope>,
    dropped_batches: Arc<AtomicU64>,
}

impl IngestHandle {
    /// Hand an envelope to the batcher. Blocks only when the submit queue
    /// is full (batcher stalled far past the sink's retry window).
    pub async fn submit(&self, envelope: Envelope) {
        if self.tx.send(envelope).await.is_err() {
            log::error!("[Ingest] batcher gone; envelope dropped");
        }
    }

    /// Batches dropped after exhausting flush retries.
    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }
}

/// Batcher configuration (subset of gateway config).
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

/// Spawn the batcher task. Returns the submit handle and the join handle.
pub fn spawn(
    options: IngestOptions,
    store: Arc<dyn BatchSink>,
    bus: Option<Arc<dyn BatchSink>>,
    shutdown: watch::Receiver<bool>,
) -> (IngestHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
    let dropped_batches = Arc::new(AtomicU64::new(0));
    let handle = IngestHandle {
        tx,
        dropped_batches: Arc::clone(&dropped_batches),
    };
    let task = tokio::spawn(batcher(options, store, bus, rx, dropped_batches, shutdown));
    (handle, task)
}

async fn batcher(
    options: IngestOptions,
    store: Arc<dyn BatchSink>,
    bus: Option<Arc<dyn BatchSink>>,
    mut rx: mpsc::Receiver<Envelope>,
    dropped_batches: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batches: HashMap<&'static str, Vec<IngestRow>> = HashMap::new();
    let mut ticker = tokio::time::interval(options.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                if let Some((kind, row)) = normalize(envelope) {
                    let batch = batches.entry(kind).or_default();
                    batch.push(row);
                    if batch.len() >= options.batch_size {
                        let full = std::mem::take(batch);
                        flush(kind, full, &store, bus.as_ref(), &dropped_batches).await;
                    }
                }
            }
            _ = ticker.tick() => {
                flush_all(&mut batches, &store, bus.as_ref(), &dropped_batches).await;
            }
            _ = shutdown.changed() => {
                log::info!("[Ingest] draining on shutdown");
                // Drain whatever is already queued, then flush once.
                while let Ok(envelope) = rx.try_recv() {
                    if let Some((kind, row)) = normalize(envelope) {
                        batches.entry(kind).or_default().push(row);
                    }
                }
                flush_all(&mut batches, &store, bus.as_ref(), &dropped_batches).await;
                return;
            }
        }
    }
    flush_all(&mut batches, &store, bus.as_ref(), &dropped_batches).await;
}

/// Convert a telemetry envelope into a batch row. Heartbeats, command
/// results, and exec frames never reach the sinks.
fn normalize(envelope: Envelope) -> Option<(&'static str, IngestRow)> {
    let kind = envelope.payload.kind_str();
    let body = match &envelope.payload {
        EnvelopePayload::LogRecord(record) => serde_json::to_value(record),
        EnvelopePayload::ProxyMetric(metric) => serde_json::to_value(metric),
        EnvelopePayload::SystemMetric(metric) => serde_json::to_value(metric),
        _ => return None,
    }
    .ok()?;
    Some((
        kind,
        IngestRow {
            agent_id: envelope.agent_id,
            sequence: envelope.sequence,
            body,
        },
    ))
}

async fn flush_all(
    batches: &mut HashMap<&'static str, Vec<IngestRow>>,
    store: &Arc<dyn BatchSink>,
    bus: Option<&Arc<dyn BatchSink>>,
    dropped_batches: &Arc<AtomicU64>,
) {
    for (&kind, batch) in batches.iter_mut() {
        if batch.is_empty() {
            continue;
        }
        let full = std::mem::take(batch);
        flush(kind, full, store, bus, dropped_batches).await;
    }
}

/// Write one batch: best-effort bus copy first (never awaited), then the
/// store with bounded retries.
async fn flush(
    kind: &'static str,
    batch: Vec<IngestRow>,
    store: &Arc<dyn BatchSink>,
    bus: Option<&Arc<dyn BatchSink>>,
    dropped_batches: &Arc<AtomicU64>,
) {
    if let Some(bus) = bus {
        let bus = Arc::clone(bus);
        let copy = batch.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.write(kind, &copy).await {
                log::debug!("[Ingest] bus write failed (best-effort): {e:#}");
            }
        });
    }

    let mut backoff = Backoff::with_range(Duration::from_millis(100), Duration::from_secs(5));
    for attempt in 1..=MAX_FLUSH_ATTEMPTS {
        match store.write(kind, &batch).await {
            Ok(()) => {
                log::debug!("[Ingest] flushed {} {kind} row(s)", batch.len());
                return;
            }
            Err(e) if attempt < MAX_FLUSH_ATTEMPTS => {
                let delay = backoff.next_delay();
                log::warn!(
                    "[Ingest] {kind} flush attempt {attempt} failed: {e:#}; retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                log::error!(
                    "[Ingest] dropping {} {kind} row(s) after {MAX_FLUSH_ATTEMPTS} attempts: {e:#}",
                    batch.len()
                );
                dropped_batches.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
