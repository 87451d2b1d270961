//! Agent ↔ gateway stream client.
//!
//! Maintains exactly one logical bidirectional stream, multiplexing
//! outbound telemetry (WAL-backed, sequenced, acknowledged) and direct
//! envelopes (heartbeats, command results, exec frames) with inbound
//! commands.
//!
//! State machine:
//!
//! ```text
//! Idle ──connect──> Connecting ──hello ok──> Registered ──> Streaming
//!   ^                    │                                      │
//!   │                    └──hello rejected──> Halted            │
//!   └──────────── disconnect / error ───────────────────────────┘
//! ```
//!
//! The producer side keeps at most `in_flight_window` unacknowledged
//! envelopes on the wire, reading ahead of the WAL cursor; acknowledgements
//! advance the durable cursor. Unacked records survive in the WAL and are
//! replayed on the next registration — at-least-once, deduplicated by the
//! gateway on `(agent_id, sequence)`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::agent::apply::ConfigApplier;
use crate::agent::collector::TelemetryQueue;
use crate::agent::discover::ProxyDiscovery;
use crate::agent::health::AgentHealth;
use crate::agent::update::VERSION;
use crate::proto::framing::{read_frame, write_frame, FrameDecoder};
use crate::proto::{
    AgentIdentity, ClientFrame, Command, Envelope, EnvelopePayload, Heartbeat, Hello, ServerFrame,
};
use crate::retry::Backoff;
use crate::wal::{WalBuffer, WalError};

/// TCP connect timeout per gateway candidate.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the gateway's hello reply.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Drain window for acknowledged-prefix flushing on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Connection-independent stream settings.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Ordered gateway candidates; first reachable wins.
    pub addresses: Vec<String>,
    /// Idle interval before a heartbeat is emitted.
    pub heartbeat_interval: Duration,
    /// Maximum unacknowledged envelopes on the wire.
    pub in_flight_window: usize,
    pub identity: AgentIdentity,
}

/// Why a streaming session ended.
enum SessionEnd {
    /// Orderly shutdown; the supervisor exits.
    Shutdown,
    /// Hello rejected or the buffer is unusable; do not retry.
    Halted,
    /// I/O error or EOF; the supervisor reconnects with backoff.
    Disconnected,
}

/// The long-lived stream client. [`StreamClient::run`] is the supervisor
/// loop; it owns reconnection and only returns on shutdown or halt.
pub struct StreamClient {
    options: StreamOptions,
    agent_id: String,
    wal: Arc<WalBuffer>,
    queue: Arc<TelemetryQueue>,
    applier: Arc<ConfigApplier>,
    discovery: Arc<dyn ProxyDiscovery>,
    health: Arc<AgentHealth>,
    command_tx: UnboundedSender<Command>,
    direct_rx: UnboundedReceiver<Envelope>,
    shutdown: watch::Receiver<bool>,
}

impl StreamClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: StreamOptions,
        wal: Arc<WalBuffer>,
        queue: Arc<TelemetryQueue>,
        applier: Arc<ConfigApplier>,
        discovery: Arc<dyn ProxyDiscovery>,
        health: Arc<AgentHealth>,
        command_tx: UnboundedSender<Command>,
        direct_rx: UnboundedReceiver<Envelope>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let agent_id = options.identity.agent_id();
        Self {
            options,
            agent_id,
            wal,
            queue,
            applier,
            discovery,
            health,
            command_tx,
            direct_rx,
            shutdown,
        }
    }

    /// Supervisor loop: connect, stream, reconnect with jittered backoff.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new();
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.health.set_stream_state("connecting");

            let end = match self.session(&mut backoff).await {
                Ok(end) => end,
                Err(e) => {
                    log::warn!("[Stream] session error: {e:#}");
                    self.health.set_last_error(Some(format!("{e:#}")));
                    SessionEnd::Disconnected
                }
            };

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Halted => {
                    self.health.set_stream_state("halted");
                    log::error!("[Stream] halted; operator intervention required");
                    return;
                }
                SessionEnd::Disconnected => {
                    self.health.set_stream_state("idle");
                    let delay = backoff.next_delay();
                    log::info!("[Stream] reconnecting in {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
            }
        }
        self.health.set_stream_state("stopped");
        log::info!("[Stream] client stopped");
    }

    /// One connect → hello → streaming cycle.
    async fn session(&mut self, backoff: &mut Backoff) -> Result<SessionEnd> {
        let stream = self.connect_any().await?;
        stream.set_nodelay(true).ok();
        let (mut reader, mut writer) = stream.into_split();

        // Hello / resume negotiation.
        let proxies = self.discovery.discover().unwrap_or_else(|e| {
            log::warn!("[Stream] discovery failed: {e:#}");
            Vec::new()
        });
        let hello = ClientFrame::Hello(Hello {
            identity: self.options.identity.clone(),
            agent_version: VERSION.to_string(),
            discovered_proxies: proxies,
            last_ack_sequence: self.wal.cursor_sequence(),
        });
        write_frame(&mut writer, &hello).await?;

        let first = tokio::time::timeout(HELLO_TIMEOUT, read_frame::<_, ServerFrame>(&mut reader))
            .await
            .context("timed out waiting for hello reply")??;
        match first {
            Some(ServerFrame::HelloAck(ack)) => {
                let expected = self.wal.cursor_sequence() + 1;
                if ack.resume_from_sequence != expected {
                    // Either the gateway lags our cursor (it will adopt the
                    // first received sequence) or it is ahead of a reset
                    // cursor (replay; the gateway dedups).
                    log::warn!(
                        "[Stream] gateway resumes from {} but cursor expects {expected}; streaming from cursor",
                        ack.resume_from_sequence
                    );
                }
                log::info!("[Stream] registered as {}", self.agent_id);
            }
            Some(ServerFrame::Reject(reject)) => {
                log::error!("[Stream] hello rejected: {}", reject.reason);
                self.health
                    .set_last_error(Some(format!("hello rejected: {}", reject.reason)));
                return Ok(SessionEnd::Halted);
            }
            Some(other) => bail!("unexpected first frame: {other:?}"),
            None => return Ok(SessionEnd::Disconnected),
        }

        backoff.reset();
        self.health.set_stream_state("streaming");
        self.health.set_last_error(None);
        self.streaming(&mut reader, &mut writer).await
    }

    /// First reachable gateway wins.
    async fn connect_any(&self) -> Result<TcpStream> {
        for address in &self.options.addresses {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => {
                    log::info!("[Stream] connected to {address}");
                    return Ok(stream);
                }
                Ok(Err(e)) => log::warn!("[Stream] connect to {address} failed: {e}"),
                Err(_) => log::warn!("[Stream] connect to {address} timed out"),
            }
        }
        bail!("no gateway reachable")
    }

    /// The streaming phase: producer fill, ack handling, command dispatch,
    /// heartbeats, shutdown drain.
    ///
    /// Inbound bytes go through an incremental [`FrameDecoder`] fed by
    /// plain `read` calls, which are safe to cancel from `select!`.
    async fn streaming<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<SessionEnd>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        use tokio::io::AsyncReadExt;

        // (sequence, next_offset) of envelopes on the wire, oldest first.
        let mut in_flight: VecDeque<(u64, u64)> = VecDeque::new();
        let mut scan_offset = self.wal.read_offset();
        let mut last_outbound = Instant::now();
        let mut decoder = FrameDecoder::new();
        let mut read_buf = vec![0u8; 16 * 1024];
        let mut direct_open = true;

        loop {
            // Producer: fill the window from the WAL read-ahead.
            while in_flight.len() < self.options.in_flight_window {
                match self.wal.read_at(scan_offset) {
                    Ok(Some((bytes, next_offset))) => {
                        match serde_json::from_slice::<Envelope>(&bytes) {
                            Ok(envelope) => {
                                let sequence = envelope.sequence;
                                write_frame(writer, &ClientFrame::Envelope(envelope)).await?;
                                in_flight.push_back((sequence, next_offset));
                                last_outbound = Instant::now();
                            }
                            Err(e) => {
                                log::error!(
                                    "[Stream] undecodable WAL record at {scan_offset}: {e}"
                                );
                                if in_flight.is_empty() {
                                    // At the cursor with nothing pending:
                                    // skip it for good.
                                    self.wal.acknowledge(next_offset)?;
                                }
                            }
                        }
                        scan_offset = next_offset;
                    }
                    Ok(None) => break,
                    Err(e @ WalError::SuspiciousLength { .. }) => {
                        log::error!("[Stream] WAL corrupt: {e}; halting this buffer");
                        self.health.set_last_error(Some(e.to_string()));
                        return Ok(SessionEnd::Halted);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let idle_deadline = last_outbound + self.options.heartbeat_interval;
            tokio::select! {
                read = reader.read(&mut read_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(SessionEnd::Disconnected);
                    }
                    for payload in decoder.feed(&read_buf[..n])? {
                        let frame: ServerFrame = serde_json::from_slice(&payload)
                            .context("decoding server frame")?;
                        match frame {
                            ServerFrame::Ack(ack) => {
                                self.handle_ack(ack.sequence, &mut in_flight)?;
                            }
                            ServerFrame::Command(command) => {
                                if self.command_tx.send(command).is_err() {
                                    bail!("command executor is gone");
                                }
                            }
                            ServerFrame::Reject(reject) => {
                                log::error!("[Stream] rejected mid-stream: {}", reject.reason);
                                self.health.set_last_error(Some(reject.reason));
                                return Ok(SessionEnd::Halted);
                            }
                            ServerFrame::HelloAck(_) => {
                                log::warn!("[Stream] spurious HelloAck ignored");
                            }
                        }
                    }
                }
                direct = self.direct_rx.recv(), if direct_open => {
                    match direct {
                        Some(envelope) => {
                            write_frame(writer, &ClientFrame::Envelope(envelope)).await?;
                            last_outbound = Instant::now();
                        }
                        None => direct_open = false,
                    }
                }
                _ = self.wal.append_notify().notified(),
                    if in_flight.len() < self.options.in_flight_window => {
                    // New WAL data; loop back to the fill phase.
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    let heartbeat = self.heartbeat_envelope();
                    write_frame(writer, &ClientFrame::Envelope(heartbeat)).await?;
                    last_outbound = Instant::now();
                }
                _ = self.shutdown.changed() => {
                    return self.drain_and_close(reader, &mut decoder, in_flight).await;
                }
            }
        }
    }

    /// Acks arrive in wire order; pop the acknowledged prefix and commit
    /// the furthest offset in one durable cursor write.
    fn handle_ack(&self, sequence: u64, in_flight: &mut VecDeque<(u64, u64)>) -> Result<()> {
        let mut committed = None;
        while let Some(&(seq, next_offset)) = in_flight.front() {
            if seq <= sequence {
                committed = Some(next_offset);
                in_flight.pop_front();
            } else {
                break;
            }
        }
        if let Some(next_offset) = committed {
            self.wal.acknowledge(next_offset)?;
        }
        Ok(())
    }

    /// Heartbeats are direct envelopes (never WAL-backed).
    fn heartbeat_envelope(&self) -> Envelope {
        let proxies = self.discovery.discover().unwrap_or_default();
        Envelope::direct(
            self.agent_id.clone(),
            EnvelopePayload::Heartbeat(Heartbeat {
                proxies,
                agent_version: VERSION.to_string(),
                cursor_backlog_bytes: self.wal.backlog_bytes(),
                dropped_records: self.queue.dropped_records(),
                degraded_files: self.applier.degraded_files(),
            }),
        )
    }

    /// Shutdown path: wait up to the grace window for outstanding acks so
    /// the cursor lands on an acknowledged prefix, then close.
    async fn drain_and_close<R>(
        &self,
        reader: &mut R,
        decoder: &mut FrameDecoder,
        mut in_flight: VecDeque<(u64, u64)>,
    ) -> Result<SessionEnd>
    where
        R: AsyncRead + Unpin,
    {
        use tokio::io::AsyncReadExt;

        self.health.set_stream_state("halting");
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        let mut read_buf = vec![0u8; 16 * 1024];
        'drain: while !in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!(
                    "[Stream] grace window elapsed with {} envelopes unacked; they will replay",
                    in_flight.len()
                );
                break;
            }
            match tokio::time::timeout(remaining, reader.read(&mut read_buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => {
                    let payloads = match decoder.feed(&read_buf[..n]) {
                        Ok(payloads) => payloads,
                        Err(_) => break,
                    };
                    for payload in payloads {
                        if let Ok(ServerFrame::Ack(ack)) =
                            serde_json::from_slice::<ServerFrame>(&payload)
                        {
                            self.handle_ack(ack.sequence, &mut in_flight)?;
                            if in_flight.is_empty() {
                                break 'drain;
                            }
                        }
                    }
                }
            }
        }
        Ok(SessionEnd::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::apply::{ConfigApplier, ProxyControl};
    use crate::agent::backup::BackupRing;
    use crate::agent::discover::StaticDiscovery;
    use crate::proto::{Ack, HelloAck, Reject};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct Harness {
        wal: Arc<WalBuffer>,
        queue: Arc<TelemetryQueue>,
        health: Arc<AgentHealth>,
        shutdown_tx: watch::Sender<bool>,
        direct_tx: UnboundedSender<Envelope>,
        command_rx: UnboundedReceiver<Command>,
        client: Option<StreamClient>,
    }

    fn harness(dir: &TempDir, addresses: Vec<String>, window: usize) -> Harness {
        let wal = Arc::new(WalBuffer::open(&dir.path().join("buf")).unwrap());
        let queue = Arc::new(TelemetryQueue::new(Arc::clone(&wal), "host-1-fp".into()));
        let health = Arc::new(AgentHealth::new());
        let control = ProxyControl {
            validate: vec!["true".into()],
            reload: vec!["true".into()],
            restart: vec!["true".into()],
            stop: vec!["true".into()],
        };
        let applier = Arc::new(ConfigApplier::new(
            control,
            BackupRing::new(dir.path().join("backups"), 10),
            dir.path(),
        ));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let identity = AgentIdentity {
            hostname: "host-1".into(),
            primary_ipv4: "127.0.0.1".into(),
            agent_key_fingerprint: "fp".repeat(16),
        };
        let client = StreamClient::new(
            StreamOptions {
                addresses,
                heartbeat_interval: Duration::from_millis(200),
                in_flight_window: window,
                identity,
            },
            Arc::clone(&wal),
            Arc::clone(&queue),
            applier,
            Arc::new(StaticDiscovery::default()),
            Arc::clone(&health),
            command_tx,
            direct_rx,
            shutdown_rx,
        );

        Harness {
            wal,
            queue,
            health,
            shutdown_tx,
            direct_tx,
            command_rx,
            client: Some(client),
        }
    }

    async fn accept_and_hello(listener: &TcpListener) -> (TcpStream, Hello) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let frame: ClientFrame = read_frame(&mut stream).await.unwrap().unwrap();
        let hello = match frame {
            ClientFrame::Hello(hello) => hello,
            other => panic!("expected Hello, got {other:?}"),
        };
        let resume = HelloAck {
            resume_from_sequence: hello.last_ack_sequence + 1,
        };
        write_frame(&mut stream, &ServerFrame::HelloAck(resume))
            .await
            .unwrap();
        (stream, hello)
    }

    async fn read_envelope(stream: &mut TcpStream) -> Envelope {
        let frame: ClientFrame =
            tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
                .await
                .expect("frame within timeout")
                .unwrap()
                .expect("stream open");
        match frame {
            ClientFrame::Envelope(envelope) => envelope,
            other => panic!("expected Envelope, got {other:?}"),
        }
    }

    /// Next WAL-backed envelope, skipping interleaved heartbeats.
    async fn read_sequenced_envelope(stream: &mut TcpStream) -> Envelope {
        loop {
            let envelope = read_envelope(stream).await;
            if envelope.is_sequenced() {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn test_streams_wal_records_in_order_and_commits_cursor() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut h = harness(&dir, vec![addr], 8);

        for label in ["A", "B", "C"] {
            h.queue.enqueue(EnvelopePayload::LogRecord(crate::proto::LogRecord {
                raw: Some(label.to_string()),
                ..Default::default()
            }));
        }

        let client = h.client.take().unwrap();
        let run = tokio::spawn(client.run());

        let (mut stream, hello) = accept_and_hello(&listener).await;
        assert_eq!(hello.last_ack_sequence, 0);

        for (i, label) in ["A", "B", "C"].iter().enumerate() {
            let envelope = read_sequenced_envelope(&mut stream).await;
            assert_eq!(envelope.sequence, i as u64 + 1);
            match &envelope.payload {
                EnvelopePayload::LogRecord(record) => {
                    assert_eq!(record.raw.as_deref(), Some(*label));
                }
                other => panic!("unexpected payload {other:?}"),
            }
            write_frame(
                &mut stream,
                &ServerFrame::Ack(Ack {
                    sequence: envelope.sequence,
                }),
            )
            .await
            .unwrap();
        }

        // Acks commit the cursor durably.
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.wal.cursor_sequence() < 3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("cursor advanced");

        h.shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_window_limits_unacked_envelopes() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut h = harness(&dir, vec![addr], 2);

        for i in 0..5 {
            h.queue.enqueue(EnvelopePayload::LogRecord(crate::proto::LogRecord {
                raw: Some(format!("r{i}")),
                ..Default::default()
            }));
        }

        let client = h.client.take().unwrap();
        let run = tokio::spawn(client.run());
        let (mut stream, _) = accept_and_hello(&listener).await;

        // Window of 2: exactly two sequenced envelopes arrive unacked.
        let first = read_sequenced_envelope(&mut stream).await;
        let second = read_sequenced_envelope(&mut stream).await;
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        // Only heartbeats may flow while the producer is parked.
        let parked = tokio::time::timeout(Duration::from_millis(500), async {
            read_sequenced_envelope(&mut stream).await
        })
        .await;
        assert!(parked.is_err(), "producer should park at the window");

        // One ack opens one slot.
        write_frame(&mut stream, &ServerFrame::Ack(Ack { sequence: 1 }))
            .await
            .unwrap();
        let third = read_sequenced_envelope(&mut stream).await;
        assert_eq!(third.sequence, 3);

        h.shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_transitions_to_halted() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut h = harness(&dir, vec![addr], 8);

        let client = h.client.take().unwrap();
        let run = tokio::spawn(client.run());

        let (mut stream, _) = listener.accept().await.map(|(s, a)| (s, a)).unwrap();
        let _: Option<ClientFrame> = read_frame(&mut stream).await.unwrap();
        write_frame(
            &mut stream,
            &ServerFrame::Reject(Reject {
                reason: "identity fingerprint mismatch".into(),
            }),
        )
        .await
        .unwrap();

        // Halted means run() returns without retrying.
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("client halts")
            .unwrap();
        assert_eq!(h.health.stream_state(), "halted");
        assert!(h
            .health
            .last_error()
            .unwrap()
            .contains("fingerprint mismatch"));
    }

    #[tokio::test]
    async fn test_reconnect_replays_unacked_records() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut h = harness(&dir, vec![addr], 8);

        for label in ["A", "B"] {
            h.queue.enqueue(EnvelopePayload::LogRecord(crate::proto::LogRecord {
                raw: Some(label.to_string()),
                ..Default::default()
            }));
        }

        let client = h.client.take().unwrap();
        let run = tokio::spawn(client.run());

        // First connection: ack only "A", then drop the link.
        let (mut stream, _) = accept_and_hello(&listener).await;
        let first = read_sequenced_envelope(&mut stream).await;
        assert_eq!(first.sequence, 1);
        write_frame(&mut stream, &ServerFrame::Ack(Ack { sequence: 1 }))
            .await
            .unwrap();
        let _second = read_sequenced_envelope(&mut stream).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(stream);

        // Reconnect (backoff ~1s): hello resumes past "A", replays "B".
        let (mut stream, hello) = accept_and_hello(&listener).await;
        assert_eq!(hello.last_ack_sequence, 1);
        let replayed = read_sequenced_envelope(&mut stream).await;
        assert_eq!(replayed.sequence, 2);
        match replayed.payload {
            EnvelopePayload::LogRecord(record) => {
                assert_eq!(record.raw.as_deref(), Some("B"));
            }
            other => panic!("unexpected payload {other:?}"),
        }

        h.shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_envelopes_and_commands_flow() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut h = harness(&dir, vec![addr], 8);

        let client = h.client.take().unwrap();
        let run = tokio::spawn(client.run());
        let (mut stream, _) = accept_and_hello(&listener).await;

        // Gateway sends a command; it lands on the executor queue.
        let command = Command::new(crate::proto::CommandKind::ReloadConfig, 0);
        let sent_id = command.command_id.clone();
        write_frame(&mut stream, &ServerFrame::Command(command))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), h.command_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.command_id, sent_id);

        // A direct envelope (command result) goes out without a sequence.
        h.direct_tx
            .send(Envelope::direct(
                "host-1-fp",
                EnvelopePayload::CommandResult(crate::proto::CommandResult {
                    command_id: sent_id.clone(),
                    success: true,
                    error: None,
                    artifact: None,
                }),
            ))
            .unwrap();
        let out = loop {
            let envelope = read_envelope(&mut stream).await;
            if matches!(envelope.payload, EnvelopePayload::CommandResult(_)) {
                break envelope;
            }
        };
        assert_eq!(out.sequence, 0);

        h.shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_emitted_when_idle() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut h = harness(&dir, vec![addr], 8);

        let client = h.client.take().unwrap();
        let run = tokio::spawn(client.run());
        let (mut stream, _) = accept_and_hello(&listener).await;

        let envelope = read_envelope(&mut stream).await;
        match envelope.payload {
            EnvelopePayload::Heartbeat(hb) => {
                assert_eq!(hb.agent_version, VERSION);
                assert_eq!(envelope.sequence, 0);
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }

        h.shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }
}
