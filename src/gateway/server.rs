//! Gateway stream server: accepts agent connections, runs the handshake,
//! and pumps envelopes/acks/commands per connection.
//!
//! One spawned handler per connection. The handler acks every sequenced
//! envelope as soon as it sits in the ingest buffer (acks are deliberately
//! decoupled from sink success), deduplicates `(agent_id, sequence)`
//! replays, and reports sequence gaps as buffer-corruption candidates.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::gateway::registry::SequenceObservation;
use crate::gateway::GatewayState;
use crate::proto::framing::{read_frame, write_frame, FrameDecoder};
use crate::proto::{Ack, ClientFrame, Envelope, EnvelopePayload, HelloAck, Reject, ServerFrame};

/// How long a fresh connection gets to present its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind and accept until shutdown. Each connection runs in its own task.
pub async fn serve(state: Arc<GatewayState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(&state.config.listen_addr)
        .await
        .with_context(|| format!("binding {}", state.config.listen_addr))?;
    log::info!(
        "[Server] listening on {}",
        listener.local_addr().expect("bound listener has an address")
    );
    serve_on(listener, state, &mut shutdown).await
}

/// Accept loop over an existing listener (tests bind their own port).
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr.to_string(), state, conn_shutdown).await {
                                log::warn!("[Server] connection {addr} ended with error: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("[Server] accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                log::info!("[Server] accept loop stopping");
                return Ok(());
            }
        }
    }
}

/// One agent connection: hello → register → pump until EOF, supersede, or
/// shutdown.
async fn handle_connection(
    mut stream: TcpStream,
    addr: String,
    state: Arc<GatewayState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true).ok();

    // Handshake.
    let first = tokio::time::timeout(HELLO_TIMEOUT, read_frame::<_, ClientFrame>(&mut stream))
        .await
        .context("hello timed out")??;
    let hello = match first {
        Some(ClientFrame::Hello(hello)) => hello,
        Some(other) => bail!("expected Hello, got {other:?}"),
        None => return Ok(()),
    };
    let agent_id = hello.identity.agent_id();

    let outcome = match state
        .registry
        .on_hello(
            &hello.identity,
            addr.clone(),
            hello.agent_version.clone(),
            hello.discovered_proxies.clone(),
            hello.last_ack_sequence,
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(reason) => {
            log::warn!("[Server] rejecting {agent_id} from {addr}: {reason}");
            write_frame(
                &mut stream,
                &ServerFrame::Reject(Reject {
                    reason: reason.to_string(),
                }),
            )
            .await?;
            return Ok(());
        }
    };
    write_frame(
        &mut stream,
        &ServerFrame::HelloAck(HelloAck {
            resume_from_sequence: outcome.resume_from_sequence,
        }),
    )
    .await?;
    log::info!(
        "[Server] {agent_id} registered from {addr} (resume from {})",
        outcome.resume_from_sequence
    );

    let mut command_rx = state.router.register(&agent_id, outcome.epoch);

    // Streaming.
    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 64 * 1024];
    let result = loop {
        tokio::select! {
            read = stream.read(&mut read_buf) => {
                let n = match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(e.into()),
                };
                let payloads = match decoder.feed(&read_buf[..n]) {
                    Ok(payloads) => payloads,
                    Err(e) => break Err(e),
                };
                for payload in payloads {
                    let frame: ClientFrame = match serde_json::from_slice(&payload) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("[Server] undecodable frame from {agent_id}: {e}");
                            continue;
                        }
                    };
                    match frame {
                        ClientFrame::Envelope(envelope) => {
                            if let Err(e) = handle_envelope(&state, &agent_id, envelope, &mut stream).await {
                                log::warn!("[Server] envelope handling for {agent_id} failed: {e:#}");
                            }
                        }
                        ClientFrame::Hello(_) => {
                            log::warn!("[Server] spurious mid-stream Hello from {agent_id} ignored");
                        }
                    }
                }
            }
            command = command_rx.recv() => {
                match command {
                    Some(command) => {
                        write_frame(&mut stream, &ServerFrame::Command(command)).await?;
                    }
                    None => {
                        // Channel replaced: a newer connection superseded us.
                        log::info!("[Server] {agent_id} stream superseded; closing");
                        break Ok(());
                    }
                }
            }
            _ = shutdown.changed() => {
                break Ok(());
            }
        }
    };

    state.router.unregister(&agent_id, outcome.epoch);
    state.registry.on_disconnect(&agent_id, outcome.epoch).await;
    result
}

/// Dispatch one inbound envelope: liveness, dedup, ingest, ack, routing.
async fn handle_envelope(
    state: &Arc<GatewayState>,
    agent_id: &str,
    envelope: Envelope,
    stream: &mut TcpStream,
) -> Result<()> {
    if envelope.agent_id != agent_id {
        log::warn!(
            "[Server] envelope agent_id {:?} does not match stream {agent_id}; dropped",
            envelope.agent_id
        );
        return Ok(());
    }

    match &envelope.payload {
        EnvelopePayload::Heartbeat(heartbeat) => {
            state
                .registry
                .on_heartbeat(
                    agent_id,
                    heartbeat.proxies.clone(),
                    heartbeat.agent_version.clone(),
                    &heartbeat.degraded_files,
                )
                .await;
        }
        EnvelopePayload::CommandResult(result) => {
            state.registry.on_envelope(agent_id).await;
            state.router.complete(agent_id, result.clone());
        }
        EnvelopePayload::ExecFrame(frame) => {
            state.registry.on_envelope(agent_id).await;
            state.router.exec_output(agent_id, frame.clone());
        }
        EnvelopePayload::LogRecord(_)
        | EnvelopePayload::ProxyMetric(_)
        | EnvelopePayload::SystemMetric(_) => {
            if envelope.is_sequenced() {
                let sequence = envelope.sequence;
                match state.registry.observe_sequence(agent_id, sequence).await {
                    SequenceObservation::Duplicate => {
                        // At-least-once replay: ack again, skip ingest.
                    }
                    SequenceObservation::Fresh => {
                        state.ingest.submit(envelope).await;
                    }
                    SequenceObservation::Gap { expected } => {
                        log::error!(
                            "[Server] sequence gap from {agent_id}: expected {expected}, got {sequence} (possible buffer corruption)"
                        );
                        state.ingest.submit(envelope).await;
                    }
                }
                write_frame(stream, &ServerFrame::Ack(Ack { sequence })).await?;
            } else {
                log::warn!("[Server] unsequenced telemetry from {agent_id}; ingesting without ack");
                state.registry.on_envelope(agent_id).await;
                state.ingest.submit(envelope).await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::sink::MemorySink;
    use crate::proto::{AgentIdentity, CommandKind, CommandResult, Hello, LogRecord};

    struct TestGateway {
        state: Arc<GatewayState>,
        sink: Arc<MemorySink>,
        addr: String,
        shutdown_tx: watch::Sender<bool>,
    }

    async fn start_gateway() -> TestGateway {
        let sink = Arc::new(MemorySink::new());
        let config = GatewayConfig {
            flush_interval: 1,
            command_timeout: 5,
            ..GatewayConfig::default()
        };
        let state = GatewayState::new(config, Arc::clone(&sink) as _, None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut shutdown = shutdown_rx;
                let _ = serve_on(listener, state, &mut shutdown).await;
            });
        }
        TestGateway {
            state,
            sink,
            addr,
            shutdown_tx,
        }
    }

    fn identity() -> AgentIdentity {
        AgentIdentity {
            hostname: "web-01".into(),
            primary_ipv4: "127.0.0.1".into(),
            agent_key_fingerprint: "cafe".repeat(16),
        }
    }

    async fn connect_agent(addr: &str, id: &AgentIdentity, last_ack: u64) -> (TcpStream, HelloAck) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut stream,
            &ClientFrame::Hello(Hello {
                identity: id.clone(),
                agent_version: "0.4.1".into(),
                discovered_proxies: vec![],
                last_ack_sequence: last_ack,
            }),
        )
        .await
        .unwrap();
        let reply: ServerFrame = read_frame(&mut stream).await.unwrap().unwrap();
        match reply {
            ServerFrame::HelloAck(ack) => (stream, ack),
            other => panic!("expected HelloAck, got {other:?}"),
        }
    }

    fn log_envelope(id: &AgentIdentity, sequence: u64, raw: &str) -> ClientFrame {
        ClientFrame::Envelope(Envelope {
            sequence,
            agent_id: id.agent_id(),
            payload: EnvelopePayload::LogRecord(LogRecord {
                raw: Some(raw.to_string()),
                ..Default::default()
            }),
        })
    }

    async fn expect_ack(stream: &mut TcpStream, sequence: u64) {
        let frame: ServerFrame =
            tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
                .await
                .expect("ack within timeout")
                .unwrap()
                .unwrap();
        match frame {
            ServerFrame::Ack(ack) => assert_eq!(ack.sequence, sequence),
            other => panic!("expected Ack({sequence}), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_envelopes_are_acked_and_ingested() {
        let gw = start_gateway().await;
        let id = identity();
        let (mut stream, ack) = connect_agent(&gw.addr, &id, 0).await;
        assert_eq!(ack.resume_from_sequence, 1);

        for (seq, raw) in [(1, "A"), (2, "B")] {
            write_frame(&mut stream, &log_envelope(&id, seq, raw))
                .await
                .unwrap();
            expect_ack(&mut stream, seq).await;
        }

        // The interval flush lands both rows in the sink.
        tokio::time::timeout(Duration::from_secs(5), async {
            while gw.sink.total() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        let rows = gw.sink.rows("log_record");
        assert_eq!(rows[0].sequence, 1);
        assert_eq!(rows[1].sequence, 2);

        gw.shutdown_tx.send(true).unwrap();
        gw.state.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicates_acked_but_collapsed() {
        let gw = start_gateway().await;
        let id = identity();
        let (mut stream, _) = connect_agent(&gw.addr, &id, 0).await;

        write_frame(&mut stream, &log_envelope(&id, 1, "A")).await.unwrap();
        expect_ack(&mut stream, 1).await;
        // Replay of sequence 1 (reconnect semantics): acked, not re-ingested.
        write_frame(&mut stream, &log_envelope(&id, 1, "A")).await.unwrap();
        expect_ack(&mut stream, 1).await;
        write_frame(&mut stream, &log_envelope(&id, 2, "B")).await.unwrap();
        expect_ack(&mut stream, 2).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while gw.sink.total() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(gw.sink.total(), 2, "duplicate must be collapsed");

        gw.shutdown_tx.send(true).unwrap();
        gw.state.shutdown().await;
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let gw = start_gateway().await;
        let id = identity();
        let (mut stream, _) = connect_agent(&gw.addr, &id, 0).await;
        let agent_id = id.agent_id();

        let state = Arc::clone(&gw.state);
        let dispatch = tokio::spawn(async move {
            state
                .send_command(&agent_id, CommandKind::ReloadConfig, 0)
                .await
        });

        // Agent side: receive the command, reply with a result envelope.
        let frame: ServerFrame =
            tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        let command = match frame {
            ServerFrame::Command(command) => command,
            other => panic!("expected Command, got {other:?}"),
        };
        write_frame(
            &mut stream,
            &ClientFrame::Envelope(Envelope::direct(
                id.agent_id(),
                EnvelopePayload::CommandResult(CommandResult {
                    command_id: command.command_id.clone(),
                    success: true,
                    error: None,
                    artifact: Some("done".into()),
                }),
            )),
        )
        .await
        .unwrap();

        let result = dispatch.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.artifact.as_deref(), Some("done"));

        gw.shutdown_tx.send(true).unwrap();
        gw.state.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_mismatch_rejected() {
        let gw = start_gateway().await;
        let id = identity();
        let (_stream, _) = connect_agent(&gw.addr, &id, 0).await;

        // Same agent_id, different full fingerprint.
        let mut imposter = identity();
        imposter.agent_key_fingerprint = format!(
            "{}{}",
            &id.agent_key_fingerprint[..12],
            "0".repeat(id.agent_key_fingerprint.len() - 12)
        );
        let mut stream = TcpStream::connect(&gw.addr).await.unwrap();
        write_frame(
            &mut stream,
            &ClientFrame::Hello(Hello {
                identity: imposter,
                agent_version: "0.4.1".into(),
                discovered_proxies: vec![],
                last_ack_sequence: 0,
            }),
        )
        .await
        .unwrap();
        let reply: ServerFrame = read_frame(&mut stream).await.unwrap().unwrap();
        match reply {
            ServerFrame::Reject(reject) => {
                assert!(reject.reason.contains("fingerprint mismatch"));
            }
            other => panic!("expected Reject, got {other:?}"),
        }

        gw.shutdown_tx.send(true).unwrap();
        gw.state.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_connection_supersedes_old() {
        let gw = start_gateway().await;
        let id = identity();
        let (mut first, _) = connect_agent(&gw.addr, &id, 0).await;
        let (_second, _) = connect_agent(&gw.addr, &id, 0).await;

        // The first connection is closed by the gateway (EOF).
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match read_frame::<_, ServerFrame>(&mut first).await {
                    Ok(None) | Err(_) => break,
                    Ok(Some(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "superseded connection should close");

        // The registry still shows the agent Connected (the new stream).
        assert_eq!(
            gw.state.registry.stream_state(&id.agent_id()).await,
            Some(crate::gateway::registry::StreamState::Connected)
        );

        gw.shutdown_tx.send(true).unwrap();
        gw.state.shutdown().await;
    }
}
