//! The on-host agent: collectors, WAL, stream client, command executor,
//! self-updater, and the local health endpoint, assembled and torn down
//! together.

pub mod apply;
pub mod backup;
pub mod collector;
pub mod discover;
pub mod exec;
pub mod executor;
pub mod health;
pub mod stream;
pub mod update;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};

use crate::config::{config_dir, AgentConfig};
use crate::identity;
use crate::wal::WalBuffer;

use apply::ConfigApplier;
use collector::TelemetryQueue;
use discover::{ProcScanner, ProxyDiscovery};
use exec::ExecManager;
use executor::CommandExecutor;
use health::{AgentHealth, HealthContext};
use stream::{StreamClient, StreamOptions};

/// Why the agent's run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Shutdown signal; exit 0.
    Normal,
    /// The binary was swapped; restart with the distinguished exit code.
    UpdatedRestart,
}

/// Run the agent until shutdown or a successful self-update.
///
/// `shutdown` is flipped by the binary's signal handler; this function
/// also flips it itself when an update lands, so every task drains
/// through the same path.
pub async fn run(
    config: AgentConfig,
    log_path: Option<PathBuf>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<AgentExit> {
    let shutdown = shutdown_tx.subscribe();
    let dir = config_dir()?;
    let identity = identity::load_or_create(&dir)?;
    let agent_id = identity.agent_id();
    log::info!(
        "[Agent] starting as {agent_id} (v{})",
        update::VERSION
    );

    let wal = Arc::new(
        WalBuffer::open(&config.buffer_path)
            .with_context(|| format!("opening WAL at {}", config.buffer_path.display()))?,
    );
    let queue = Arc::new(TelemetryQueue::new(Arc::clone(&wal), agent_id.clone()));
    let health_state = Arc::new(AgentHealth::new());
    let applier = Arc::new(ConfigApplier::from_config(&config));
    let discovery: Arc<dyn ProxyDiscovery> = Arc::new(ProcScanner);

    // Direct (non-WAL) envelopes: command results and exec frames.
    let (direct_tx, direct_rx) = mpsc::unbounded_channel();
    let (restart_tx, mut restart_rx) = mpsc::unbounded_channel();
    let poll_restart_tx = restart_tx.clone();

    let exec = ExecManager::new(agent_id.clone(), direct_tx.clone());
    let executor = Arc::new(CommandExecutor::new(
        agent_id.clone(),
        Arc::clone(&applier),
        exec.clone(),
        &config,
        log_path,
        direct_tx,
        restart_tx,
    ));
    let (command_tx, executor_handle) = executor.spawn_worker();

    let mut tasks = collector::spawn_all(Arc::clone(&queue), &config, shutdown.clone());

    if config.health_port != 0 {
        let ctx = HealthContext {
            health: Arc::clone(&health_state),
            queue: Arc::clone(&queue),
            applier: Arc::clone(&applier),
        };
        let port = config.health_port;
        let health_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = health::serve(port, ctx, health_shutdown).await {
                log::error!("[Agent] health endpoint failed: {e:#}");
            }
        }));
    }

    // Update poll loop: check on the configured cadence, install when a
    // newer build is published, then request a restart.
    {
        let interval = Duration::from_secs(config.update_interval.max(60));
        let server = config.update_server.clone();
        let helper = config.update_helper.clone();
        let mut poll_shutdown = shutdown.clone();
        let restart = poll_restart_tx;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = poll_shutdown.changed() => return,
                }
                let server = server.clone();
                let helper = helper.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    update::install(&server, helper.as_deref())
                })
                .await;
                match outcome {
                    Ok(Ok(update::UpdateOutcome::Applied { version })) => {
                        log::info!("[Agent] self-update to {version} applied");
                        let _ = restart.send(());
                    }
                    Ok(Ok(update::UpdateOutcome::AlreadyCurrent)) => {}
                    Ok(Err(e)) => log::warn!("[Agent] update poll failed: {e:#}"),
                    Err(e) => log::warn!("[Agent] update task panicked: {e}"),
                }
            }
        }));
    }

    let stream_client = StreamClient::new(
        StreamOptions {
            addresses: config.gateway_addresses.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            in_flight_window: config.in_flight_window,
            identity,
        },
        Arc::clone(&wal),
        Arc::clone(&queue),
        Arc::clone(&applier),
        discovery,
        Arc::clone(&health_state),
        command_tx,
        direct_rx,
        shutdown.clone(),
    );
    let stream_handle = tokio::spawn(stream_client.run());

    // Wait for either a shutdown or a restart request from the updater.
    let mut shutdown_watch = shutdown;
    let exit = tokio::select! {
        _ = shutdown_watch.changed() => AgentExit::Normal,
        _ = restart_rx.recv() => {
            log::info!("[Agent] restart requested after update");
            AgentExit::UpdatedRestart
        }
    };

    // Propagate and drain: collectors finish their current sample, the
    // stream producer flushes its acknowledged prefix in the grace window.
    let _ = shutdown_tx.send(true);
    exec.close_all();
    let _ = stream_handle.await;
    for task in tasks {
        task.abort();
    }
    executor_handle.abort();
    wal_close(wal);

    log::info!("[Agent] stopped");
    Ok(exit)
}

fn wal_close(wal: Arc<WalBuffer>) {
    match Arc::try_unwrap(wal) {
        Ok(wal) => {
            if let Err(e) = wal.close() {
                log::warn!("[Agent] WAL close failed: {e}");
            }
        }
        Err(_) => log::debug!("[Agent] WAL still shared at shutdown; handles drop with tasks"),
    }
}
