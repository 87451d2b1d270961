//! The central gateway: registry, command router, ingest, stream server.
//!
//! All fleet state hangs off an explicit [`GatewayState`] value with a
//! defined init/teardown; background tasks (liveness sweeper, ingest
//! batcher) are owned by it and stopped by [`GatewayState::shutdown`].

pub mod ingest;
pub mod registry;
pub mod router;
pub mod server;
pub mod sink;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::proto::{Command, CommandKind, CommandResult};

use ingest::{IngestHandle, IngestOptions};
use registry::{Registry, StreamState};
use router::{CommandRouter, ExecSession, RouterError};
use sink::{BatchSink, HttpSink, NullSink};

/// Owns every long-lived piece of the gateway.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub registry: Arc<Registry>,
    pub router: Arc<CommandRouter>,
    pub ingest: IngestHandle,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayState {
    /// Assemble the gateway around explicit sinks (tests inject fakes).
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn BatchSink>,
        bus: Option<Arc<dyn BatchSink>>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = Arc::new(Registry::new(config.retention_window()));
        let router = Arc::new(CommandRouter::new(
            config.command_queue_depth,
            Duration::from_secs(config.command_timeout.max(1)),
        ));

        let (ingest, ingest_task) = ingest::spawn(
            IngestOptions {
                batch_size: config.batch_size,
                flush_interval: config.flush_interval(),
            },
            store,
            bus,
            shutdown_rx.clone(),
        );
        let sweeper = registry.spawn_sweeper(config.prune_interval(), shutdown_rx);

        Arc::new(Self {
            config,
            registry,
            router,
            ingest,
            shutdown_tx,
            tasks: Mutex::new(vec![ingest_task, sweeper]),
        })
    }

    /// Assemble from configuration: HTTP sinks when URLs are set.
    pub fn from_config(config: GatewayConfig) -> Arc<Self> {
        let store: Arc<dyn BatchSink> = match &config.store_url {
            Some(url) => Arc::new(HttpSink::new(url.clone())),
            None => {
                log::warn!("[Gateway] no store_url configured; telemetry is discarded");
                Arc::new(NullSink)
            }
        };
        let bus: Option<Arc<dyn BatchSink>> = config
            .bus_url
            .as_ref()
            .map(|url| Arc::new(HttpSink::new(url.clone())) as Arc<dyn BatchSink>);
        Self::new(config, store, bus)
    }

    /// Watch channel the server and connections subscribe to.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Route a command to an agent and await its result.
    ///
    /// Registry state decides the error: unknown or evicted agents are
    /// `UnknownAgent`, known-but-offline agents are `NotConnected`.
    pub async fn send_command(
        &self,
        agent_id: &str,
        kind: CommandKind,
        deadline_unix_ns: u64,
    ) -> Result<CommandResult, RouterError> {
        self.check_connected(agent_id).await?;
        self.router
            .dispatch(agent_id, Command::new(kind, deadline_unix_ns))
            .await
    }

    /// Open an interactive exec session on an agent.
    pub async fn open_exec(
        &self,
        agent_id: &str,
        shell_command: String,
        deadline_unix_ns: u64,
    ) -> Result<ExecSession, RouterError> {
        self.check_connected(agent_id).await?;
        self.router
            .open_exec(agent_id, shell_command, deadline_unix_ns)
    }

    async fn check_connected(&self, agent_id: &str) -> Result<(), RouterError> {
        match self.registry.stream_state(agent_id).await {
            None | Some(StreamState::Evicted) => {
                Err(RouterError::UnknownAgent(agent_id.to_string()))
            }
            Some(StreamState::Idle) => Err(RouterError::NotConnected(agent_id.to_string())),
            Some(StreamState::Connected) => Ok(()),
        }
    }

    /// Stop background tasks and release connections.
    pub async fn shutdown(&self) {
        log::info!("[Gateway] shutting down");
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}
