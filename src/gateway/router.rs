//! Per-agent command queues and result correlation.
//!
//! Each connected agent has a bounded FIFO queue drained by its stream
//! handler. Dispatching returns a future completed by the matching
//! [`CommandResult`]; a deadline turns it into [`RouterError::Timeout`]
//! and any late result is discarded with a log. Exec sessions are routed
//! by their opening command id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::proto::{Command, CommandKind, CommandResult, ExecFrame};

/// Errors callers of the router branch on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The agent is not in the registry (or has been evicted).
    #[error("unknown agent {0}")]
    UnknownAgent(String),
    /// The agent exists but has no live stream.
    #[error("agent {0} is not connected")]
    NotConnected(String),
    /// The bounded command queue is full.
    #[error("command queue full for agent {0}")]
    QueueFull(String),
    /// The command's deadline elapsed without a result.
    #[error("command {0} timed out")]
    Timeout(String),
    /// The stream dropped while the command was in flight; retryable.
    #[error("agent {0} disconnected with the command in flight")]
    Disconnected(String),
}

struct AgentChannel {
    tx: mpsc::Sender<Command>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<CommandResult>>>>,
    exec_sessions: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ExecFrame>>>>,
    epoch: u64,
}

/// An open interactive shell session on an agent.
pub struct ExecSession {
    /// The opening command's id; all frames correlate to it.
    pub session_id: String,
    /// PTY output frames from the agent.
    pub output: mpsc::UnboundedReceiver<ExecFrame>,
    /// Resolves when the session ends on the agent.
    pub result: oneshot::Receiver<CommandResult>,
}

/// Routes commands to connected agents and completes their futures.
pub struct CommandRouter {
    channels: Mutex<HashMap<String, AgentChannel>>,
    queue_depth: usize,
    default_timeout: Duration,
}

impl CommandRouter {
    pub fn new(queue_depth: usize, default_timeout: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            queue_depth: queue_depth.max(1),
            default_timeout,
        }
    }

    /// Attach a freshly registered connection. Replaces (and drains) any
    /// previous channel for this agent: its pending commands fail as
    /// Disconnected and its queue receiver closes.
    pub fn register(&self, agent_id: &str, epoch: u64) -> mpsc::Receiver<Command> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let channel = AgentChannel {
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            exec_sessions: Arc::new(Mutex::new(HashMap::new())),
            epoch,
        };
        let previous = self
            .channels
            .lock()
            .expect("router mutex poisoned")
            .insert(agent_id.to_string(), channel);
        if let Some(previous) = previous {
            log::info!("[Router] superseding command channel for {agent_id}");
            fail_pending(&previous, agent_id);
        }
        rx
    }

    /// Detach a connection. A stale epoch (superseded stream) is a no-op.
    pub fn unregister(&self, agent_id: &str, epoch: u64) {
        let mut channels = self.channels.lock().expect("router mutex poisoned");
        if channels.get(agent_id).is_some_and(|c| c.epoch == epoch) {
            let channel = channels.remove(agent_id).expect("checked above");
            drop(channels);
            fail_pending(&channel, agent_id);
        }
    }

    /// Enqueue a command and await its result within the deadline.
    ///
    /// A zero deadline on the command is replaced with the router default.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        command: Command,
    ) -> Result<CommandResult, RouterError> {
        let timeout = deadline_duration(command.deadline_unix_ns, self.default_timeout);
        let (command_id, rx) = self.dispatch_nowait(agent_id, command)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(RouterError::Disconnected(agent_id.to_string())),
            Err(_) => {
                // Leave no pending slot behind: a late result is discarded
                // (with a log) by `complete`.
                self.forget_pending(agent_id, &command_id);
                Err(RouterError::Timeout(command_id))
            }
        }
    }

    /// Enqueue without awaiting; returns the result receiver.
    pub fn dispatch_nowait(
        &self,
        agent_id: &str,
        mut command: Command,
    ) -> Result<(String, oneshot::Receiver<CommandResult>), RouterError> {
        if command.deadline_unix_ns == 0 {
            command.deadline_unix_ns = deadline_from_now(self.default_timeout);
        }
        let command_id = command.command_id.clone();

        let channels = self.channels.lock().expect("router mutex poisoned");
        let channel = channels
            .get(agent_id)
            .ok_or_else(|| RouterError::NotConnected(agent_id.to_string()))?;

        let (result_tx, result_rx) = oneshot::channel();
        channel
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .insert(command_id.clone(), result_tx);

        match channel.tx.try_send(command) {
            Ok(()) => Ok((command_id, result_rx)),
            Err(mpsc::error::TrySendError::Full(_)) => {
                channel
                    .pending
                    .lock()
                    .expect("pending mutex poisoned")
                    .remove(&command_id);
                Err(RouterError::QueueFull(agent_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                channel
                    .pending
                    .lock()
                    .expect("pending mutex poisoned")
                    .remove(&command_id);
                Err(RouterError::NotConnected(agent_id.to_string()))
            }
        }
    }

    /// Open an interactive exec session: enqueues `ExecOpen` and returns
    /// the frame stream plus the end-of-session result.
    pub fn open_exec(
        &self,
        agent_id: &str,
        shell_command: String,
        deadline_unix_ns: u64,
    ) -> Result<ExecSession, RouterError> {
        let command = Command::new(
            CommandKind::ExecOpen {
                command: shell_command,
            },
            deadline_unix_ns,
        );
        let session_id = command.command_id.clone();

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        {
            let channels = self.channels.lock().expect("router mutex poisoned");
            let channel = channels
                .get(agent_id)
                .ok_or_else(|| RouterError::NotConnected(agent_id.to_string()))?;
            channel
                .exec_sessions
                .lock()
                .expect("exec mutex poisoned")
                .insert(session_id.clone(), frame_tx);
        }

        let (_, result_rx) = self.dispatch_nowait(agent_id, command).inspect_err(|_| {
            self.forget_exec(agent_id, &session_id);
        })?;

        Ok(ExecSession {
            session_id,
            output: frame_rx,
            result: result_rx,
        })
    }

    /// Feed keyboard input into an open session (fire-and-forget result).
    pub fn exec_input(
        &self,
        agent_id: &str,
        session_id: &str,
        bytes: Vec<u8>,
    ) -> Result<(), RouterError> {
        let command = Command::new(
            CommandKind::ExecInput {
                session_id: session_id.to_string(),
                bytes,
            },
            0,
        );
        self.dispatch_nowait(agent_id, command).map(|_| ())
    }

    /// Close an open session.
    pub fn exec_close(&self, agent_id: &str, session_id: &str) -> Result<(), RouterError> {
        let command = Command::new(
            CommandKind::ExecClose {
                session_id: session_id.to_string(),
            },
            0,
        );
        self.dispatch_nowait(agent_id, command).map(|_| ())
    }

    /// Complete the pending future for an inbound [`CommandResult`]. Also
    /// tears down the exec session routing when the result ends one.
    pub fn complete(&self, agent_id: &str, result: CommandResult) {
        let command_id = result.command_id.clone();
        let sender = {
            let channels = self.channels.lock().expect("router mutex poisoned");
            let Some(channel) = channels.get(agent_id) else {
                log::debug!("[Router] result for unknown agent {agent_id} discarded");
                return;
            };
            channel
                .exec_sessions
                .lock()
                .expect("exec mutex poisoned")
                .remove(&command_id);
            let removed = channel
                .pending
                .lock()
                .expect("pending mutex poisoned")
                .remove(&command_id);
            removed
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => {
                log::info!(
                    "[Router] late result for {command_id} from {agent_id} discarded"
                );
            }
        }
    }

    /// Route an exec output frame to its session subscriber.
    pub fn exec_output(&self, agent_id: &str, frame: ExecFrame) {
        let channels = self.channels.lock().expect("router mutex poisoned");
        let Some(channel) = channels.get(agent_id) else {
            return;
        };
        let sessions = channel.exec_sessions.lock().expect("exec mutex poisoned");
        match sessions.get(&frame.command_id) {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => log::debug!(
                "[Router] exec frame for unknown session {} discarded",
                frame.command_id
            ),
        }
    }

    /// Number of live command channels (diagnostics).
    pub fn connected_count(&self) -> usize {
        self.channels.lock().expect("router mutex poisoned").len()
    }

    fn forget_pending(&self, agent_id: &str, command_id: &str) {
        let channels = self.channels.lock().expect("router mutex poisoned");
        if let Some(channel) = channels.get(agent_id) {
            channel
                .pending
                .lock()
                .expect("pending mutex poisoned")
                .remove(command_id);
        }
    }

    fn forget_exec(&self, agent_id: &str, session_id: &str) {
        let channels = self.channels.lock().expect("router mutex poisoned");
        if let Some(channel) = channels.get(agent_id) {
            channel
                .exec_sessions
                .lock()
                .expect("exec mutex poisoned")
                .remove(session_id);
        }
    }
}

/// Fail every pending command on a channel (disconnect/supersede path).
fn fail_pending(channel: &AgentChannel, agent_id: &str) {
    let mut pending = channel.pending.lock().expect("pending mutex poisoned");
    for (command_id, _sender) in pending.drain() {
        // Dropping the sender resolves the caller's future with a
        // channel-closed error, which dispatch maps to Disconnected.
        log::info!("[Router] command {command_id} failed: {agent_id} disconnected");
    }
    channel
        .exec_sessions
        .lock()
        .expect("exec mutex poisoned")
        .clear();
}

fn deadline_from_now(timeout: Duration) -> u64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
    now + timeout.as_nanos() as u64
}

fn deadline_duration(deadline_unix_ns: u64, default: Duration) -> Duration {
    if deadline_unix_ns == 0 {
        return default;
    }
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
    Duration::from_nanos(deadline_unix_ns.saturating_sub(now))
}
