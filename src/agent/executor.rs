//! Command execution on the agent.
//!
//! Inbound commands from the gateway are queued onto a single worker task,
//! preserving per-agent FIFO order. Each command produces exactly one
//! [`CommandResult`] envelope on the outbound channel — except `ExecOpen`,
//! whose result is emitted by the exec session when it ends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::agent::apply::ConfigApplier;
use crate::agent::exec::ExecManager;
use crate::agent::update;
use crate::config::AgentConfig;
use crate::proto::{Command, CommandKind, CommandResult, Envelope, EnvelopePayload};

/// Cap on `FetchLogs` line counts.
const FETCH_LOGS_MAX_LINES: u64 = 1_000;

/// Owns everything command handlers touch.
pub struct CommandExecutor {
    agent_id: String,
    applier: Arc<ConfigApplier>,
    exec: ExecManager,
    update_server: String,
    update_helper: Option<PathBuf>,
    log_path: Option<PathBuf>,
    outbound: UnboundedSender<Envelope>,
    /// Signals the main loop that the binary was swapped and the process
    /// should restart.
    restart_tx: UnboundedSender<()>,
}

impl CommandExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: String,
        applier: Arc<ConfigApplier>,
        exec: ExecManager,
        config: &AgentConfig,
        log_path: Option<PathBuf>,
        outbound: UnboundedSender<Envelope>,
        restart_tx: UnboundedSender<()>,
    ) -> Self {
        Self {
            agent_id,
            applier,
            exec,
            update_server: config.update_server.clone(),
            update_helper: config.update_helper.clone(),
            log_path,
            outbound,
            restart_tx,
        }
    }

    /// Spawn the FIFO worker. Returns the queue sender and the handle.
    pub fn spawn_worker(self: Arc<Self>) -> (UnboundedSender<Command>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                self.execute(command).await;
            }
            log::debug!("[Executor] command queue closed, worker exiting");
        });
        (tx, handle)
    }

    /// Run one command and emit its result.
    async fn execute(&self, command: Command) {
        let command_id = command.command_id.clone();
        log::info!(
            "[Executor] running {} ({})",
            describe(&command.kind),
            command_id
        );

        if deadline_elapsed(command.deadline_unix_ns) {
            self.send_result(CommandResult {
                command_id,
                success: false,
                error: Some("deadline elapsed before execution".to_string()),
                artifact: None,
            });
            return;
        }

        match command.kind {
            CommandKind::ReloadConfig => {
                let result = self.applier.reload_only().await;
                self.send_result(match result {
                    Ok(_) => ok_result(&command_id, None),
                    Err(e) => err_result(&command_id, format!("{e:#}"), None),
                });
            }
            CommandKind::ApplyConfigSnippet { path, content } => {
                let result = self
                    .applier
                    .apply_snippet(Path::new(&path), content.as_bytes())
                    .await;
                self.send_result(apply_result(&command_id, result));
            }
            CommandKind::ApplyAugment { path, snippet } => {
                let result = self
                    .applier
                    .apply_augment(Path::new(&path), snippet.as_bytes())
                    .await;
                self.send_result(apply_result(&command_id, result));
            }
            CommandKind::Restart => {
                self.run_control(&command_id, "restart").await;
            }
            CommandKind::Stop => {
                self.run_control(&command_id, "stop").await;
            }
            CommandKind::ExecOpen { command: shell } => {
                // Success defers the result to session end; only failure
                // answers immediately.
                if let Err(e) = self.exec.open(&command_id, &shell) {
                    self.send_result(err_result(&command_id, format!("{e:#}"), None));
                }
            }
            CommandKind::ExecInput { session_id, bytes } => {
                let result = self.exec.input(&session_id, &bytes);
                self.send_result(match result {
                    Ok(()) => ok_result(&command_id, None),
                    Err(e) => err_result(&command_id, format!("{e:#}"), None),
                });
            }
            CommandKind::ExecClose { session_id } => {
                let result = self.exec.close(&session_id);
                self.send_result(match result {
                    Ok(()) => ok_result(&command_id, None),
                    Err(e) => err_result(&command_id, format!("{e:#}"), None),
                });
            }
            CommandKind::UpdateBinary => {
                let server = self.update_server.clone();
                let helper = self.update_helper.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    update::install(&server, helper.as_deref())
                })
                .await;
                match outcome {
                    Ok(Ok(update::UpdateOutcome::Applied { version })) => {
                        self.send_result(ok_result(
                            &command_id,
                            Some(format!("updated to {version}")),
                        ));
                        let _ = self.restart_tx.send(());
                    }
                    Ok(Ok(update::UpdateOutcome::AlreadyCurrent)) => {
                        self.send_result(ok_result(
                            &command_id,
                            Some("already current".to_string()),
                        ));
                    }
                    Ok(Err(e)) => {
                        self.send_result(err_result(&command_id, format!("{e:#}"), None));
                    }
                    Err(e) => {
                        self.send_result(err_result(
                            &command_id,
                            format!("update task panicked: {e}"),
                            None,
                        ));
                    }
                }
            }
            CommandKind::FetchLogs { lines } => {
                let result = self.fetch_logs(lines);
                self.send_result(match result {
                    Ok(text) => ok_result(&command_id, Some(text)),
                    Err(e) => err_result(&command_id, format!("{e:#}"), None),
                });
            }
        }
    }

    async fn run_control(&self, command_id: &str, which: &str) {
        let argv = {
            let control = self.applier.control();
            match which {
                "restart" => control.restart.clone(),
                _ => control.stop.clone(),
            }
        };
        let result = self.applier.control().run(&argv).await;
        self.send_result(match result {
            Ok(output) if output.status.success() => ok_result(command_id, None),
            Ok(output) => err_result(
                command_id,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
                None,
            ),
            Err(e) => err_result(command_id, format!("{e:#}"), None),
        });
    }

    /// Tail of the agent's own log file, capped at 1 000 lines.
    fn fetch_logs(&self, lines: u64) -> Result<String> {
        let path = self
            .log_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no log file configured"))?;
        let content = std::fs::read(path)?;
        let text = String::from_utf8_lossy(&content);
        let wanted = lines.clamp(1, FETCH_LOGS_MAX_LINES) as usize;
        let all: Vec<&str> = text.lines().collect();
        let start = all.len().saturating_sub(wanted);
        Ok(all[start..].join("\n"))
    }

    fn send_result(&self, result: CommandResult) {
        log::info!(
            "[Executor] {} -> success={}",
            result.command_id,
            result.success
        );
        let envelope = Envelope::direct(
            self.agent_id.clone(),
            EnvelopePayload::CommandResult(result),
        );
        if self.outbound.send(envelope).is_err() {
            log::warn!("[Executor] outbound channel closed, result dropped");
        }
    }
}

fn deadline_elapsed(deadline_unix_ns: u64) -> bool {
    if deadline_unix_ns == 0 {
        return false;
    }
    let now_ns = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
        .max(0) as u64;
    now_ns > deadline_unix_ns
}

fn describe(kind: &CommandKind) -> &'static str {
    match kind {
        CommandKind::ReloadConfig => "reload_config",
        CommandKind::ApplyConfigSnippet { .. } => "apply_config_snippet",
        CommandKind::ApplyAugment { .. } => "apply_augment",
        CommandKind::Restart => "restart",
        CommandKind::Stop => "stop",
        CommandKind::ExecOpen { .. } => "exec_open",
        CommandKind::ExecInput { .. } => "exec_input",
        CommandKind::ExecClose { .. } => "exec_close",
        CommandKind::UpdateBinary => "update_binary",
        CommandKind::FetchLogs { .. } => "fetch_logs",
    }
}

fn ok_result(command_id: &str, artifact: Option<String>) -> CommandResult {
    CommandResult {
        command_id: command_id.to_string(),
        success: true,
        error: None,
        artifact,
    }
}

fn err_result(command_id: &str, error: String, artifact: Option<String>) -> CommandResult {
    CommandResult {
        command_id: command_id.to_string(),
        success: false,
        error: Some(error),
        artifact,
    }
}

fn apply_result(
    command_id: &str,
    result: Result<crate::agent::apply::ApplyReport, crate::agent::apply::ApplyFailure>,
) -> CommandResult {
    match result {
        Ok(report) => ok_result(
            command_id,
            Some(report.backup_path.display().to_string()),
        ),
        Err(failure) => err_result(
            command_id,
            failure.message.clone(),
            failure
                .backup_path
                .as_ref()
                .map(|p| p.display().to_string()),
        ),
    }
}
