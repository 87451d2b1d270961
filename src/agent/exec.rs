//! Interactive exec sessions over a pseudo-terminal.
//!
//! `ExecOpen` spawns a PTY-backed child running the requested command via
//! the shell. A reader thread pumps PTY output into outbound
//! [`ExecFrame`](crate::proto::ExecFrame) envelopes; `ExecInput` writes into
//! the master side; `ExecClose` (or EOF from either side) kills the child
//! and ends the session. The session's final [`CommandResult`] is emitted
//! when the child exits.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, PtySize};
use tokio::sync::mpsc::UnboundedSender;

use crate::proto::{CommandResult, Envelope, EnvelopePayload, ExecDirection, ExecFrame};

/// PTY dimensions for exec sessions; remote resize is not supported.
const PTY_ROWS: u16 = 24;
const PTY_COLS: u16 = 80;

/// Read chunk size for the PTY output pump.
const READ_BUF_SIZE: usize = 8 * 1024;

struct Session {
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

struct Inner {
    agent_id: String,
    sessions: Mutex<HashMap<String, Session>>,
    outbound: UnboundedSender<Envelope>,
}

/// Owns all live exec sessions for one agent.
#[derive(Clone)]
pub struct ExecManager {
    inner: Arc<Inner>,
}

impl ExecManager {
    /// `outbound` carries ExecFrame and final CommandResult envelopes to
    /// the stream client.
    pub fn new(agent_id: String, outbound: UnboundedSender<Envelope>) -> Self {
        Self {
            inner: Arc::new(Inner {
                agent_id,
                sessions: Mutex::new(HashMap::new()),
                outbound,
            }),
        }
    }

    /// Spawn a PTY-backed child for `command` under `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if a session with this id already exists or the
    /// PTY/child cannot be created.
    pub fn open(&self, session_id: &str, command: &str) -> Result<()> {
        {
            let sessions = self.inner.sessions.lock().expect("exec mutex poisoned");
            if sessions.contains_key(session_id) {
                return Err(anyhow!("exec session {session_id} already open"));
            }
        }

        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("opening PTY")?;

        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.arg("-c");
        cmd.arg(command);
        cmd.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .context("spawning exec child")?;
        // Drop the slave so the master sees EOF when the child exits.
        drop(pair.slave);

        let killer = child.clone_killer();
        let writer = pair.master.take_writer().context("taking PTY writer")?;
        let reader = pair
            .master
            .try_clone_reader()
            .context("cloning PTY reader")?;

        {
            let mut sessions = self.inner.sessions.lock().expect("exec mutex poisoned");
            sessions.insert(session_id.to_string(), Session { writer, killer });
        }

        let inner = Arc::clone(&self.inner);
        let id = session_id.to_string();
        std::thread::Builder::new()
            .name(format!("exec-{id}"))
            .spawn(move || {
                pump_output(inner, id, reader, child);
                // The master pair is dropped with this thread's captures.
                drop(pair.master);
            })
            .context("spawning exec reader thread")?;

        log::info!("[Exec] session {session_id} opened: {command}");
        Ok(())
    }

    /// Write input bytes into a session's PTY.
    pub fn input(&self, session_id: &str, bytes: &[u8]) -> Result<()> {
        let mut sessions = self.inner.sessions.lock().expect("exec mutex poisoned");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("no exec session {session_id}"))?;
        session
            .writer
            .write_all(bytes)
            .context("writing to exec PTY")?;
        session.writer.flush().context("flushing exec PTY")?;
        Ok(())
    }

    /// Kill a session's child. The reader thread emits the final result.
    pub fn close(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.inner.sessions.lock().expect("exec mutex poisoned");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("no exec session {session_id}"))?;
        log::info!("[Exec] session {session_id} closed by request");
        session.killer.kill().context("killing exec child")?;
        Ok(())
    }

    /// Kill every live session (agent shutdown).
    pub fn close_all(&self) {
        let mut sessions = self.inner.sessions.lock().expect("exec mutex poisoned");
        for (id, session) in sessions.iter_mut() {
            log::info!("[Exec] killing session {id} on shutdown");
            let _ = session.killer.kill();
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().expect("exec mutex poisoned").len()
    }
}

/// Blocking output pump: PTY master → ExecFrame envelopes, then the final
/// CommandResult once the child exits.
fn pump_output(
    inner: Arc<Inner>,
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let frame = Envelope::direct(
                    inner.agent_id.clone(),
                    EnvelopePayload::ExecFrame(ExecFrame {
                        command_id: session_id.clone(),
                        direction: ExecDirection::Out,
                        bytes: buf[..n].to_vec(),
                    }),
                );
                if inner.outbound.send(frame).is_err() {
                    // Stream side gone; kill the child and bail.
                    let _ = child.kill();
                    break;
                }
            }
            Err(e) => {
                log::debug!("[Exec] session {session_id} read ended: {e}");
                break;
            }
        }
    }

    let status = child.wait();
    inner
        .sessions
        .lock()
        .expect("exec mutex poisoned")
        .remove(&session_id);

    let (success, error) = match status {
        Ok(status) if status.success() => (true, None),
        Ok(status) => (false, Some(format!("child exited with code {}", status.exit_code()))),
        Err(e) => (false, Some(format!("wait failed: {e}"))),
    };
    log::info!("[Exec] session {session_id} ended (success={success})");

    let result = Envelope::direct(
        inner.agent_id.clone(),
        EnvelopePayload::CommandResult(CommandResult {
            command_id: session_id.clone(),
            success,
            error,
            artifact: None,
        }),
    );
    let _ = inner.outbound.send(result);
}
