//! Scriptable connection handle for tests that need no network.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use opshub_core::{Error, ResourceId, Result};

use opshub_conn::cache::ManagedConn;
use opshub_conn::ssh::{CommandOutput, RemoteExec};
use opshub_conn::terminal::{InteractiveConn, PtyChannel, PtyCommand};

#[derive(Debug)]
struct StubState {
    id: ResourceId,
    alive: AtomicBool,
    close_count: AtomicUsize,
    sessions: AtomicUsize,
    exec_outputs: Mutex<HashMap<String, String>>,
}

/// A connection handle whose behavior the test scripts.
///
/// Exec commands answer from a scripted table; unknown commands fail.
/// `open_pty` spawns an echoing remote, so terminal round trips work
/// out of the box.
#[derive(Clone, Debug)]
pub struct StubConn {
    state: Arc<StubState>,
}

impl StubConn {
    pub fn new(id: ResourceId) -> Self {
        Self {
            state: Arc::new(StubState {
                id,
                alive: AtomicBool::new(true),
                close_count: AtomicUsize::new(0),
                sessions: AtomicUsize::new(0),
                exec_outputs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.state.id
    }

    /// Script the stdout answer for one exec command.
    pub fn script_exec(&self, command: &str, stdout: &str) {
        self.state
            .exec_outputs
            .lock()
            .insert(command.to_string(), stdout.to_string());
    }

    /// Mark the handle dead; the cache treats it as needing replacement.
    pub fn kill(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
    }

    /// Synchronous liveness check for assertions.
    pub fn alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }
}

impl ManagedConn for StubConn {
    async fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl RemoteExec for StubConn {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        if !self.state.alive.load(Ordering::SeqCst) {
            return Err(Error::transport(self.state.id, "connection closed"));
        }
        match self.state.exec_outputs.lock().get(command) {
            Some(stdout) => Ok(CommandOutput {
                stdout: stdout.clone(),
                stderr: String::new(),
                exit_status: 0,
            }),
            None => Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!("{}: command not found", command),
                exit_status: 127,
            }),
        }
    }
}

impl InteractiveConn for StubConn {
    async fn open_pty(&self, _cols: u16, _rows: u16) -> Result<PtyChannel> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<PtyCommand>(16);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(16);
        // Echo remote: every input chunk comes straight back as output.
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    PtyCommand::Data(bytes) => {
                        if output_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    PtyCommand::Resize { .. } => {}
                    PtyCommand::Close => break,
                }
            }
        });
        Ok(PtyChannel::from_parts(cmd_tx, output_rx))
    }

    fn attach_session(&self) -> Box<dyn Any + Send> {
        self.state.sessions.fetch_add(1, Ordering::SeqCst);
        Box::new(StubSessionGuard {
            state: Arc::clone(&self.state),
        })
    }
}

struct StubSessionGuard {
    state: Arc<StubState>,
}

impl Drop for StubSessionGuard {
    fn drop(&mut self) {
        self.state.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
