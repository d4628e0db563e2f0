//! Terminal session bridge.
//!
//! A session couples one remote pty to one browser-facing duplex made
//! of frame channels. The bridge task pumps input frames to the pty,
//! pty output back to the browser (recording it on the way when asked),
//! and tears everything down exactly once no matter which side dies
//! first.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use opshub_core::constants::{MAX_TERMINAL_COLS, MAX_TERMINAL_ROWS, SESSION_TOKEN_LEN};
use opshub_core::{Error, Result};

use crate::record::SessionRecorder;

/// Commands accepted by a pty relay.
#[derive(Debug)]
pub enum PtyCommand {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Close,
}

/// In-process handle to a remote pty.
///
/// The transport side lives in a relay task that owns the real channel;
/// this handle only sees frame queues, which is what lets session logic
/// run against a fake remote in tests.
pub struct PtyChannel {
    cmd_tx: mpsc::Sender<PtyCommand>,
    output_rx: mpsc::Receiver<Vec<u8>>,
}

impl PtyChannel {
    pub fn from_parts(cmd_tx: mpsc::Sender<PtyCommand>, output_rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { cmd_tx, output_rx }
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        self.cmd_tx
            .send(PtyCommand::Data(data))
            .await
            .map_err(|_| Error::SessionClosed)
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.cmd_tx
            .send(PtyCommand::Resize { cols, rows })
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// Next chunk of pty output, or `None` once the remote side closed.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.output_rx.recv().await
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(PtyCommand::Close).await;
    }
}

/// Connections that can host interactive terminals.
pub trait InteractiveConn: Send + Sync {
    fn open_pty(&self, cols: u16, rows: u16) -> impl Future<Output = Result<PtyChannel>> + Send;

    /// Opaque RAII marker held for the session's lifetime, released when
    /// the bridge task finishes.
    fn attach_session(&self) -> Box<dyn Any + Send>;
}

/// Frames arriving from the browser.
#[derive(Debug)]
pub enum TermInput {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

/// Frames sent to the browser.
#[derive(Debug, PartialEq, Eq)]
pub enum TermOutput {
    Data(Vec<u8>),
    /// Terminal error notice; always the last frame when the session
    /// dies abnormally.
    Error(String),
}

/// Random alphanumeric token identifying one session.
pub fn new_session_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Clamp a browser-supplied terminal size to sane bounds.
pub fn clamp_size(cols: u16, rows: u16) -> (u16, u16) {
    (
        cols.clamp(1, MAX_TERMINAL_COLS),
        rows.clamp(1, MAX_TERMINAL_ROWS),
    )
}

pub struct TerminalSession;

impl TerminalSession {
    /// Start the bridge task for one session.
    ///
    /// Runs until the browser drops its input sender, the remote pty
    /// closes, or [`SessionHandle::stop`] is called. Recording failures
    /// disable the recorder but never the session.
    pub fn spawn(
        token: String,
        mut pty: PtyChannel,
        mut input_rx: mpsc::Receiver<TermInput>,
        output_tx: mpsc::Sender<TermOutput>,
        mut recorder: Option<SessionRecorder>,
        attachment: Option<Box<dyn Any + Send>>,
    ) -> SessionHandle {
        let closed = Arc::new(AtomicBool::new(false));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn({
            let closed = Arc::clone(&closed);
            let token = token.clone();
            async move {
                let mut failure: Option<Error> = None;

                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => {
                            debug!(%token, "Session stop requested");
                            break;
                        }
                        frame = input_rx.recv() => match frame {
                            Some(TermInput::Data(bytes)) => {
                                if let Err(e) = pty.write(bytes).await {
                                    failure = Some(e);
                                    break;
                                }
                            }
                            Some(TermInput::Resize { cols, rows }) => {
                                let (cols, rows) = clamp_size(cols, rows);
                                if pty.resize(cols, rows).await.is_err() {
                                    failure = Some(Error::SessionClosed);
                                    break;
                                }
                            }
                            // Browser went away.
                            None => break,
                        },
                        chunk = pty.read() => match chunk {
                            Some(bytes) => {
                                if let Some(rec) = recorder.as_mut() {
                                    if let Err(e) = rec.record(&bytes) {
                                        warn!(%token, error = %e, "Recording failed, disabling for this session");
                                        recorder = None;
                                    }
                                }
                                if output_tx.send(TermOutput::Data(bytes)).await.is_err() {
                                    break;
                                }
                            }
                            // Remote shell exited.
                            None => break,
                        },
                    }
                }

                if let Some(error) = failure {
                    let _ = output_tx.send(TermOutput::Error(error.to_string())).await;
                }

                pty.close().await;
                if let Some(rec) = recorder.as_mut() {
                    if let Err(e) = rec.finish() {
                        warn!(%token, error = %e, "Flushing recording failed");
                    }
                }
                drop(attachment);
                closed.store(true, Ordering::SeqCst);
                info!(%token, "Terminal session closed");
                // output_tx drops here, closing the browser stream.
            }
        });

        SessionHandle {
            token,
            stop_tx,
            closed,
            task,
        }
    }
}

/// Control handle for a running session.
#[derive(Debug)]
pub struct SessionHandle {
    token: String,
    stop_tx: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ask the bridge to shut down. Safe to call any number of times,
    /// before or after natural closure.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for the bridge task to finish.
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}
