//! A pty channel pair whose remote end is driven by the test.

use tokio::sync::mpsc;

use opshub_conn::terminal::{PtyChannel, PtyCommand};

/// The remote side of a [`PtyChannel`].
///
/// The test reads the commands the session sent and feeds output back,
/// playing the role of the shell.
pub struct FakeRemote {
    cmd_rx: Option<mpsc::Receiver<PtyCommand>>,
    output_tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl FakeRemote {
    /// Next command the session wrote, or `None` once the session side
    /// dropped (or input was closed with [`close_input`](Self::close_input)).
    pub async fn recv_command(&mut self) -> Option<PtyCommand> {
        match &mut self.cmd_rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Stop accepting session input, as a dead channel would. Output
    /// stays open, so the session notices on its next write.
    pub fn close_input(&mut self) {
        self.cmd_rx = None;
    }

    /// Emit shell output toward the session.
    pub async fn send_output(&self, data: &[u8]) -> Result<(), ()> {
        match &self.output_tx {
            Some(tx) => tx.send(data.to_vec()).await.map_err(|_| ()),
            None => Err(()),
        }
    }

    /// Close the output stream, as a shell exit would.
    pub fn close_output(&mut self) {
        self.output_tx = None;
    }
}

/// Build a connected [`PtyChannel`] / [`FakeRemote`] pair.
pub fn pty_pair() -> (PtyChannel, FakeRemote) {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (output_tx, output_rx) = mpsc::channel(16);
    (
        PtyChannel::from_parts(cmd_tx, output_rx),
        FakeRemote {
            cmd_rx: Some(cmd_rx),
            output_tx: Some(output_tx),
        },
    )
}
