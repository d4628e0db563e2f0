//! Terminal session bridge: data flow, resize, teardown and recording.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use opshub_conn::record::{ReplayStore, SessionRecorder};
use opshub_conn::terminal::{
    new_session_token, PtyCommand, TermInput, TermOutput, TerminalSession,
};
use opshub_core::record::decode_all;
use opshub_test_utils::pty_pair;

const TICK: Duration = Duration::from_secs(1);

struct Harness {
    input_tx: mpsc::Sender<TermInput>,
    output_rx: mpsc::Receiver<TermOutput>,
    remote: opshub_test_utils::FakeRemote,
    session: opshub_conn::terminal::SessionHandle,
}

fn start_session(recorder: Option<SessionRecorder>) -> Harness {
    let (pty, remote) = pty_pair();
    let (input_tx, input_rx) = mpsc::channel(16);
    let (output_tx, output_rx) = mpsc::channel(16);
    let session = TerminalSession::spawn(
        new_session_token(),
        pty,
        input_rx,
        output_tx,
        recorder,
        None,
    );
    Harness {
        input_tx,
        output_rx,
        remote,
        session,
    }
}

#[tokio::test]
async fn input_reaches_the_remote_in_order() {
    let mut h = start_session(None);

    h.input_tx
        .send(TermInput::Data(b"ls -l\n".to_vec()))
        .await
        .unwrap();
    h.input_tx
        .send(TermInput::Data(b"pwd\n".to_vec()))
        .await
        .unwrap();

    let first = timeout(TICK, h.remote.recv_command()).await.unwrap().unwrap();
    let second = timeout(TICK, h.remote.recv_command()).await.unwrap().unwrap();
    assert!(matches!(first, PtyCommand::Data(ref b) if b == b"ls -l\n"));
    assert!(matches!(second, PtyCommand::Data(ref b) if b == b"pwd\n"));
}

#[tokio::test]
async fn output_reaches_the_browser_in_order() {
    let mut h = start_session(None);

    h.remote.send_output(b"total 0\n").await.unwrap();
    h.remote.send_output(b"$ ").await.unwrap();

    let first = timeout(TICK, h.output_rx.recv()).await.unwrap().unwrap();
    let second = timeout(TICK, h.output_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, TermOutput::Data(b"total 0\n".to_vec()));
    assert_eq!(second, TermOutput::Data(b"$ ".to_vec()));
}

#[tokio::test]
async fn resize_is_forwarded_and_clamped() {
    let mut h = start_session(None);

    h.input_tx
        .send(TermInput::Resize {
            cols: 9999,
            rows: 0,
        })
        .await
        .unwrap();

    let cmd = timeout(TICK, h.remote.recv_command()).await.unwrap().unwrap();
    match cmd {
        PtyCommand::Resize { cols, rows } => {
            assert_eq!(cols, opshub_core::constants::MAX_TERMINAL_COLS);
            assert_eq!(rows, 1);
        }
        other => panic!("expected resize, got {:?}", other),
    }
}

#[tokio::test]
async fn remote_exit_closes_the_browser_stream_cleanly() {
    let mut h = start_session(None);

    h.remote.send_output(b"logout\n").await.unwrap();
    h.remote.close_output();

    let frame = timeout(TICK, h.output_rx.recv()).await.unwrap().unwrap();
    assert_eq!(frame, TermOutput::Data(b"logout\n".to_vec()));

    // Stream ends without an error frame: a natural exit.
    assert!(timeout(TICK, h.output_rx.recv()).await.unwrap().is_none());
    h.session.wait().await;
}

#[tokio::test]
async fn browser_disconnect_tears_the_session_down() {
    let mut h = start_session(None);

    drop(h.input_tx);

    // The relay receives the close and the session finishes.
    loop {
        match timeout(TICK, h.remote.recv_command()).await.unwrap() {
            Some(PtyCommand::Close) | None => break,
            Some(_) => {}
        }
    }
    h.session.wait().await;
}

#[tokio::test]
async fn dead_pty_write_emits_an_error_frame() {
    let mut h = start_session(None);

    // The remote stops accepting input but its output pipe stays open,
    // which is what a torn transport looks like to the bridge.
    h.remote.close_input();

    h.input_tx
        .send(TermInput::Data(b"anyone there?\n".to_vec()))
        .await
        .unwrap();

    let frame = timeout(TICK, h.output_rx.recv()).await.unwrap().unwrap();
    assert!(matches!(frame, TermOutput::Error(_)));
    assert!(timeout(TICK, h.output_rx.recv()).await.unwrap().is_none());
    h.session.wait().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let h = start_session(None);

    h.session.stop();
    h.session.stop();
    h.session.wait().await;

    // Stopping after closure is also fine.
    let mut h2 = start_session(None);
    h2.remote.close_output();
    // Give the bridge a moment to notice.
    tokio::time::sleep(Duration::from_millis(20)).await;
    h2.session.stop();
    assert!(h2.session.is_closed());
}

#[tokio::test]
async fn output_is_recorded_and_replayable() {
    let dir = tempfile::tempdir().unwrap();
    let recorder =
        SessionRecorder::create(dir.path(), 7, "alice", chrono::Local::now()).unwrap();

    let mut h = start_session(Some(recorder));
    h.remote.send_output(b"one").await.unwrap();
    h.remote.send_output(b"two").await.unwrap();

    // Drain the browser side so the bridge keeps pumping.
    timeout(TICK, h.output_rx.recv()).await.unwrap().unwrap();
    timeout(TICK, h.output_rx.recv()).await.unwrap().unwrap();

    h.remote.close_output();
    h.session.wait().await;

    let store = ReplayStore::new(dir.path());
    let recordings = store.list(7).unwrap();
    assert_eq!(recordings.len(), 1);

    let raw = store.read(&recordings[0].rel_path).unwrap();
    let events = decode_all(&raw).unwrap();
    let payloads: Vec<&[u8]> = events.iter().map(|e| &e.payload[..]).collect();
    assert_eq!(payloads, vec![b"one".as_slice(), b"two".as_slice()]);
}

#[tokio::test]
async fn tokens_are_unique_and_sized() {
    let a = new_session_token();
    let b = new_session_token();
    assert_eq!(a.len(), opshub_core::constants::SESSION_TOKEN_LEN);
    assert_ne!(a, b);
    assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
}
