//! Per-session I/O relay.
//!
//! Three tasks per session: a blocking read pump (PTY → buffer → client
//! queues), a blocking wait for process exit, and an async supervisor that
//! turns their outcomes into the session's terminal state.

use crate::pty::{PtyProcess, PtyRead, PtyReader};
use crate::session::Session;
use std::sync::Arc;
use std::time::Duration;
use termin_core::{SessionEnd, TerminError, TerminResult};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Start relaying a session that just entered `Running`.
pub fn spawn(
    session: Arc<Session>,
    process: Arc<dyn PtyProcess>,
    reader: Box<dyn PtyReader>,
    drain_grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(supervise(session, process, reader, drain_grace))
}

async fn supervise(
    session: Arc<Session>,
    process: Arc<dyn PtyProcess>,
    reader: Box<dyn PtyReader>,
    drain_grace: Duration,
) {
    let session_id = session.id().clone();
    debug!(session_id = %session_id, "relay started");

    let pump_session = session.clone();
    let mut pump = tokio::task::spawn_blocking(move || read_loop(&pump_session, reader));
    let wait_process = process.clone();
    let mut wait = tokio::task::spawn_blocking(move || wait_process.wait());

    let end = tokio::select! {
        res = &mut pump => match flatten(res) {
            Ok(()) => {
                debug!(session_id = %session_id, "output stream closed, waiting for exit");
                match flatten(wait.await) {
                    Ok(code) => SessionEnd::Exited { code },
                    Err(e) => SessionEnd::Failed { reason: format!("wait failed: {}", e.detail()) },
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "PTY read failed, terminating process");
                if let Err(te) = process.terminate() {
                    warn!(session_id = %session_id, error = %te, "terminate after read failure failed");
                }
                SessionEnd::Failed { reason: format!("read failed: {}", e.detail()) }
            }
        },
        res = &mut wait => match flatten(res) {
            Ok(code) => {
                // Output written just before exit may still be in flight.
                match tokio::time::timeout(drain_grace, &mut pump).await {
                    Ok(_) => {}
                    Err(_) => debug!(
                        session_id = %session_id,
                        grace_ms = drain_grace.as_millis() as u64,
                        "stream still open after exit, not waiting further"
                    ),
                }
                SessionEnd::Exited { code }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "wait failed, terminating process");
                let _ = process.terminate();
                SessionEnd::Failed { reason: format!("wait failed: {}", e.detail()) }
            }
        },
    };

    if let SessionEnd::Exited { code } = &end {
        info!(session_id = %session_id, code, "process exited");
    }
    session.finish(end);
}

fn read_loop(session: &Session, mut reader: Box<dyn PtyReader>) -> TerminResult<()> {
    loop {
        match reader.read() {
            Ok(PtyRead::Data(chunk)) => session.publish(&chunk),
            Ok(PtyRead::Eof) => return Ok(()),
            Err(TerminError::Io(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn flatten<T>(res: Result<TerminResult<T>, JoinError>) -> TerminResult<T> {
    res.map_err(|e| TerminError::io(format!("relay task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::scripted::{Script, ScriptedBackend};
    use crate::pty::PtyBackend;
    use crate::session::{CloseReason, Subscriber};
    use termin_core::messages::CreateSession;
    use termin_core::{AttachEvent, SessionId, SessionState};
    use tokio::sync::mpsc;

    const GRACE: Duration = Duration::from_millis(50);

    fn start(backend: &ScriptedBackend, program: &str) -> (Arc<Session>, JoinHandle<()>) {
        let session = Arc::new(Session::new(
            SessionId::generate(1),
            CreateSession::new(program),
            1024,
            None,
        ));
        let opened = backend.open(session.launch()).unwrap();
        session.mark_running(opened.process.clone());
        let relay = spawn(session.clone(), opened.process, opened.reader, GRACE);
        (session, relay)
    }

    #[tokio::test]
    async fn emit_then_exit() {
        let backend = ScriptedBackend::new().with(
            "prog",
            Script::Emit {
                chunks: vec![b"one ".to_vec(), b"two".to_vec()],
                code: 3,
            },
        );
        let (session, relay) = start(&backend, "prog");
        relay.await.unwrap();

        assert_eq!(session.state(), SessionState::Exited { code: 3 });
        assert_eq!(session.retained_output(), b"one two");
        assert!(!session.has_pty());
    }

    #[tokio::test]
    async fn read_error_fails_the_session_and_kills_the_process() {
        let backend = ScriptedBackend::new().with(
            "flaky",
            Script::FailAfter {
                chunks: vec![b"partial".to_vec()],
                reason: "device gone".into(),
            },
        );
        let (session, relay) = start(&backend, "flaky");
        relay.await.unwrap();

        match session.state() {
            SessionState::Failed { reason } => assert!(reason.contains("device gone"), "{reason}"),
            other => panic!("expected failed, got {other}"),
        }
        assert_eq!(backend.last_handle().terminate_calls(), 1);
        assert_eq!(session.retained_output(), b"partial");
    }

    #[tokio::test]
    async fn exit_with_lingering_stream_finishes_after_grace() {
        let backend = ScriptedBackend::new().with(
            "daemonizes",
            Script::Linger {
                chunks: vec![b"started".to_vec()],
                code: 0,
            },
        );
        let (session, relay) = start(&backend, "daemonizes");
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay should not wait for the stream")
            .unwrap();

        assert_eq!(session.state(), SessionState::Exited { code: 0 });
        assert_eq!(session.retained_output(), b"started");
    }

    #[tokio::test]
    async fn mirrored_clients_see_identical_bytes() {
        let backend = ScriptedBackend::standard();
        let (session, relay) = start(&backend, "silent");

        let mut receivers = Vec::new();
        for id in 1..=2 {
            let (tx, rx) = mpsc::channel(256);
            session
                .subscribe(Subscriber::new(id, format!("c{id}"), tx, CloseReason::default()))
                .unwrap();
            receivers.push(rx);
        }

        let handle = backend.last_handle();
        for chunk in [&b"alpha "[..], b"beta ", b"gamma"] {
            handle.push_output(chunk);
        }
        handle.exit(0);
        relay.await.unwrap();

        let mut outputs: Vec<Vec<u8>> = Vec::new();
        for mut rx in receivers {
            let mut bytes: Vec<u8> = Vec::new();
            let mut ends = 0;
            while let Some(ev) = rx.recv().await {
                match ev {
                    AttachEvent::Replay(b) | AttachEvent::Output(b) => bytes.extend(b),
                    AttachEvent::End(_) => ends += 1,
                    AttachEvent::Closed(r) => panic!("unexpected close: {r}"),
                }
            }
            assert_eq!(ends, 1);
            outputs.push(bytes);
        }
        assert_eq!(outputs[0], b"alpha beta gamma");
        assert_eq!(outputs[0], outputs[1]);
    }
}
