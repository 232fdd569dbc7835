//! `termin attach <session>`: interactive attach.
//!
//! Puts the local terminal in raw mode, relays keystrokes and resizes to the
//! session and writes its output to stdout. Ctrl+] detaches and leaves the
//! session running.

use crate::terminal::{self, RawModeGuard};
use anyhow::Result;
use crossterm::event::{self, Event, KeyEventKind};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use termin_client::BrokerClient;
use termin_core::{AttachEvent, DetachReason, SessionEnd, TermSize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How the interactive loop ended.
#[derive(Debug)]
enum Outcome {
    Detached,
    Ended(SessionEnd),
    Closed(DetachReason),
    Disconnected,
}

pub async fn run(client: &BrokerClient, session_id: &str) -> Result<()> {
    let size = terminal::current_size();
    if let Err(e) = client.resize(session_id, size).await {
        debug!(error = %e, "initial resize failed");
    }

    let mut attachment = client.attach(session_id).await?;
    let attachment_id = attachment.id;
    let short = attachment.session_id.short().to_string();

    let guard = RawModeGuard::enter()?;
    eprint!("[termin: attached to {short}, Ctrl+] to detach]\r\n");

    let (tx_input, mut rx_input) = mpsc::channel::<Vec<u8>>(64);
    let (tx_resize, mut rx_resize) = mpsc::channel::<TermSize>(8);
    let (tx_quit, mut rx_quit) = mpsc::channel::<()>(1);
    let stop = Arc::new(AtomicBool::new(false));

    // Poll with a timeout so the thread notices `stop` and exits.
    let input_stop = stop.clone();
    let input_handle = tokio::task::spawn_blocking(move || {
        while !input_stop.load(Ordering::Relaxed) {
            match event::poll(Duration::from_millis(100)) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    warn!(error = %e, "terminal event poll failed");
                    break;
                }
            }
            match event::read() {
                Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => {
                    if terminal::is_detach_key(&key) {
                        let _ = tx_quit.blocking_send(());
                        break;
                    }
                    if let Some(bytes) = terminal::key_event_to_bytes(&key) {
                        if tx_input.blocking_send(bytes).is_err() {
                            break;
                        }
                    }
                }
                Ok(Event::Paste(text)) => {
                    if tx_input.blocking_send(text.into_bytes()).is_err() {
                        break;
                    }
                }
                Ok(Event::Resize(cols, rows)) => {
                    let _ = tx_resize.blocking_send(TermSize::new(rows, cols));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "terminal event read failed");
                    break;
                }
            }
        }
    });

    // Output and control run side by side: a reply to an input request can
    // queue behind output, so output must keep draining while one is pending.
    let output = async {
        let mut stdout = std::io::stdout();
        loop {
            match attachment.recv().await {
                Some(AttachEvent::Replay(bytes)) | Some(AttachEvent::Output(bytes)) => {
                    stdout.write_all(&bytes)?;
                    stdout.flush()?;
                }
                Some(AttachEvent::End(end)) => return Ok::<_, std::io::Error>(Outcome::Ended(end)),
                Some(AttachEvent::Closed(reason)) => return Ok(Outcome::Closed(reason)),
                None => return Ok(Outcome::Disconnected),
            }
        }
    };
    let control = async {
        loop {
            tokio::select! {
                Some(bytes) = rx_input.recv() => {
                    if let Err(e) = client.send_input(session_id, &bytes).await {
                        warn!(error = %e, "input not delivered");
                    }
                }
                Some(size) = rx_resize.recv() => {
                    if let Err(e) = client.resize(session_id, size).await {
                        debug!(error = %e, "resize failed");
                    }
                }
                _ = rx_quit.recv() => return Outcome::Detached,
            }
        }
    };
    let outcome = tokio::select! {
        res = output => res,
        outcome = control => Ok(outcome),
    };
    // Stop routing output before waiting on the detach reply.
    drop(attachment);
    if let Ok(Outcome::Detached) = outcome {
        if let Err(e) = client.detach(attachment_id).await {
            debug!(error = %e, "detach failed");
        }
    }

    stop.store(true, Ordering::Relaxed);
    let _ = input_handle.await;
    drop(guard);

    match outcome? {
        Outcome::Detached => eprintln!("\n[termin: detached from {short}]"),
        Outcome::Ended(SessionEnd::Exited { code }) => {
            eprintln!("\n[termin: session {short} exited with code {code}]")
        }
        Outcome::Ended(SessionEnd::Failed { reason }) => {
            eprintln!("\n[termin: session {short} failed: {reason}]")
        }
        Outcome::Closed(reason) => eprintln!("\n[termin: attachment closed ({reason})]"),
        Outcome::Disconnected => anyhow::bail!("connection to terminservice lost"),
    }
    Ok(())
}
