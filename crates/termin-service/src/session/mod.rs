//! A managed terminal session: one process, its PTY handle, lifecycle state,
//! retained output and the clients subscribed to it.
//!
//! All mutable state lives behind the session's own mutex. Critical sections
//! only touch memory: queue sends under the lock are non-blocking
//! `try_send`s, and PTY calls happen after unlocking. Output and the end
//! marker are both sent under the lock, so no output follows the end marker.

pub mod buffer;

use crate::pty::PtyProcess;
use crate::recording::{RecordingEvent, SessionRecorder};
use buffer::OutputBuffer;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use termin_core::messages::CreateSession;
use termin_core::{
    AttachEvent, AttachmentId, DetachReason, SessionEnd, SessionId, SessionState, SessionSummary,
    TermSize, TerminError, TerminResult,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared close reason for one attachment, set by whoever removes it.
pub type CloseReason = Arc<OnceLock<DetachReason>>;

/// One client queue registered on a session.
#[derive(Clone)]
pub struct Subscriber {
    pub attachment_id: AttachmentId,
    pub client_id: String,
    tx: mpsc::Sender<AttachEvent>,
    reason: CloseReason,
}

impl Subscriber {
    /// The channel needs one slot beyond `capacity` for the end marker.
    pub fn new(
        attachment_id: AttachmentId,
        client_id: String,
        tx: mpsc::Sender<AttachEvent>,
        reason: CloseReason,
    ) -> Self {
        Self {
            attachment_id,
            client_id,
            tx,
            reason,
        }
    }

    fn close(&self, reason: DetachReason) {
        let _ = self.reason.set(reason);
    }
}

/// Outcome of registering a subscriber.
#[derive(Debug, PartialEq, Eq)]
pub enum Subscription {
    /// Registered for live output after the replay.
    Live,
    /// The session already ended: replay and end marker queued, not registered.
    Ended,
}

struct SessionInner {
    state: SessionState,
    pty: Option<Arc<dyn PtyProcess>>,
    buffer: OutputBuffer,
    size: TermSize,
    end: Option<SessionEnd>,
    ended_at: Option<Instant>,
    terminate_requested: bool,
    subscribers: Arc<Vec<Subscriber>>,
}

impl SessionInner {
    /// Enter the terminal state described by `end` and hand back the
    /// subscribers, each already sent its end marker. Returns `None` if the
    /// transition is illegal.
    fn conclude(&mut self, id: &SessionId, end: SessionEnd) -> Option<Arc<Vec<Subscriber>>> {
        if !self.transition(id, SessionState::from(&end)) {
            return None;
        }
        self.ended_at = Some(Instant::now());
        let subscribers = std::mem::take(&mut self.subscribers);
        for sub in subscribers.iter() {
            if sub.tx.try_send(AttachEvent::End(end.clone())).is_err() {
                debug!(session_id = %id, attachment_id = sub.attachment_id, "end marker not delivered");
            }
        }
        self.end = Some(end);
        if self.terminate_requested {
            self.transition(id, SessionState::Terminated);
        }
        Some(subscribers)
    }

    fn transition(&mut self, id: &SessionId, next: SessionState) -> bool {
        if !self.state.can_transition_to(&next) {
            warn!(session_id = %id, from = %self.state, to = %next, "illegal state transition ignored");
            return false;
        }
        debug!(session_id = %id, from = %self.state, to = %next, "state transition");
        self.state = next;
        true
    }
}

pub struct Session {
    id: SessionId,
    launch: CreateSession,
    /// Seconds since the unix epoch.
    created_at: u64,
    recorder: Option<SessionRecorder>,
    /// Held across each blocking PTY write so writes never interleave, even
    /// when an earlier one outlived its caller's timeout.
    input_gate: Arc<Mutex<()>>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        launch: CreateSession,
        scrollback: usize,
        recorder: Option<SessionRecorder>,
    ) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let size = launch.size;
        Self {
            id,
            launch,
            created_at,
            recorder,
            input_gate: Arc::new(Mutex::new(())),
            inner: Mutex::new(SessionInner {
                state: SessionState::Starting,
                pty: None,
                buffer: OutputBuffer::new(scrollback),
                size,
                end: None,
                ended_at: None,
                terminate_requested: false,
                subscribers: Arc::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn launch(&self) -> &CreateSession {
        &self.launch
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        // No critical section can panic midway through a mutation, so a
        // poisoned lock still guards consistent state.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().state.is_terminal()
    }

    /// How long the session has been in a terminal state.
    pub fn ended_for(&self) -> Option<Duration> {
        self.lock().ended_at.map(|t| t.elapsed())
    }

    #[cfg(test)]
    pub(crate) fn has_pty(&self) -> bool {
        self.lock().pty.is_some()
    }

    pub fn summary(&self) -> SessionSummary {
        let inner = self.lock();
        SessionSummary {
            id: self.id.clone(),
            command: self.launch.command.clone(),
            args: self.launch.args.clone(),
            state: inner.state.clone(),
            exit_code: inner.end.as_ref().and_then(SessionEnd::exit_code),
            failure: match &inner.end {
                Some(SessionEnd::Failed { reason }) => Some(reason.clone()),
                _ => None,
            },
            size: inner.size,
            created_at: self.created_at,
            attached: inner.subscribers.len(),
            buffered_bytes: inner.buffer.len(),
        }
    }

    /// `Starting → Running`. Returns whether a terminate arrived while the
    /// process was being spawned, in which case the caller must terminate it.
    pub(crate) fn mark_running(&self, pty: Arc<dyn PtyProcess>) -> bool {
        let mut inner = self.lock();
        if inner.transition(&self.id, SessionState::Running) {
            inner.pty = Some(pty);
        }
        if let Some(recorder) = &self.recorder {
            recorder.record(RecordingEvent::Start {
                command: self.launch.command.clone(),
                args: self.launch.args.clone(),
            });
        }
        inner.terminate_requested
    }

    /// `Starting → Failed` when the process could not be spawned.
    /// Clients that attached during the spawn get the end marker.
    pub(crate) fn mark_spawn_failed(&self, reason: String) {
        let end = SessionEnd::Failed { reason };
        let mut inner = self.lock();
        let Some(subscribers) = inner.conclude(&self.id, end.clone()) else {
            return;
        };
        self.record_end(&end);
        let state = inner.state.clone();
        drop(inner);
        info!(session_id = %self.id, %state, clients = subscribers.len(), "session failed to start");
    }

    /// Append a chunk to the retained buffer and fan it out to every
    /// subscriber, in attachment order. Subscribers whose queue is full are
    /// disconnected as slow consumers; closed queues are dropped. Output
    /// arriving after the session ended is discarded.
    pub(crate) fn publish(&self, chunk: &[u8]) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            debug!(session_id = %self.id, bytes = chunk.len(), "output after end discarded");
            return;
        }
        inner.buffer.append(chunk);
        if let Some(recorder) = &self.recorder {
            recorder.record(RecordingEvent::Output(chunk.to_vec()));
        }

        let mut evicted: Vec<(Subscriber, DetachReason)> = Vec::new();
        for sub in inner.subscribers.iter() {
            if sub.tx.is_closed() {
                evicted.push((sub.clone(), DetachReason::Detached));
                continue;
            }
            // The last slot is reserved for the end marker.
            if sub.tx.capacity() <= 1
                || sub.tx.try_send(AttachEvent::Output(chunk.to_vec())).is_err()
            {
                evicted.push((sub.clone(), DetachReason::SlowConsumer));
            }
        }
        if evicted.is_empty() {
            return;
        }
        let kept: Vec<Subscriber> = inner
            .subscribers
            .iter()
            .filter(|s| !evicted.iter().any(|(e, _)| e.attachment_id == s.attachment_id))
            .cloned()
            .collect();
        inner.subscribers = Arc::new(kept);
        drop(inner);

        // The reason is set while `evicted` still holds a sender, so the
        // receiver sees it once the queue closes.
        for (sub, reason) in evicted {
            if reason == DetachReason::SlowConsumer {
                warn!(
                    session_id = %self.id,
                    attachment_id = sub.attachment_id,
                    client_id = %sub.client_id,
                    "client queue full, disconnecting slow consumer"
                );
            }
            sub.close(reason);
        }
    }

    /// Register a subscriber. The replay snapshot and the registration are
    /// taken under one lock so no chunk is lost or duplicated.
    pub(crate) fn subscribe(&self, sub: Subscriber) -> TerminResult<Subscription> {
        let mut inner = self.lock();

        if inner.state.is_terminal() {
            if inner.buffer.is_empty() {
                return Err(TerminError::InvalidState(format!(
                    "session {} has ended ({}) and has no retained output",
                    self.id, inner.state
                )));
            }
            let end = inner.end.clone().unwrap_or(SessionEnd::Exited { code: -1 });
            let replay = inner.buffer.snapshot();
            drop(inner);
            let _ = sub.tx.try_send(AttachEvent::Replay(replay));
            let _ = sub.tx.try_send(AttachEvent::End(end));
            return Ok(Subscription::Ended);
        }

        if sub.tx.try_send(AttachEvent::Replay(inner.buffer.snapshot())).is_err() {
            return Err(TerminError::InvalidArgument(
                "attachment queue cannot hold the replay".into(),
            ));
        }
        let mut list = (*inner.subscribers).clone();
        list.push(sub);
        inner.subscribers = Arc::new(list);
        Ok(Subscription::Live)
    }

    /// Remove a subscriber, recording why its stream closed. Returns false
    /// if it was not registered.
    pub(crate) fn remove_subscriber(&self, attachment_id: AttachmentId, reason: DetachReason) -> bool {
        let mut inner = self.lock();
        let Some(pos) = inner
            .subscribers
            .iter()
            .position(|s| s.attachment_id == attachment_id)
        else {
            return false;
        };
        let mut list = (*inner.subscribers).clone();
        let sub = list.remove(pos);
        inner.subscribers = Arc::new(list);
        drop(inner);

        sub.close(reason);
        debug!(session_id = %self.id, attachment_id, %reason, "subscriber removed");
        true
    }

    /// Move out of `Running` into the terminal state described by `end`.
    ///
    /// Releases the PTY handle, delivers one end marker to every subscriber
    /// and closes their queues. A terminate requested earlier completes
    /// here as `Terminated`. No-op if the session already ended.
    pub(crate) fn finish(&self, end: SessionEnd) -> Option<Arc<dyn PtyProcess>> {
        let mut inner = self.lock();
        let subscribers = inner.conclude(&self.id, end.clone())?;
        let pty = inner.pty.take();
        self.record_end(&end);
        let state = inner.state.clone();
        drop(inner);

        info!(session_id = %self.id, %state, clients = subscribers.len(), "session ended");
        pty
    }

    fn record_end(&self, end: &SessionEnd) {
        if let Some(recorder) = &self.recorder {
            match end {
                SessionEnd::Exited { code } => recorder.record(RecordingEvent::Exit { code: *code }),
                SessionEnd::Failed { reason } => recorder.record(RecordingEvent::Failed {
                    reason: reason.clone(),
                }),
            }
        }
    }

    /// Record a terminate request.
    ///
    /// Returns the PTY handle to signal when the process is still live.
    /// An ended session moves straight to `Terminated`.
    pub(crate) fn request_terminate(&self) -> Option<Arc<dyn PtyProcess>> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Starting | SessionState::Running => {
                inner.terminate_requested = true;
                inner.pty.clone()
            }
            SessionState::Exited { .. } | SessionState::Failed { .. } => {
                inner.transition(&self.id, SessionState::Terminated);
                None
            }
            SessionState::Terminated => None,
        }
    }

    /// The PTY handle for input, or `InvalidState` unless running.
    pub(crate) fn input_target(&self) -> TerminResult<Arc<dyn PtyProcess>> {
        let inner = self.lock();
        match (&inner.state, &inner.pty) {
            (SessionState::Running, Some(pty)) => Ok(pty.clone()),
            (state, _) => Err(TerminError::InvalidState(format!(
                "session {} is not running ({state})",
                self.id
            ))),
        }
    }

    /// Lock to hold for the duration of one PTY write.
    pub(crate) fn input_gate(&self) -> Arc<Mutex<()>> {
        self.input_gate.clone()
    }

    pub(crate) fn record_input(&self, data: &[u8]) {
        if let Some(recorder) = &self.recorder {
            recorder.record(RecordingEvent::Input(data.to_vec()));
        }
    }

    /// Update the size and return the handle to resize, if running.
    pub(crate) fn resize_target(&self, size: TermSize) -> Option<Arc<dyn PtyProcess>> {
        let mut inner = self.lock();
        if inner.state != SessionState::Running {
            return None;
        }
        inner.size = size;
        let pty = inner.pty.clone();
        drop(inner);
        if let Some(recorder) = &self.recorder {
            recorder.record_resize(size);
        }
        pty
    }

    #[cfg(test)]
    pub(crate) fn retained_output(&self) -> Vec<u8> {
        self.lock().buffer.snapshot()
    }
}
