//! Client attachments: which client is subscribed to which session.
//!
//! A client holds at most one attachment; attaching again supersedes the
//! previous one. Detaching never affects the session itself.

use crate::registry::SessionRegistry;
use crate::session::{CloseReason, Session, Subscriber, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use termin_core::{AttachEvent, AttachmentId, DetachReason, SessionId, TerminResult};
use tokio::sync::mpsc;
use tracing::{debug, info};

struct AttachmentEntry {
    session_id: SessionId,
    client_id: String,
    attached_at: Instant,
    session: Weak<Session>,
}

#[derive(Default)]
struct AttachIndex {
    by_id: HashMap<AttachmentId, AttachmentEntry>,
    by_client: HashMap<String, AttachmentId>,
}

type SharedIndex = Arc<Mutex<AttachIndex>>;

fn lock_index(index: &Mutex<AttachIndex>) -> MutexGuard<'_, AttachIndex> {
    index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn remove_entry(index: &Mutex<AttachIndex>, attachment_id: AttachmentId) -> Option<AttachmentEntry> {
    let mut index = lock_index(index);
    let entry = index.by_id.remove(&attachment_id)?;
    if index.by_client.get(&entry.client_id) == Some(&attachment_id) {
        index.by_client.remove(&entry.client_id);
    }
    Some(entry)
}

/// Snapshot of one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub attachment_id: AttachmentId,
    pub session_id: SessionId,
    pub client_id: String,
    pub attached_at: Instant,
}

pub struct AttachmentManager {
    registry: Arc<SessionRegistry>,
    index: SharedIndex,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl AttachmentManager {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let queue_capacity = registry.config().client_queue_capacity.max(2);
        Self {
            registry,
            index: SharedIndex::default(),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    /// Subscribe `client_id` to a session.
    ///
    /// The stream yields the retained output as one replay event, then live
    /// output. For an ended session it yields the replay and the end marker.
    pub async fn attach(&self, session_id: &SessionId, client_id: &str) -> TerminResult<AttachmentStream> {
        let session = self.registry.get(session_id).await?;
        let attachment_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // One slot beyond capacity stays free for the end marker.
        let (tx, rx) = mpsc::channel(self.queue_capacity + 1);
        let reason = CloseReason::default();
        let subscription = session.subscribe(Subscriber::new(
            attachment_id,
            client_id.to_string(),
            tx,
            reason.clone(),
        ))?;

        let previous = {
            let mut index = lock_index(&self.index);
            index.by_id.insert(
                attachment_id,
                AttachmentEntry {
                    session_id: session_id.clone(),
                    client_id: client_id.to_string(),
                    attached_at: Instant::now(),
                    session: Arc::downgrade(&session),
                },
            );
            index.by_client.insert(client_id.to_string(), attachment_id)
        };
        if let Some(previous) = previous {
            if self.detach_with(previous, DetachReason::Superseded) {
                info!(client_id, attachment_id = previous, "previous attachment superseded");
            }
        }

        info!(
            session_id = %session_id,
            attachment_id,
            client_id,
            ended = subscription == Subscription::Ended,
            "client attached"
        );
        Ok(AttachmentStream {
            attachment_id,
            session_id: session_id.clone(),
            rx,
            reason,
            finished: false,
            cleanup: Some(Cleanup {
                attachment_id,
                session: Arc::downgrade(&session),
                index: Arc::downgrade(&self.index),
            }),
        })
    }

    /// Detach an attachment. Unknown or already removed ids are a no-op.
    pub fn detach(&self, attachment_id: AttachmentId) {
        if self.detach_with(attachment_id, DetachReason::Detached) {
            info!(attachment_id, "client detached");
        } else {
            debug!(attachment_id, "detach of unknown attachment ignored");
        }
    }

    fn detach_with(&self, attachment_id: AttachmentId, reason: DetachReason) -> bool {
        let Some(entry) = remove_entry(&self.index, attachment_id) else {
            return false;
        };
        if let Some(session) = entry.session.upgrade() {
            session.remove_subscriber(attachment_id, reason);
        }
        true
    }

    pub fn list(&self) -> Vec<AttachmentInfo> {
        let index = lock_index(&self.index);
        let mut out: Vec<AttachmentInfo> = index
            .by_id
            .iter()
            .map(|(id, e)| AttachmentInfo {
                attachment_id: *id,
                session_id: e.session_id.clone(),
                client_id: e.client_id.clone(),
                attached_at: e.attached_at,
            })
            .collect();
        out.sort_by_key(|a| a.attachment_id);
        out
    }

    #[cfg(test)]
    pub(crate) fn client_attachment(&self, client_id: &str) -> Option<AttachmentId> {
        lock_index(&self.index).by_client.get(client_id).copied()
    }
}

struct Cleanup {
    attachment_id: AttachmentId,
    session: Weak<Session>,
    index: Weak<Mutex<AttachIndex>>,
}

impl Cleanup {
    fn run(self) {
        if let Some(index) = self.index.upgrade() {
            remove_entry(&index, self.attachment_id);
        }
        if let Some(session) = self.session.upgrade() {
            session.remove_subscriber(self.attachment_id, DetachReason::Detached);
        }
    }
}

/// Events for one attachment.
///
/// Ends after exactly one final event: `End` when the session ended, or
/// `Closed` when the attachment went away while the session lives on.
/// Dropping the stream detaches it.
pub struct AttachmentStream {
    attachment_id: AttachmentId,
    session_id: SessionId,
    rx: mpsc::Receiver<AttachEvent>,
    reason: CloseReason,
    finished: bool,
    cleanup: Option<Cleanup>,
}

impl AttachmentStream {
    pub fn id(&self) -> AttachmentId {
        self.attachment_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn recv(&mut self) -> Option<AttachEvent> {
        if self.finished {
            return None;
        }
        let event = match self.rx.recv().await {
            Some(event) => event,
            None => AttachEvent::Closed(self.reason.get().copied().unwrap_or(DetachReason::Detached)),
        };
        if event.is_final() {
            self.finished = true;
            if let Some(cleanup) = self.cleanup.take() {
                cleanup.run();
            }
        }
        Some(event)
    }
}

impl Drop for AttachmentStream {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.run();
        }
    }
}
