//! The broker client.
//!
//! A reader task routes responses to the waiting caller by request id and
//! attachment events to the matching [`Attachment`]. A writer task owns the
//! socket's write half.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time;

use termin_core::messages::{
    ClientMessage, CreateSession, Reply, RequestBody, ResponseBody, ServerMessage,
};
use termin_core::{
    frame_encode, read_frame, AttachEvent, AttachmentId, SessionId, SessionSummary, TermSize,
    TerminError, TerminResult,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Events buffered per attachment before the reader waits for the consumer.
const EVENT_QUEUE: usize = 256;

/// A reply plus, for a successful attach, the channel its events arrive on.
struct Delivered {
    reply: Reply,
    events: Option<mpsc::Receiver<AttachEvent>>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Delivered>>>>;
type Routes = Arc<Mutex<HashMap<AttachmentId, mpsc::Sender<AttachEvent>>>>;

/// Live output of one attached session.
///
/// Events share the connection with replies. Keep draining (or drop) the
/// attachment while awaiting other calls on the same client, or a full
/// event queue stalls the replies behind it.
pub struct Attachment {
    pub id: AttachmentId,
    pub session_id: SessionId,
    events: mpsc::Receiver<AttachEvent>,
}

impl Attachment {
    /// Next event; `None` after the final event or when the connection drops.
    pub async fn recv(&mut self) -> Option<AttachEvent> {
        self.events.recv().await
    }
}

pub struct BrokerClient {
    /// Encoded frames for the writer task.
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    pending: Pending,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    client_id: String,
    server: String,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl BrokerClient {
    /// Connect to a service at `addr` (`host:port`) and read its greeting.
    pub async fn connect(addr: &str) -> TerminResult<Self> {
        let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TerminError::Timeout(format!("connecting to {addr}")))?
            .map_err(|e| TerminError::Transport(format!("connect {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let hello = time::timeout(CONNECT_TIMEOUT, read_frame::<_, ServerMessage>(&mut reader))
            .await
            .map_err(|_| TerminError::Timeout("waiting for server greeting".into()))??;
        let (client_id, server) = match hello {
            Some(ServerMessage::Hello {
                version,
                server,
                client_id,
            }) => {
                if version != termin_core::PROTOCOL_VERSION {
                    return Err(TerminError::Protocol(format!(
                        "server speaks protocol {version}, expected {}",
                        termin_core::PROTOCOL_VERSION
                    )));
                }
                (client_id, server)
            }
            Some(other) => {
                return Err(TerminError::Protocol(format!(
                    "expected greeting, got {other:?}"
                )))
            }
            None => return Err(TerminError::Transport("connection closed during greeting".into())),
        };
        tracing::debug!(%server, %client_id, "connected");

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer_handle = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let written = match writer.write_all(&frame).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    tracing::debug!(error = %e, "write failed");
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(Self::dispatch_loop(
            reader,
            pending.clone(),
            connected.clone(),
        ));

        Ok(Self {
            outgoing_tx,
            pending,
            next_id: AtomicU64::new(1),
            connected,
            client_id,
            server,
            reader_handle,
            writer_handle,
        })
    }

    /// Route incoming frames until the connection closes.
    async fn dispatch_loop(mut reader: OwnedReadHalf, pending: Pending, connected: Arc<AtomicBool>) {
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        loop {
            let msg = match read_frame::<_, ServerMessage>(&mut reader).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "connection read failed");
                    break;
                }
            };

            match msg {
                ServerMessage::Response { id, reply } => {
                    // Register the event route before the caller sees the
                    // reply so no event can arrive unrouted.
                    let events = match &reply {
                        Reply::Ok(ResponseBody::Attached { attachment_id, .. }) => {
                            let (tx, rx) = mpsc::channel(EVENT_QUEUE);
                            routes.lock().await.insert(*attachment_id, tx);
                            Some(rx)
                        }
                        _ => None,
                    };
                    if let Some(waiter) = pending.lock().await.remove(&id) {
                        let _ = waiter.send(Delivered { reply, events });
                    } else {
                        tracing::debug!(request_id = id, "response without a waiter");
                    }
                }
                ServerMessage::Event {
                    attachment_id,
                    event,
                } => {
                    let is_final = event.is_final();
                    let tx = routes.lock().await.get(&attachment_id).cloned();
                    if let Some(tx) = tx {
                        if tx.send(event).await.is_err() || is_final {
                            routes.lock().await.remove(&attachment_id);
                        }
                    }
                }
                ServerMessage::Hello { .. } => {
                    tracing::debug!("ignoring repeated greeting");
                }
            }
        }

        connected.store(false, Ordering::Release);
        // Waiters see the connection drop; attachment streams end.
        pending.lock().await.clear();
        routes.lock().await.clear();
        tracing::debug!("dispatch loop ended");
    }

    /// Client id the server assigned to this connection.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Server name and version from the greeting.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn request(&self, body: RequestBody) -> TerminResult<Delivered> {
        if !self.is_connected() {
            return Err(TerminError::Transport("not connected".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Encode here so an oversized request fails this call only.
        let frame = frame_encode(&ClientMessage { id, body })?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outgoing_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(TerminError::Transport("connection closed".into()));
        }
        rx.await
            .map_err(|_| TerminError::Transport("connection closed before the reply".into()))
    }

    async fn call(&self, body: RequestBody) -> TerminResult<ResponseBody> {
        match self.request(body).await?.reply {
            Reply::Ok(body) => Ok(body),
            Reply::Err(e) => Err(e.into()),
        }
    }

    pub async fn create_session(&self, req: CreateSession) -> TerminResult<SessionSummary> {
        match self.call(RequestBody::CreateSession(req)).await? {
            ResponseBody::Session(summary) => Ok(summary),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_sessions(&self) -> TerminResult<Vec<SessionSummary>> {
        match self.call(RequestBody::ListSessions).await? {
            ResponseBody::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    pub async fn session_state(&self, session_id: &str) -> TerminResult<SessionSummary> {
        match self
            .call(RequestBody::SessionState {
                session_id: session_id.to_string(),
            })
            .await?
        {
            ResponseBody::Session(summary) => Ok(summary),
            other => Err(unexpected(other)),
        }
    }

    /// Attach this connection to a session. Replaces any attachment this
    /// connection already holds.
    pub async fn attach(&self, session_id: &str) -> TerminResult<Attachment> {
        let delivered = self
            .request(RequestBody::Attach {
                session_id: session_id.to_string(),
            })
            .await?;
        match (delivered.reply, delivered.events) {
            (
                Reply::Ok(ResponseBody::Attached {
                    attachment_id,
                    session_id,
                }),
                Some(events),
            ) => Ok(Attachment {
                id: attachment_id,
                session_id,
                events,
            }),
            (Reply::Ok(other), _) => Err(unexpected(other)),
            (Reply::Err(e), _) => Err(e.into()),
        }
    }

    pub async fn detach(&self, attachment_id: AttachmentId) -> TerminResult<()> {
        self.ack(RequestBody::Detach { attachment_id }).await
    }

    pub async fn send_input(&self, session_id: &str, data: &[u8]) -> TerminResult<()> {
        self.ack(RequestBody::SendInput {
            session_id: session_id.to_string(),
            data: data.to_vec(),
        })
        .await
    }

    pub async fn resize(&self, session_id: &str, size: TermSize) -> TerminResult<()> {
        self.ack(RequestBody::Resize {
            session_id: session_id.to_string(),
            size,
        })
        .await
    }

    pub async fn terminate(&self, session_id: &str) -> TerminResult<SessionSummary> {
        match self
            .call(RequestBody::Terminate {
                session_id: session_id.to_string(),
            })
            .await?
        {
            ResponseBody::Session(summary) => Ok(summary),
            other => Err(unexpected(other)),
        }
    }

    pub async fn reap(&self, session_id: &str) -> TerminResult<()> {
        self.ack(RequestBody::Reap {
            session_id: session_id.to_string(),
        })
        .await
    }

    async fn ack(&self, body: RequestBody) -> TerminResult<()> {
        match self.call(body).await? {
            ResponseBody::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

fn unexpected(body: ResponseBody) -> TerminError {
    TerminError::Protocol(format!("unexpected response: {body:?}"))
}
