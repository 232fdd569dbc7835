//! TCP transport: exposes the broker over the framed CBOR protocol.
//!
//! One task per connection reads requests and dispatches them in order; a
//! writer task owns the socket's write half; each attachment gets a drain
//! task forwarding its events. Closing the connection drops its attachments.

use crate::broker::Broker;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use termin_core::messages::{
    ClientMessage, Reply, RequestBody, ResponseBody, ServerMessage, PROTOCOL_VERSION,
};
use termin_core::{read_frame, write_frame, AttachEvent, AttachmentId, TerminError, TerminResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Frames queued towards one connection.
const OUTBOUND_QUEUE: usize = 256;

/// Largest output payload carried by one event frame. Keeps a replay of a
/// large scrollback well under the frame limit.
const EVENT_CHUNK: usize = 256 * 1024;

pub struct Server {
    broker: Arc<Broker>,
    next_conn: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            next_conn: AtomicU64::new(1),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub async fn bind(addr: SocketAddr) -> TerminResult<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| TerminError::Transport(format!("bind {addr} failed: {e}")))
    }

    /// Accept connections until [`Server::shutdown`] is called.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> TerminResult<()> {
        let local = listener
            .local_addr()
            .map_err(|e| TerminError::Transport(format!("listener address: {e}")))?;
        info!(addr = %local, "listening");

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move { server.handle_connection(stream, peer).await });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = shutdown.recv() => {
                    info!("listener stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let client_id = format!("conn-{}", self.next_conn.fetch_add(1, Ordering::Relaxed));
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        info!(client_id, peer = %peer, "client connected");

        let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
        let writer_client = client_id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match write_frame(&mut writer, &msg).await {
                    Ok(()) => {}
                    // Nothing was written, the stream is still in sync.
                    Err(e @ TerminError::Codec(_)) => {
                        warn!(client_id = %writer_client, error = %e, "dropping unencodable frame");
                    }
                    Err(e) => {
                        debug!(client_id = %writer_client, error = %e, "write failed");
                        break;
                    }
                }
            }
        });

        let hello = ServerMessage::Hello {
            version: PROTOCOL_VERSION,
            server: format!("terminservice/{}", env!("CARGO_PKG_VERSION")),
            client_id: client_id.clone(),
        };
        if out_tx.send(hello).await.is_err() {
            return;
        }

        let mut drains: HashMap<AttachmentId, JoinHandle<()>> = HashMap::new();
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                frame = read_frame::<_, ClientMessage>(&mut reader) => match frame {
                    Ok(Some(msg)) => {
                        self.dispatch(msg, &client_id, &out_tx, &mut drains).await;
                        drains.retain(|_, task| !task.is_finished());
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(client_id, error = %e, "unreadable frame, closing connection");
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        // Aborting a drain drops its stream, which detaches it.
        for (_, task) in drains {
            task.abort();
        }
        drop(out_tx);
        let _ = writer_task.await;
        info!(client_id, "client disconnected");
    }

    async fn dispatch(
        &self,
        msg: ClientMessage,
        client_id: &str,
        out_tx: &mpsc::Sender<ServerMessage>,
        drains: &mut HashMap<AttachmentId, JoinHandle<()>>,
    ) {
        let ClientMessage { id, body } = msg;
        debug!(client_id, request_id = id, op = body.name(), "request");
        let broker = &self.broker;

        let reply: Reply = match body {
            RequestBody::CreateSession(req) => broker
                .create_session(req)
                .await
                .map(ResponseBody::Session)
                .into(),
            RequestBody::ListSessions => Reply::Ok(ResponseBody::Sessions {
                sessions: broker.list_sessions().await,
            }),
            RequestBody::SessionState { session_id } => broker
                .session_state(&session_id)
                .await
                .map(ResponseBody::Session)
                .into(),
            RequestBody::Attach { session_id } => match broker.attach(&session_id, client_id).await {
                Ok(mut stream) => {
                    let attachment_id = stream.id();
                    let response = ServerMessage::Response {
                        id,
                        reply: Reply::Ok(ResponseBody::Attached {
                            attachment_id,
                            session_id: stream.session_id().clone(),
                        }),
                    };
                    // The response must precede the replay on the wire.
                    if out_tx.send(response).await.is_err() {
                        return;
                    }
                    let tx = out_tx.clone();
                    let task = tokio::spawn(async move {
                        'drain: while let Some(event) = stream.recv().await {
                            for event in split_for_wire(event) {
                                if tx.send(ServerMessage::Event { attachment_id, event }).await.is_err() {
                                    break 'drain;
                                }
                            }
                        }
                    });
                    drains.insert(attachment_id, task);
                    return;
                }
                Err(e) => Reply::from(Err::<ResponseBody, _>(e)),
            },
            RequestBody::Detach { attachment_id } => {
                broker.detach(attachment_id);
                Reply::Ok(ResponseBody::Ack)
            }
            RequestBody::SendInput { session_id, data } => broker
                .send_input(&session_id, data)
                .await
                .map(|_| ResponseBody::Ack)
                .into(),
            RequestBody::Resize { session_id, size } => broker
                .resize(&session_id, size)
                .await
                .map(|()| ResponseBody::Ack)
                .into(),
            RequestBody::Terminate { session_id } => broker
                .terminate(&session_id)
                .await
                .map(ResponseBody::Session)
                .into(),
            RequestBody::Reap { session_id } => broker
                .reap(&session_id)
                .await
                .map(|()| ResponseBody::Ack)
                .into(),
        };

        if let Reply::Err(e) = &reply {
            debug!(client_id, request_id = id, kind = ?e.kind, message = %e.message, "request failed");
        }
        let _ = out_tx.send(ServerMessage::Response { id, reply }).await;
    }
}

/// Split oversized output into several events of the same kind.
fn split_for_wire(event: AttachEvent) -> Vec<AttachEvent> {
    match event {
        AttachEvent::Replay(bytes) if bytes.len() > EVENT_CHUNK => bytes
            .chunks(EVENT_CHUNK)
            .map(|c| AttachEvent::Replay(c.to_vec()))
            .collect(),
        AttachEvent::Output(bytes) if bytes.len() > EVENT_CHUNK => bytes
            .chunks(EVENT_CHUNK)
            .map(|c| AttachEvent::Output(c.to_vec()))
            .collect(),
        other => vec![other],
    }
}

/// Periodically remove sessions that ended more than `grace` ago.
pub fn spawn_collector(broker: Arc<Broker>, interval: Duration, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = broker.collect_expired(grace).await;
            for id in &removed {
                info!(session_id = %id, "expired session collected");
            }
        }
    })
}
