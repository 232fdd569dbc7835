//! Broker wire protocol messages.
//!
//! A connection carries [`ClientMessage`] frames from the front-end and
//! [`ServerMessage`] frames from the service. Requests are correlated with
//! responses by `id`; attachment output arrives as unsolicited events.

use crate::error::{ErrorKind, TerminError};
use crate::session::{AttachEvent, AttachmentId, SessionId, SessionSummary, TermSize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Protocol version announced in [`ServerMessage::Hello`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Parameters for creating a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateSession {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub size: TermSize,
}

impl CreateSession {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn size(mut self, size: TermSize) -> Self {
        self.size = size;
        self
    }
}

/// A request from a front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub id: u64,
    pub body: RequestBody,
}

/// Broker operations available over the wire.
///
/// Session ids travel as plain strings and are validated by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RequestBody {
    CreateSession(CreateSession),
    ListSessions,
    SessionState { session_id: String },
    Attach { session_id: String },
    Detach { attachment_id: AttachmentId },
    SendInput {
        session_id: String,
        #[serde(with = "crate::session::serde_bytes_compat")]
        data: Vec<u8>,
    },
    Resize { session_id: String, size: TermSize },
    Terminate { session_id: String },
    Reap { session_id: String },
}

impl RequestBody {
    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::CreateSession(_) => "create_session",
            RequestBody::ListSessions => "list_sessions",
            RequestBody::SessionState { .. } => "session_state",
            RequestBody::Attach { .. } => "attach",
            RequestBody::Detach { .. } => "detach",
            RequestBody::SendInput { .. } => "send_input",
            RequestBody::Resize { .. } => "resize",
            RequestBody::Terminate { .. } => "terminate",
            RequestBody::Reap { .. } => "reap",
        }
    }
}

/// Successful results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ResponseBody {
    Session(SessionSummary),
    Sessions { sessions: Vec<SessionSummary> },
    Attached {
        attachment_id: AttachmentId,
        session_id: SessionId,
    },
    Ack,
}

/// Error as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TerminError> for WireError {
    fn from(e: &TerminError) -> Self {
        Self {
            kind: e.kind(),
            message: e.detail(),
        }
    }
}

impl From<WireError> for TerminError {
    fn from(e: WireError) -> Self {
        TerminError::from_wire(e.kind, e.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(ResponseBody),
    Err(WireError),
}

impl From<Result<ResponseBody, TerminError>> for Reply {
    fn from(r: Result<ResponseBody, TerminError>) -> Self {
        match r {
            Ok(body) => Reply::Ok(body),
            Err(e) => Reply::Err(WireError::from(&e)),
        }
    }
}

/// A frame sent by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection.
    Hello {
        version: u32,
        server: String,
        client_id: String,
    },
    Response { id: u64, reply: Reply },
    Event {
        attachment_id: AttachmentId,
        event: AttachEvent,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{cbor_decode, frame_encode};

    #[test]
    fn error_reply_keeps_taxonomy() {
        let err = TerminError::NotFound("session abc".into());
        let reply = Reply::from(Err::<ResponseBody, _>(err));
        let frame = frame_encode(&ServerMessage::Response { id: 3, reply }).unwrap();

        let decoded: ServerMessage = cbor_decode(&frame[4..]).unwrap();
        let ServerMessage::Response { id, reply: Reply::Err(wire) } = decoded else {
            panic!("expected an error response, got {decoded:?}");
        };
        assert_eq!(id, 3);
        let err = TerminError::from(wire);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.detail(), "session abc");
    }

    #[test]
    fn create_request_builder() {
        let req = CreateSession::new("/bin/sh")
            .arg("-c")
            .arg("echo hi")
            .env("LANG", "C")
            .size(TermSize::new(40, 120));
        assert_eq!(req.args, vec!["-c", "echo hi"]);
        assert_eq!(req.env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(req.size, TermSize::new(40, 120));

        let body = RequestBody::CreateSession(req.clone());
        assert_eq!(body.name(), "create_session");
        let frame = frame_encode(&ClientMessage { id: 1, body }).unwrap();
        let back: ClientMessage = cbor_decode(&frame[4..]).unwrap();
        assert_eq!(back.body, RequestBody::CreateSession(req));
    }
}
