//! Session model shared by the broker, the wire protocol and front-ends.

use crate::error::{TerminError, TerminResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a session identifier in hex characters.
pub const SESSION_ID_LEN: usize = 32;

/// Opaque session identifier: 32 lowercase hex characters.
///
/// The first half encodes a monotonically increasing sequence number, the
/// second half is random. Identifiers minted by one process never repeat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Mint a new identifier from a sequence number and fresh randomness.
    pub fn generate(seq: u64) -> Self {
        use rand::Rng;
        let random: u64 = rand::thread_rng().gen();
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&seq.to_be_bytes());
        bytes[8..].copy_from_slice(&random.to_be_bytes());
        Self(hex::encode(bytes))
    }

    /// Parse and validate an identifier supplied by a caller.
    pub fn parse(s: &str) -> TerminResult<Self> {
        if s.len() != SESSION_ID_LEN {
            return Err(TerminError::InvalidArgument(format!(
                "session id must be {SESSION_ID_LEN} hex characters, got {}",
                s.len()
            )));
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(TerminError::InvalidArgument(format!(
                "session id must be lowercase hex: {s}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines and tables.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = TerminError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = TerminError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> String {
        id.0
    }
}

/// Identifier of one attachment (client subscription to a session).
pub type AttachmentId = u64;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl TermSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl fmt::Display for TermSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Lifecycle state of a session.
///
/// Legal transitions: `Starting → {Running, Failed}`,
/// `Running → {Exited, Failed}`, `{Exited, Failed} → Terminated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Exited { code: i32 },
    Failed { reason: String },
    Terminated,
}

impl SessionState {
    /// Whether the session has ended (its process is gone).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Exited { .. } | SessionState::Failed { .. } | SessionState::Terminated
        )
    }

    /// Whether the session still owns a process handle.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Running)
    }

    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Failed { .. })
                | (Running, Exited { .. })
                | (Running, Failed { .. })
                | (Exited { .. }, Terminated)
                | (Failed { .. }, Terminated)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Exited { .. } => "exited",
            SessionState::Failed { .. } => "failed",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Exited { code } => write!(f, "exited({code})"),
            SessionState::Failed { reason } => write!(f, "failed({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// How a session ended, delivered to attached clients as the end marker.
///
/// Front-ends treat both variants as "session ended".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "end", rename_all = "snake_case")]
pub enum SessionEnd {
    Exited { code: i32 },
    Failed { reason: String },
}

impl SessionEnd {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SessionEnd::Exited { code } => Some(*code),
            SessionEnd::Failed { .. } => None,
        }
    }
}

impl From<&SessionEnd> for SessionState {
    fn from(end: &SessionEnd) -> Self {
        match end {
            SessionEnd::Exited { code } => SessionState::Exited { code: *code },
            SessionEnd::Failed { reason } => SessionState::Failed {
                reason: reason.clone(),
            },
        }
    }
}

/// Why an attachment stream closed without an end-of-session marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// The client (or a controller) detached explicitly.
    Detached,
    /// The same client attached to another session.
    Superseded,
    /// The client's queue overflowed and it was dropped by the relay.
    SlowConsumer,
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetachReason::Detached => "detached",
            DetachReason::Superseded => "superseded",
            DetachReason::SlowConsumer => "slow consumer",
        })
    }
}

/// One item on an attachment stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum AttachEvent {
    /// Retained output, delivered before any live output. A large replay
    /// may be split over several consecutive events.
    Replay(#[serde(with = "serde_bytes_compat")] Vec<u8>),
    /// Live output.
    Output(#[serde(with = "serde_bytes_compat")] Vec<u8>),
    /// The session ended. Nothing follows.
    End(SessionEnd),
    /// The attachment closed while the session lives on. Nothing follows.
    Closed(DetachReason),
}

impl AttachEvent {
    /// Output bytes carried by this event, if any.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            AttachEvent::Replay(b) | AttachEvent::Output(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, AttachEvent::End(_) | AttachEvent::Closed(_))
    }
}

/// Snapshot of one session as returned by list/state calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub command: String,
    pub args: Vec<String>,
    pub state: SessionState,
    /// Exit code, kept after the session moves to `Terminated`.
    pub exit_code: Option<i32>,
    /// Failure reason, kept after the session moves to `Terminated`.
    pub failure: Option<String>,
    pub size: TermSize,
    /// Creation time, seconds since the unix epoch.
    pub created_at: u64,
    pub attached: usize,
    pub buffered_bytes: usize,
}

/// CBOR encodes `Vec<u8>` as an array of integers by default; this keeps
/// terminal output as a compact byte string on the wire.
pub(crate) mod serde_bytes_compat {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        d.deserialize_byte_buf(BytesVisitor)
    }
}
