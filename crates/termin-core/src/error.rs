use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the session broker and the wire protocol.
#[derive(Debug, Error)]
pub enum TerminError {
    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Stable classification of a [`TerminError`], carried on the wire so
/// remote callers see the same taxonomy as in-process callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Spawn,
    Io,
    NotFound,
    InvalidState,
    InvalidArgument,
    Timeout,
    Codec,
    Transport,
    Protocol,
}

impl TerminError {
    /// Shorthand for an I/O error that did not originate from `std::io`.
    pub fn io(msg: impl Into<String>) -> Self {
        TerminError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TerminError::Spawn(_) => ErrorKind::Spawn,
            TerminError::Io(_) => ErrorKind::Io,
            TerminError::NotFound(_) => ErrorKind::NotFound,
            TerminError::InvalidState(_) => ErrorKind::InvalidState,
            TerminError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            TerminError::Timeout(_) => ErrorKind::Timeout,
            TerminError::Codec(_) => ErrorKind::Codec,
            TerminError::Transport(_) => ErrorKind::Transport,
            TerminError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// The message without the kind prefix added by `Display`.
    pub fn detail(&self) -> String {
        match self {
            TerminError::Io(e) => e.to_string(),
            TerminError::Spawn(m)
            | TerminError::NotFound(m)
            | TerminError::InvalidState(m)
            | TerminError::InvalidArgument(m)
            | TerminError::Timeout(m)
            | TerminError::Codec(m)
            | TerminError::Transport(m)
            | TerminError::Protocol(m) => m.clone(),
        }
    }

    /// Rebuild an error received from a remote broker.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Spawn => TerminError::Spawn(message),
            ErrorKind::Io => TerminError::io(message),
            ErrorKind::NotFound => TerminError::NotFound(message),
            ErrorKind::InvalidState => TerminError::InvalidState(message),
            ErrorKind::InvalidArgument => TerminError::InvalidArgument(message),
            ErrorKind::Timeout => TerminError::Timeout(message),
            ErrorKind::Codec => TerminError::Codec(message),
            ErrorKind::Transport => TerminError::Transport(message),
            ErrorKind::Protocol => TerminError::Protocol(message),
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for TerminError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TerminError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TerminError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TerminError::Codec(e.to_string())
    }
}

pub type TerminResult<T> = Result<T, TerminError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_keeps_kind_and_detail() {
        let err = TerminError::InvalidState("session is still running".into());
        let rebuilt = TerminError::from_wire(err.kind(), err.detail());
        assert_eq!(rebuilt.kind(), ErrorKind::InvalidState);
        assert_eq!(rebuilt.to_string(), "invalid state: session is still running");
    }

    #[test]
    fn io_errors_keep_their_message() {
        let err = TerminError::io("handle closed");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.detail(), "handle closed");
    }
}
