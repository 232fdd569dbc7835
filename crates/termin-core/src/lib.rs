//! termin-core: shared protocol library for terminservice.
//!
//! Provides the session model (identifiers, lifecycle states, attachment
//! events), the error taxonomy, CBOR wire messages and length-prefixed framing.

pub mod codec;
pub mod error;
pub mod messages;
pub mod session;

pub use codec::{cbor_decode, frame_encode, read_frame, write_frame};
pub use error::{ErrorKind, TerminError, TerminResult};
pub use messages::{CreateSession, PROTOCOL_VERSION};
pub use session::{
    AttachEvent, AttachmentId, DetachReason, SessionEnd, SessionId, SessionState, SessionSummary,
    TermSize,
};
