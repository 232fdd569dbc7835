//! Platform PTY adapter.
//!
//! A [`PtyBackend`] opens a process on a pseudo-terminal and hands back two
//! halves: a shared [`PtyProcess`] for input, resize, termination and exit
//! status, and a [`PtyReader`] owned by the relay's read loop. All calls are
//! blocking and run on the blocking pool.

pub mod native;
#[cfg(test)]
pub(crate) mod scripted;

use std::sync::Arc;
use termin_core::messages::CreateSession;
use termin_core::{TermSize, TerminResult};

pub use native::NativePtyBackend;

/// Result of one blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum PtyRead {
    Data(Vec<u8>),
    /// The terminal stream closed. Distinct from an I/O error.
    Eof,
}

/// Output side of an open terminal, taken once by the relay.
pub trait PtyReader: Send {
    fn read(&mut self) -> TerminResult<PtyRead>;
}

/// Control side of an open terminal.
pub trait PtyProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Write input bytes. Fails once the process has exited.
    fn write(&self, data: &[u8]) -> TerminResult<usize>;

    fn resize(&self, size: TermSize) -> TerminResult<()>;

    /// Request termination. Idempotent; a no-op once the process exited.
    fn terminate(&self) -> TerminResult<()>;

    /// Block until the process exits and return its exit code.
    fn wait(&self) -> TerminResult<i32>;
}

pub struct OpenedPty {
    pub process: Arc<dyn PtyProcess>,
    pub reader: Box<dyn PtyReader>,
}

/// Spawns processes on pseudo-terminals. The only place processes start.
pub trait PtyBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spawn `launch.command` with its arguments, working directory,
    /// environment and initial size. `TerminError::Spawn` when the
    /// executable cannot be resolved or process creation fails.
    fn open(&self, launch: &CreateSession) -> TerminResult<OpenedPty>;
}
