//! Deterministic adapter for unit tests.
//!
//! Each program name maps to a [`Script`]. Tests can also push output or
//! end the process through the [`ScriptedHandle`] of any opened process.

use super::{OpenedPty, PtyBackend, PtyProcess, PtyRead, PtyReader};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use termin_core::messages::CreateSession;
use termin_core::{TermSize, TerminError, TerminResult};

/// Exit code reported after `terminate`.
pub(crate) const TERMINATED_CODE: i32 = 143;

#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Echo every write back as output until terminated.
    Echo,
    /// Emit the chunks, then exit with `code` and close the stream.
    Emit { chunks: Vec<Vec<u8>>, code: i32 },
    /// Emit the chunks, then fail the next read with an I/O error.
    FailAfter { chunks: Vec<Vec<u8>>, reason: String },
    /// Emit the chunks and exit, but keep the stream open (a grandchild
    /// still holds the terminal).
    Linger { chunks: Vec<Vec<u8>>, code: i32 },
    /// No output until terminated.
    Silent,
    /// Block the spawn until the gate is released, then fail it.
    SpawnFails { gate: Arc<SpawnGate>, reason: String },
}

/// Holds a scripted spawn until the test releases it.
#[derive(Debug, Default)]
pub(crate) struct SpawnGate {
    released: Mutex<bool>,
    cond: Condvar,
}

impl SpawnGate {
    pub(crate) fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.cond.wait(released).unwrap();
        }
    }
}

#[derive(Default)]
struct ProcState {
    output: VecDeque<Result<Vec<u8>, String>>,
    stream_closed: bool,
    exit: Option<i32>,
    echo: bool,
    input: Vec<u8>,
    size: TermSize,
    terminate_calls: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ProcState>,
    cond: Condvar,
}

impl Shared {
    fn with<R>(&self, f: impl FnOnce(&mut ProcState) -> R) -> R {
        let mut st = self.state.lock().unwrap();
        let r = f(&mut st);
        self.cond.notify_all();
        r
    }
}

/// Test-side view of an opened scripted process.
#[derive(Clone)]
pub(crate) struct ScriptedHandle {
    shared: Arc<Shared>,
}

impl ScriptedHandle {
    pub(crate) fn push_output(&self, bytes: &[u8]) {
        self.shared
            .with(|st| st.output.push_back(Ok(bytes.to_vec())));
    }

    /// Exit with `code` and close the stream.
    pub(crate) fn exit(&self, code: i32) {
        self.shared.with(|st| {
            st.exit.get_or_insert(code);
            st.stream_closed = true;
        });
    }

    pub(crate) fn input(&self) -> Vec<u8> {
        self.shared.with(|st| st.input.clone())
    }

    pub(crate) fn size(&self) -> TermSize {
        self.shared.with(|st| st.size)
    }

    pub(crate) fn terminate_calls(&self) -> usize {
        self.shared.with(|st| st.terminate_calls)
    }
}

#[derive(Default)]
pub(crate) struct ScriptedBackend {
    scripts: Mutex<HashMap<String, Script>>,
    opened: Mutex<Vec<ScriptedHandle>>,
    gates: Mutex<Vec<Arc<SpawnGate>>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register the default programs used across the test suites.
    pub(crate) fn standard() -> Self {
        Self::new()
            .with("echo", Script::Echo)
            .with("silent", Script::Silent)
            .with(
                "hello",
                Script::Emit {
                    chunks: vec![b"hello\r\n".to_vec()],
                    code: 0,
                },
            )
    }

    pub(crate) fn with(self, program: &str, script: Script) -> Self {
        if let Script::SpawnFails { gate, .. } = &script {
            self.gates.lock().unwrap().push(gate.clone());
        }
        self.scripts.lock().unwrap().insert(program.to_string(), script);
        self
    }

    /// Handle of the `n`th process opened by this backend.
    pub(crate) fn handle(&self, n: usize) -> ScriptedHandle {
        self.opened.lock().unwrap()[n].clone()
    }

    pub(crate) fn last_handle(&self) -> ScriptedHandle {
        self.opened.lock().unwrap().last().cloned().unwrap()
    }
}

/// Ends every process still running and releases held spawns so blocking
/// threads return before the test runtime shuts down.
impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        if let Ok(opened) = self.opened.get_mut() {
            for handle in opened.iter() {
                handle.exit(TERMINATED_CODE);
            }
        }
        if let Ok(gates) = self.gates.get_mut() {
            for gate in gates.iter() {
                gate.release();
            }
        }
    }
}

impl PtyBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open(&self, launch: &CreateSession) -> TerminResult<OpenedPty> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&launch.command)
            .cloned()
            .ok_or_else(|| TerminError::Spawn(format!("executable not found: {}", launch.command)))?;

        if let Script::SpawnFails { gate, reason } = &script {
            gate.wait();
            return Err(TerminError::Spawn(reason.clone()));
        }

        let mut st = ProcState {
            size: launch.size,
            ..Default::default()
        };
        match script {
            Script::Echo => st.echo = true,
            Script::Silent => {}
            Script::Emit { chunks, code } => {
                st.output.extend(chunks.into_iter().map(Ok));
                st.exit = Some(code);
                st.stream_closed = true;
            }
            Script::FailAfter { chunks, reason } => {
                st.output.extend(chunks.into_iter().map(Ok));
                st.output.push_back(Err(reason));
            }
            Script::Linger { chunks, code } => {
                st.output.extend(chunks.into_iter().map(Ok));
                st.exit = Some(code);
            }
            Script::SpawnFails { .. } => unreachable!("handled above"),
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(st),
            cond: Condvar::new(),
        });
        self.opened.lock().unwrap().push(ScriptedHandle {
            shared: shared.clone(),
        });
        Ok(OpenedPty {
            process: Arc::new(ScriptedProcess {
                shared: shared.clone(),
            }),
            reader: Box::new(ScriptedReader { shared }),
        })
    }
}

struct ScriptedProcess {
    shared: Arc<Shared>,
}

impl PtyProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn write(&self, data: &[u8]) -> TerminResult<usize> {
        self.shared.with(|st| {
            if st.exit.is_some() {
                return Err(TerminError::io("process has exited"));
            }
            st.input.extend_from_slice(data);
            if st.echo {
                st.output.push_back(Ok(data.to_vec()));
            }
            Ok(data.len())
        })
    }

    fn resize(&self, size: TermSize) -> TerminResult<()> {
        self.shared.with(|st| {
            if st.exit.is_some() {
                return Err(TerminError::io("process has exited"));
            }
            st.size = size;
            Ok(())
        })
    }

    fn terminate(&self) -> TerminResult<()> {
        self.shared.with(|st| {
            st.terminate_calls += 1;
            if st.exit.is_none() {
                st.exit = Some(TERMINATED_CODE);
                st.stream_closed = true;
            }
        });
        Ok(())
    }

    fn wait(&self) -> TerminResult<i32> {
        let mut st = self.shared.state.lock().unwrap();
        loop {
            if let Some(code) = st.exit {
                return Ok(code);
            }
            st = self.shared.cond.wait(st).unwrap();
        }
    }
}

struct ScriptedReader {
    shared: Arc<Shared>,
}

impl PtyReader for ScriptedReader {
    fn read(&mut self) -> TerminResult<PtyRead> {
        let mut st = self.shared.state.lock().unwrap();
        loop {
            if let Some(item) = st.output.pop_front() {
                return item.map(PtyRead::Data).map_err(TerminError::io);
            }
            if st.stream_closed {
                return Ok(PtyRead::Eof);
            }
            st = self.shared.cond.wait(st).unwrap();
        }
    }
}
