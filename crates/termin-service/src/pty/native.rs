//! Native adapter backed by `portable-pty`: a POSIX pseudo-terminal on
//! Unix, ConPTY on Windows. Platform differences live in `platform`.

use super::{OpenedPty, PtyBackend, PtyProcess, PtyRead, PtyReader};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use termin_core::messages::CreateSession;
use termin_core::{TermSize, TerminError, TerminResult};
use tracing::{debug, info};

const READ_CHUNK: usize = 8192;

/// Default `TERM` for spawned processes unless the caller sets one.
const DEFAULT_TERM: &str = "xterm-256color";

#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

impl NativePtyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PtyBackend for NativePtyBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn open(&self, launch: &CreateSession) -> TerminResult<OpenedPty> {
        if let Some(cwd) = &launch.cwd {
            if !cwd.is_dir() {
                return Err(TerminError::Spawn(format!(
                    "working directory does not exist: {}",
                    cwd.display()
                )));
            }
        }
        let program = resolve_program(launch)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(launch.size))
            .map_err(|e| TerminError::Spawn(format!("failed to open PTY: {e}")))?;
        let PtyPair { master, slave } = pair;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&launch.args);
        if let Some(cwd) = &launch.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", DEFAULT_TERM);
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }

        let child = slave
            .spawn_command(cmd)
            .map_err(|e| TerminError::Spawn(format!("failed to spawn {}: {e}", launch.command)))?;
        // The child holds its own copy; ours would keep the stream open past exit.
        drop(slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = master
            .try_clone_reader()
            .map_err(|e| TerminError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = master
            .take_writer()
            .map_err(|e| TerminError::Spawn(format!("failed to take PTY writer: {e}")))?;

        info!(
            program = %program.display(),
            pid = ?pid,
            size = %launch.size,
            "PTY spawned"
        );

        let process = NativeProcess {
            master: Mutex::new(master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            killer: Mutex::new(killer),
            exited: AtomicBool::new(false),
            pid,
        };
        Ok(OpenedPty {
            process: Arc::new(process),
            reader: Box::new(NativeReader {
                inner: reader,
                buf: vec![0u8; READ_CHUNK],
            }),
        })
    }
}

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Locate the executable before spawning so a missing program is reported
/// synchronously as a spawn error.
fn resolve_program(launch: &CreateSession) -> TerminResult<PathBuf> {
    let command = launch.command.as_str();
    let has_separator = command.contains('/') || command.contains(std::path::MAIN_SEPARATOR);

    if has_separator {
        let path = Path::new(command);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let base = match &launch.cwd {
                Some(cwd) => cwd.clone(),
                None => std::env::current_dir()?,
            };
            base.join(path)
        };
        return platform::candidates(path)
            .into_iter()
            .find(|p| platform::is_executable(p))
            .ok_or_else(|| TerminError::Spawn(format!("executable not found: {command}")));
    }

    let search_path = match launch.env.get("PATH") {
        Some(path) => Some(path.into()),
        None => std::env::var_os("PATH"),
    };
    let Some(search_path) = search_path else {
        return Err(TerminError::Spawn(format!(
            "executable not found: {command} (PATH is unset)"
        )));
    };

    std::env::split_paths(&search_path)
        .flat_map(|dir| platform::candidates(dir.join(command)))
        .find(|p| platform::is_executable(p))
        .ok_or_else(|| TerminError::Spawn(format!("executable not found: {command}")))
}

struct NativeProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: AtomicBool,
    pid: Option<u32>,
}

impl PtyProcess for NativeProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, data: &[u8]) -> TerminResult<usize> {
        if self.exited.load(Ordering::Acquire) {
            return Err(TerminError::io("process has exited"));
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TerminError::io("PTY writer lock poisoned"))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(data.len())
    }

    fn resize(&self, size: TermSize) -> TerminResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| TerminError::io("PTY master lock poisoned"))?;
        master
            .resize(pty_size(size))
            .map_err(|e| TerminError::io(format!("PTY resize failed: {e}")))?;
        debug!(%size, "PTY resized");
        Ok(())
    }

    fn terminate(&self) -> TerminResult<()> {
        if self.exited.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| TerminError::io("PTY killer lock poisoned"))?;
        match killer.kill() {
            Ok(()) => Ok(()),
            Err(e) if platform::is_already_gone(&e) || self.exited.load(Ordering::Acquire) => {
                debug!(pid = ?self.pid, "terminate raced with exit");
                Ok(())
            }
            Err(e) => Err(TerminError::Io(e)),
        }
    }

    fn wait(&self) -> TerminResult<i32> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| TerminError::io("PTY child lock poisoned"))?;
        let status = child.wait()?;
        self.exited.store(true, Ordering::Release);
        Ok(status.exit_code() as i32)
    }
}

struct NativeReader {
    inner: Box<dyn Read + Send>,
    buf: Vec<u8>,
}

impl PtyReader for NativeReader {
    fn read(&mut self) -> TerminResult<PtyRead> {
        loop {
            match self.inner.read(&mut self.buf) {
                Ok(0) => return Ok(PtyRead::Eof),
                Ok(n) => return Ok(PtyRead::Data(self.buf[..n].to_vec())),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if platform::is_end_of_stream(&e) => return Ok(PtyRead::Eof),
                Err(e) => return Err(TerminError::Io(e)),
            }
        }
    }
}

#[cfg(unix)]
mod platform {
    use std::io;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Linux reports EIO on the master once the slave side has closed.
    pub(super) fn is_end_of_stream(e: &io::Error) -> bool {
        e.raw_os_error() == Some(libc::EIO)
    }

    pub(super) fn is_already_gone(e: &io::Error) -> bool {
        e.raw_os_error() == Some(libc::ESRCH)
    }

    pub(super) fn is_executable(path: &Path) -> bool {
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    pub(super) fn candidates(path: PathBuf) -> Vec<PathBuf> {
        vec![path]
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::OsString;
    use std::io;
    use std::path::{Path, PathBuf};

    const DEFAULT_PATHEXT: &str = ".COM;.EXE;.BAT;.CMD";

    /// ConPTY closes its output pipe when the console goes away.
    pub(super) fn is_end_of_stream(e: &io::Error) -> bool {
        e.kind() == io::ErrorKind::BrokenPipe
    }

    pub(super) fn is_already_gone(_e: &io::Error) -> bool {
        false
    }

    pub(super) fn is_executable(path: &Path) -> bool {
        path.is_file()
    }

    pub(super) fn candidates(path: PathBuf) -> Vec<PathBuf> {
        if path.extension().is_some() {
            return vec![path];
        }
        let pathext = std::env::var("PATHEXT").unwrap_or_else(|_| DEFAULT_PATHEXT.to_string());
        let mut out = vec![path.clone()];
        for ext in pathext.split(';').filter(|e| !e.is_empty()) {
            let mut name = OsString::from(path.as_os_str());
            name.push(ext);
            out.push(PathBuf::from(name));
        }
        out
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn read_until(reader: &mut Box<dyn PtyReader>, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match reader.read().unwrap() {
                PtyRead::Data(bytes) => seen.push_str(&String::from_utf8_lossy(&bytes)),
                PtyRead::Eof => break,
            }
        }
        seen
    }

    #[test]
    fn missing_executable_is_a_spawn_error() {
        let err = NativePtyBackend::new()
            .open(&CreateSession::new("definitely-not-a-real-program-42"))
            .err()
            .unwrap();
        assert!(matches!(err, TerminError::Spawn(_)), "{err}");

        let err = NativePtyBackend::new()
            .open(&CreateSession::new("/no/such/dir/prog"))
            .err()
            .unwrap();
        assert!(matches!(err, TerminError::Spawn(_)), "{err}");
    }

    #[test]
    fn exit_code_and_end_of_stream() {
        let opened = NativePtyBackend::new()
            .open(&CreateSession::new("/bin/sh").arg("-c").arg("printf hello; exit 3"))
            .unwrap();
        let mut reader = opened.reader;
        let out = read_until(&mut reader, "hello");
        assert!(out.contains("hello"), "{out:?}");
        assert_eq!(opened.process.wait().unwrap(), 3);

        // Drain to end-of-stream; EIO must not surface as an error.
        loop {
            if reader.read().unwrap() == PtyRead::Eof {
                break;
            }
        }
        assert!(opened.process.write(b"late").is_err());
        opened.process.terminate().unwrap();
    }

    #[test]
    fn echo_through_cat() {
        let opened = NativePtyBackend::new().open(&CreateSession::new("cat")).unwrap();
        let mut reader = opened.reader;
        assert_eq!(opened.process.write(b"abc\n").unwrap(), 4);
        let out = read_until(&mut reader, "abc");
        assert!(out.contains("abc"));

        opened.process.resize(TermSize::new(40, 100)).unwrap();
        opened.process.terminate().unwrap();
        opened.process.wait().unwrap();
        opened.process.terminate().unwrap();
    }

    #[test]
    fn caller_env_overrides_term() {
        let opened = NativePtyBackend::new()
            .open(
                &CreateSession::new("/bin/sh")
                    .arg("-c")
                    .arg("printf \"[$TERM]\"")
                    .env("TERM", "dumb"),
            )
            .unwrap();
        let mut reader = opened.reader;
        let out = read_until(&mut reader, "]");
        assert!(out.contains("[dumb]"), "{out:?}");
        opened.process.wait().unwrap();
    }
}
