//! Session recording.
//!
//! Appends timestamped events (output, input, resize, exit) to a
//! newline-delimited JSON file per session. Recording is best-effort: events
//! are queued without blocking the relay and dropped when the writer falls
//! behind.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use termin_core::{SessionId, TermSize, TerminResult};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Events queued per recorder before new ones are dropped.
const RECORDING_QUEUE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RecordingEvent {
    Start { command: String, args: Vec<String> },
    Output(Vec<u8>),
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Exit { code: i32 },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingEntry {
    /// Milliseconds since recording start.
    pub timestamp_ms: u64,
    pub event: RecordingEvent,
}

pub struct SessionRecorder {
    path: PathBuf,
    start_time: Instant,
    tx: mpsc::Sender<RecordingEntry>,
    dropped: AtomicU64,
}

impl SessionRecorder {
    /// Start recording `session_id` into `<dir>/<session_id>.jsonl`.
    ///
    /// Must be called from within a tokio runtime; the file writer runs as
    /// its own task and ends when the recorder is dropped.
    pub async fn start(dir: &Path, session_id: &SessionId) -> TerminResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{session_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, rx) = mpsc::channel(RECORDING_QUEUE);
        tokio::spawn(write_loop(path.clone(), file, rx));
        debug!(path = %path.display(), "recording started");

        Ok(Self {
            path,
            start_time: Instant::now(),
            tx,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an event. Never blocks.
    pub fn record(&self, event: RecordingEvent) {
        let entry = RecordingEntry {
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            event,
        };
        if self.tx.try_send(entry).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 1000 == 0 {
                warn!(path = %self.path.display(), dropped, "recording queue full, dropping events");
            }
        }
    }

    pub fn record_resize(&self, size: TermSize) {
        self.record(RecordingEvent::Resize {
            cols: size.cols,
            rows: size.rows,
        });
    }
}

async fn write_loop(path: PathBuf, mut file: tokio::fs::File, mut rx: mpsc::Receiver<RecordingEntry>) {
    while let Some(entry) = rx.recv().await {
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialize recording event");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!(path = %path.display(), error = %e, "failed to write recording");
            return;
        }
        // Flush once the queue is drained rather than per event.
        if rx.is_empty() {
            if let Err(e) = file.flush().await {
                error!(path = %path.display(), error = %e, "failed to flush recording");
                return;
            }
        }
    }
    let _ = file.flush().await;
    debug!(path = %path.display(), "recording closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn read_entries(path: &Path) -> Vec<RecordingEntry> {
        let content = tokio::fs::read_to_string(path).await.unwrap_or_default();
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    #[tokio::test]
    async fn records_events_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::generate(1);
        let recorder = SessionRecorder::start(dir.path(), &id).await.unwrap();
        assert_eq!(recorder.path(), dir.path().join(format!("{id}.jsonl")));

        recorder.record(RecordingEvent::Start {
            command: "cat".into(),
            args: vec![],
        });
        recorder.record(RecordingEvent::Output(b"hi".to_vec()));
        recorder.record_resize(TermSize::new(30, 100));
        recorder.record(RecordingEvent::Exit { code: 0 });
        let path = recorder.path().to_path_buf();
        drop(recorder);

        let mut entries = Vec::new();
        for _ in 0..50 {
            entries = read_entries(&path).await;
            if entries.len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let events: Vec<_> = entries.into_iter().map(|e| e.event).collect();
        assert_eq!(events[1], RecordingEvent::Output(b"hi".to_vec()));
        assert_eq!(events[2], RecordingEvent::Resize { cols: 100, rows: 30 });
        assert_eq!(events[3], RecordingEvent::Exit { code: 0 });
    }
}
