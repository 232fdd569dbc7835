//! Process-wide session table.
//!
//! The map lock is held only for insertion, removal and lookup. Spawning
//! and every PTY call happen outside it.

use crate::config::BrokerConfig;
use crate::pty::PtyBackend;
use crate::recording::SessionRecorder;
use crate::relay;
use crate::session::Session;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use termin_core::messages::CreateSession;
use termin_core::{SessionId, SessionSummary, TerminError, TerminResult};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_seq: AtomicU64,
    backend: Arc<dyn PtyBackend>,
    config: BrokerConfig,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn PtyBackend>, config: BrokerConfig) -> Self {
        info!(backend = backend.name(), max_sessions = config.max_sessions, "session registry ready");
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            backend,
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    async fn live_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.values().filter(|s| !s.is_terminal()).count()
    }

    /// Create a session and spawn its process.
    ///
    /// A spawn failure still yields a registered session, in `Failed`.
    pub async fn create(&self, launch: CreateSession) -> TerminResult<Arc<Session>> {
        if self.live_count().await >= self.config.max_sessions {
            return Err(self.at_capacity());
        }

        let id = SessionId::generate(self.next_seq.fetch_add(1, Ordering::Relaxed));
        let recorder = match &self.config.recording_dir {
            Some(dir) => match SessionRecorder::start(dir, &id).await {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "recording disabled for session");
                    None
                }
            },
            None => None,
        };
        let session = Arc::new(Session::new(
            id.clone(),
            launch,
            self.config.scrollback_bytes,
            recorder,
        ));

        {
            let mut sessions = self.sessions.write().await;
            let live = sessions.values().filter(|s| !s.is_terminal()).count();
            if live >= self.config.max_sessions {
                return Err(self.at_capacity());
            }
            sessions.insert(id.clone(), session.clone());
        }

        let backend = self.backend.clone();
        let launch = session.launch().clone();
        let opened = tokio::task::spawn_blocking(move || backend.open(&launch))
            .await
            .map_err(|e| TerminError::Spawn(format!("spawn task failed: {e}")))
            .and_then(|r| r);

        match opened {
            Ok(opened) => {
                let terminate_now = session.mark_running(opened.process.clone());
                relay::spawn(
                    session.clone(),
                    opened.process.clone(),
                    opened.reader,
                    self.config.drain_grace,
                );
                info!(
                    session_id = %id,
                    command = %session.launch().command,
                    pid = ?opened.process.pid(),
                    "session created"
                );
                if terminate_now {
                    debug!(session_id = %id, "terminate requested during spawn");
                    if let Err(e) = opened.process.terminate() {
                        warn!(session_id = %id, error = %e, "terminate after spawn failed");
                    }
                }
            }
            Err(e) => {
                warn!(session_id = %id, command = %session.launch().command, error = %e, "spawn failed");
                session.mark_spawn_failed(e.to_string());
            }
        }
        Ok(session)
    }

    fn at_capacity(&self) -> TerminError {
        TerminError::InvalidState(format!(
            "max sessions ({}) reached",
            self.config.max_sessions
        ))
    }

    pub async fn get(&self, id: &SessionId) -> TerminResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TerminError::NotFound(format!("session {id}")))
    }

    /// Snapshot of all sessions in creation order.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = sessions.iter().map(|s| s.summary()).collect();
        // Ids lead with the creation sequence number.
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Request termination without waiting for the process to go away.
    pub async fn terminate(&self, id: &SessionId) -> TerminResult<SessionSummary> {
        let session = self.get(id).await?;
        if let Some(pty) = session.request_terminate() {
            info!(session_id = %id, "terminating session");
            pty.terminate()?;
        }
        Ok(session.summary())
    }

    /// Remove an ended session. Live sessions stay and yield `InvalidState`.
    pub async fn reap(&self, id: &SessionId) -> TerminResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| TerminError::NotFound(format!("session {id}")))?;
        let state = session.state();
        if !state.is_terminal() {
            return Err(TerminError::InvalidState(format!(
                "session {id} is {state}; terminate it before reaping"
            )));
        }
        sessions.remove(id);
        info!(session_id = %id, %state, "session reaped");
        Ok(())
    }

    /// Remove sessions that have been terminal for longer than `grace`.
    pub async fn collect_expired(&self, grace: Duration) -> Vec<SessionId> {
        let mut sessions = self.sessions.write().await;
        let mut removed = Vec::new();
        sessions.retain(|id, session| match session.ended_for() {
            Some(ended) if ended >= grace => {
                removed.push(id.clone());
                false
            }
            _ => true,
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), "collected expired sessions");
        }
        removed
    }

    /// Terminate every live session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            if let Some(pty) = session.request_terminate() {
                if let Err(e) = pty.terminate() {
                    warn!(session_id = %session.id(), error = %e, "terminate on shutdown failed");
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::scripted::ScriptedBackend;
    use crate::testing::wait_until;
    use termin_core::SessionState;

    fn registry(max_sessions: usize) -> (Arc<ScriptedBackend>, SessionRegistry) {
        let backend = Arc::new(ScriptedBackend::standard());
        let config = BrokerConfig {
            max_sessions,
            drain_grace: Duration::from_millis(50),
            ..Default::default()
        };
        (backend.clone(), SessionRegistry::new(backend, config))
    }

    #[tokio::test]
    async fn create_runs_and_lists_in_order() {
        let (_backend, reg) = registry(8);
        let a = reg.create(CreateSession::new("echo")).await.unwrap();
        let b = reg.create(CreateSession::new("silent")).await.unwrap();
        assert_eq!(a.state(), SessionState::Running);

        let list = reg.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, *a.id());
        assert_eq!(list[1].id, *b.id());
        assert_eq!(reg.get(a.id()).await.unwrap().id(), a.id());
    }

    #[tokio::test]
    async fn unknown_command_yields_failed_session() {
        let (_backend, reg) = registry(8);
        let s = reg.create(CreateSession::new("no-such-program")).await.unwrap();
        match s.state() {
            SessionState::Failed { reason } => assert!(reason.starts_with("spawn error"), "{reason}"),
            other => panic!("expected failed, got {other}"),
        }
        assert!(reg.get(s.id()).await.is_ok());
    }

    #[tokio::test]
    async fn capacity_counts_only_live_sessions() {
        let (_backend, reg) = registry(1);
        let first = reg.create(CreateSession::new("silent")).await.unwrap();
        let err = reg.create(CreateSession::new("silent")).await.err().unwrap();
        assert!(matches!(err, TerminError::InvalidState(_)));

        reg.terminate(first.id()).await.unwrap();
        wait_until(|| first.is_terminal()).await;
        assert!(reg.create(CreateSession::new("silent")).await.is_ok());
    }

    #[tokio::test]
    async fn reap_refuses_live_sessions() {
        let (_backend, reg) = registry(8);
        let s = reg.create(CreateSession::new("silent")).await.unwrap();
        let err = reg.reap(s.id()).await.unwrap_err();
        assert!(matches!(err, TerminError::InvalidState(_)));
        assert_eq!(reg.len().await, 1);

        reg.terminate(s.id()).await.unwrap();
        wait_until(|| s.state() == SessionState::Terminated).await;
        reg.reap(s.id()).await.unwrap();
        assert!(reg.is_empty().await);
        assert!(matches!(reg.get(s.id()).await, Err(TerminError::NotFound(_))));
        assert!(matches!(reg.reap(s.id()).await, Err(TerminError::NotFound(_))));
    }

    #[tokio::test]
    async fn terminate_after_exit_is_success() {
        let (_backend, reg) = registry(8);
        let s = reg.create(CreateSession::new("hello")).await.unwrap();
        wait_until(|| s.is_terminal()).await;
        assert_eq!(s.state(), SessionState::Exited { code: 0 });

        let summary = reg.terminate(s.id()).await.unwrap();
        assert_eq!(summary.state, SessionState::Terminated);
        assert_eq!(summary.exit_code, Some(0));
        reg.terminate(s.id()).await.unwrap();
    }

    #[tokio::test]
    async fn collect_expired_keeps_live_sessions() {
        let (_backend, reg) = registry(8);
        let done = reg.create(CreateSession::new("hello")).await.unwrap();
        let live = reg.create(CreateSession::new("silent")).await.unwrap();
        wait_until(|| done.is_terminal()).await;

        assert!(reg.collect_expired(Duration::from_secs(3600)).await.is_empty());
        let removed = reg.collect_expired(Duration::ZERO).await;
        assert_eq!(removed, vec![done.id().clone()]);
        assert!(reg.get(live.id()).await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_terminates_live_sessions() {
        let (backend, reg) = registry(8);
        let s = reg.create(CreateSession::new("echo")).await.unwrap();
        reg.shutdown().await;
        wait_until(|| s.state() == SessionState::Terminated).await;
        assert_eq!(backend.last_handle().terminate_calls(), 1);
    }
}
