//! Broker façade: the session API consumed in-process by a GUI and
//! remotely through the wire protocol.
//!
//! Performs argument validation only; everything else is delegated to the
//! registry, the attachment manager and the session itself.

use crate::attach::{AttachmentManager, AttachmentStream};
use crate::config::BrokerConfig;
use crate::pty::{NativePtyBackend, PtyBackend};
use crate::registry::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use termin_core::messages::CreateSession;
use termin_core::{AttachmentId, SessionId, SessionSummary, TermSize, TerminError, TerminResult};
use tracing::{debug, warn};

pub struct Broker {
    registry: Arc<SessionRegistry>,
    attachments: AttachmentManager,
}

impl Broker {
    pub fn new(backend: Arc<dyn PtyBackend>, config: BrokerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(backend, config));
        Self {
            attachments: AttachmentManager::new(registry.clone()),
            registry,
        }
    }

    /// Broker over the platform's native pseudo-terminals.
    pub fn native(config: BrokerConfig) -> Self {
        Self::new(Arc::new(NativePtyBackend::new()), config)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn attachments(&self) -> &AttachmentManager {
        &self.attachments
    }

    pub async fn create_session(&self, req: CreateSession) -> TerminResult<SessionSummary> {
        validate_create(&req)?;
        let session = self.registry.create(req).await?;
        Ok(session.summary())
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.registry.list().await
    }

    pub async fn session_state(&self, session_id: &str) -> TerminResult<SessionSummary> {
        let id = SessionId::parse(session_id)?;
        Ok(self.registry.get(&id).await?.summary())
    }

    pub async fn attach(&self, session_id: &str, client_id: &str) -> TerminResult<AttachmentStream> {
        let id = SessionId::parse(session_id)?;
        self.attachments.attach(&id, client_id).await
    }

    pub fn detach(&self, attachment_id: AttachmentId) {
        self.attachments.detach(attachment_id);
    }

    /// Forward input to a running session. No attachment is required.
    pub async fn send_input(&self, session_id: &str, data: Vec<u8>) -> TerminResult<usize> {
        let id = SessionId::parse(session_id)?;
        let session = self.registry.get(&id).await?;
        let pty = session.input_target()?;
        if data.is_empty() {
            return Ok(0);
        }
        session.record_input(&data);

        // Writes to one session run one at a time, including those whose
        // caller already timed out.
        let gate = session.input_gate();
        let timeout = self.registry.config().input_timeout;
        let write = tokio::task::spawn_blocking(move || {
            let _turn = gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pty.write(&data)
        });
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(TerminError::io(format!("input task failed: {e}"))),
            Err(_) => {
                warn!(session_id = %id, timeout_ms = timeout.as_millis() as u64, "input write timed out");
                Err(TerminError::Timeout(format!(
                    "input to session {id} not accepted within {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Resize a session's terminal. Best-effort once the session exists.
    pub async fn resize(&self, session_id: &str, size: TermSize) -> TerminResult<()> {
        let id = SessionId::parse(session_id)?;
        validate_size(size)?;
        let session = self.registry.get(&id).await?;
        match session.resize_target(size) {
            Some(pty) => {
                if let Err(e) = pty.resize(size) {
                    warn!(session_id = %id, %size, error = %e, "resize failed");
                }
            }
            None => debug!(session_id = %id, %size, "resize of non-running session ignored"),
        }
        Ok(())
    }

    pub async fn terminate(&self, session_id: &str) -> TerminResult<SessionSummary> {
        let id = SessionId::parse(session_id)?;
        self.registry.terminate(&id).await
    }

    pub async fn reap(&self, session_id: &str) -> TerminResult<()> {
        let id = SessionId::parse(session_id)?;
        self.registry.reap(&id).await
    }

    pub async fn collect_expired(&self, grace: Duration) -> Vec<SessionId> {
        self.registry.collect_expired(grace).await
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

fn validate_create(req: &CreateSession) -> TerminResult<()> {
    if req.command.trim().is_empty() {
        return Err(TerminError::InvalidArgument("command must not be empty".into()));
    }
    if req.command.contains('\0') {
        return Err(TerminError::InvalidArgument("command contains a NUL byte".into()));
    }
    if let Some(i) = req.args.iter().position(|a| a.contains('\0')) {
        return Err(TerminError::InvalidArgument(format!(
            "argument {i} contains a NUL byte"
        )));
    }
    for (key, value) in &req.env {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(TerminError::InvalidArgument(format!(
                "invalid environment variable name {key:?}"
            )));
        }
        if value.contains('\0') {
            return Err(TerminError::InvalidArgument(format!(
                "environment variable {key} contains a NUL byte"
            )));
        }
    }
    validate_size(req.size)
}

fn validate_size(size: TermSize) -> TerminResult<()> {
    if size.rows == 0 || size.cols == 0 {
        return Err(TerminError::InvalidArgument(format!(
            "terminal size must be non-zero, got {size}"
        )));
    }
    Ok(())
}
