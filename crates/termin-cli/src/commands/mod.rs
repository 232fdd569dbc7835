pub mod attach;
pub mod control;
pub mod sessions;

use anyhow::{bail, Context, Result};
use termin_client::BrokerClient;
use termin_core::session::SESSION_ID_LEN;
use termin_core::SessionSummary;

/// Open a connection to the service at `addr`.
pub async fn connect(addr: &str) -> Result<BrokerClient> {
    BrokerClient::connect(addr)
        .await
        .with_context(|| format!("cannot reach terminservice at {addr}"))
}

/// Reject anything that could never match a session id before touching the
/// network.
pub fn check_id_fragment(fragment: &str) -> Result<()> {
    if fragment.is_empty() || fragment.len() > SESSION_ID_LEN {
        bail!("invalid session id '{fragment}': expected 1 to {SESSION_ID_LEN} hex characters");
    }
    if !fragment.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        bail!("invalid session id '{fragment}': expected lowercase hex");
    }
    Ok(())
}

/// Pick the single session whose id starts with `prefix`.
pub fn match_prefix<'a>(sessions: &'a [SessionSummary], prefix: &str) -> Result<&'a SessionSummary> {
    let mut hits = sessions.iter().filter(|s| s.id.as_str().starts_with(prefix));
    match (hits.next(), hits.next()) {
        (Some(only), None) => Ok(only),
        (None, _) => bail!("no session matches '{prefix}'"),
        (Some(_), Some(_)) => bail!("'{prefix}' matches more than one session, use more characters"),
    }
}

/// Expand a full id or unique prefix into a full session id.
pub async fn resolve_session(client: &BrokerClient, fragment: &str) -> Result<String> {
    check_id_fragment(fragment)?;
    if fragment.len() == SESSION_ID_LEN {
        return Ok(fragment.to_string());
    }
    let sessions = client.list_sessions().await?;
    Ok(match_prefix(&sessions, fragment)?.id.to_string())
}

#[cfg(test)]
pub(crate) fn summary(id: &str) -> SessionSummary {
    use termin_core::{SessionId, SessionState, TermSize};
    SessionSummary {
        id: SessionId::parse(id).unwrap(),
        command: "/bin/sh".into(),
        args: vec![],
        state: SessionState::Running,
        exit_code: None,
        failure: None,
        size: TermSize::default(),
        created_at: 0,
        attached: 0,
        buffered_bytes: 0,
    }
}
