//! One-shot session commands: create, send, resize, terminate, reap.

use anyhow::{Context, Result};
use std::path::PathBuf;
use termin_client::BrokerClient;
use termin_core::{CreateSession, SessionSummary, TermSize};
use tracing::debug;

pub struct CreateArgs {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub size: TermSize,
}

pub async fn run_create(client: &BrokerClient, args: CreateArgs) -> Result<SessionSummary> {
    let mut req = CreateSession::new(args.command).size(args.size);
    req.args = args.args;
    if let Some(cwd) = args.cwd {
        req = req.cwd(cwd);
    }
    for (key, value) in args.env {
        req = req.env(key, value);
    }
    debug!(command = %req.command, "creating session");
    let summary = client.create_session(req).await?;
    Ok(summary)
}

pub async fn run_send(client: &BrokerClient, session_id: &str, text: &str, newline: bool) -> Result<()> {
    let mut data = text.as_bytes().to_vec();
    if newline {
        data.push(b'\r');
    }
    client
        .send_input(session_id, &data)
        .await
        .context("failed to send input")?;
    Ok(())
}

pub async fn run_resize(client: &BrokerClient, session_id: &str, size: TermSize) -> Result<()> {
    client.resize(session_id, size).await?;
    Ok(())
}

pub async fn run_terminate(client: &BrokerClient, session_id: &str) -> Result<()> {
    let summary = client.terminate(session_id).await?;
    println!("{} {}", summary.id.short(), summary.state);
    Ok(())
}

pub async fn run_reap(client: &BrokerClient, session_id: &str) -> Result<()> {
    client.reap(session_id).await?;
    println!("reaped {}", &session_id[..8.min(session_id.len())]);
    Ok(())
}

/// Parse a `KEY=VALUE` pair for `--env`.
pub fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs() {
        assert_eq!(parse_env("LANG=C").unwrap(), ("LANG".into(), "C".into()));
        assert_eq!(parse_env("EMPTY=").unwrap(), ("EMPTY".into(), String::new()));
        assert_eq!(parse_env("A=b=c").unwrap(), ("A".into(), "b=c".into()));
        assert!(parse_env("NOEQUALS").is_err());
        assert!(parse_env("=value").is_err());
    }
}
