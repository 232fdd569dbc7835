//! `termin list` and `termin state`.

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};
use termin_client::BrokerClient;
use termin_core::{SessionState, SessionSummary};

pub async fn run_list(client: &BrokerClient) -> Result<()> {
    let sessions = client.list_sessions().await?;
    if sessions.is_empty() {
        println!("(no sessions)");
        return Ok(());
    }
    let now = now_secs();
    println!("{:<10} {:<14} {:<8} {:<8} {:<7} {}", "ID", "STATE", "SIZE", "CLIENTS", "AGE", "COMMAND");
    println!("{:<10} {:<14} {:<8} {:<8} {:<7} {}", "──", "─────", "────", "───────", "───", "───────");
    for s in &sessions {
        println!(
            "{:<10} {:<14} {:<8} {:<8} {:<7} {}",
            s.id.short(),
            s.state.to_string(),
            s.size.to_string(),
            s.attached,
            format_age(now.saturating_sub(s.created_at)),
            command_line(s),
        );
    }
    Ok(())
}

pub async fn run_state(client: &BrokerClient, session_id: &str) -> Result<()> {
    let summary = client.session_state(session_id).await?;
    print_summary(&summary);
    Ok(())
}

/// Print one session as `key: value` lines.
pub fn print_summary(s: &SessionSummary) {
    println!("id:       {}", s.id);
    println!("command:  {}", command_line(s));
    println!("state:    {}", s.state);
    if let (Some(code), SessionState::Terminated) = (s.exit_code, &s.state) {
        println!("exit:     {code}");
    }
    if let (Some(reason), SessionState::Terminated) = (&s.failure, &s.state) {
        println!("failure:  {reason}");
    }
    println!("size:     {}", s.size);
    println!("clients:  {}", s.attached);
    println!("buffered: {} bytes", s.buffered_bytes);
    println!("age:      {}", format_age(now_secs().saturating_sub(s.created_at)));
}

pub fn command_line(s: &SessionSummary) -> String {
    if s.args.is_empty() {
        s.command.clone()
    } else {
        format!("{} {}", s.command, s.args.join(" "))
    }
}

/// Compact age: `42s`, `5m`, `3h`, `2d`.
pub fn format_age(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages() {
        assert_eq!(format_age(0), "0s");
        assert_eq!(format_age(59), "59s");
        assert_eq!(format_age(60), "1m");
        assert_eq!(format_age(7200), "2h");
        assert_eq!(format_age(3 * 86_400 + 5), "3d");
    }

    #[test]
    fn command_with_args() {
        let mut s = crate::commands::summary(&"0".repeat(32));
        assert_eq!(command_line(&s), "/bin/sh");
        s.args = vec!["-c".into(), "true".into()];
        assert_eq!(command_line(&s), "/bin/sh -c true");
    }
}
