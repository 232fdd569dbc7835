//! `termin`: command-line front-end for terminservice.
//!
//! Usage:
//!   termin list
//!   termin create [--attach] [--cwd DIR] [--env K=V].. -- <command> [args..]
//!   termin attach <session>
//!   termin send <session> <text>
//!   termin resize <session> <rows> <cols>
//!   termin terminate <session>
//!   termin reap <session>
//!
//! Sessions may be named by any unique prefix of their id.

mod commands;
mod config;
mod terminal;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use termin_core::TermSize;
use tracing::error;

#[derive(Parser)]
#[command(name = "termin", version, about = "Manage terminservice sessions")]
struct Cli {
    /// Service host (default from config, else 127.0.0.1)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Service port (default from config, else 7681)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Config file (default ~/.termin/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List sessions
    #[command(alias = "ls")]
    List,

    /// Start a new session
    Create {
        /// Working directory for the command
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Extra environment variable (repeatable)
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = commands::control::parse_env)]
        env: Vec<(String, String)>,

        /// Rows (default: current terminal)
        #[arg(long)]
        rows: Option<u16>,

        /// Columns (default: current terminal)
        #[arg(long)]
        cols: Option<u16>,

        /// Attach right after creating
        #[arg(short, long)]
        attach: bool,

        /// Program to run, followed by its arguments
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Show one session
    State { session: String },

    /// Attach interactively (Ctrl+] detaches)
    Attach { session: String },

    /// Send text to a session
    Send {
        session: String,
        text: String,
        /// Do not append a carriage return
        #[arg(short = 'n', long)]
        no_newline: bool,
    },

    /// Resize a session's terminal
    Resize { session: String, rows: u16, cols: u16 },

    /// Stop a session's process
    Terminate { session: String },

    /// Remove an ended session
    Reap { session: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "termin=debug,termin_client=debug" } else { "termin=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("termin: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Malformed ids fail before any connection attempt.
    match &cli.command {
        Commands::State { session }
        | Commands::Attach { session }
        | Commands::Send { session, .. }
        | Commands::Resize { session, .. }
        | Commands::Terminate { session }
        | Commands::Reap { session } => commands::check_id_fragment(session)?,
        Commands::List | Commands::Create { .. } => {}
    }

    let config_path = cli.config.clone().or_else(config::Config::default_path);
    let cfg = match config_path {
        Some(path) => config::Config::load(&path)?,
        None => config::Config::default(),
    };
    let host = cli.host.unwrap_or(cfg.default.host);
    let port = cli.port.unwrap_or(cfg.default.port);
    let client = commands::connect(&format!("{host}:{port}")).await?;

    match cli.command {
        Commands::List => commands::sessions::run_list(&client).await,
        Commands::Create {
            cwd,
            env,
            rows,
            cols,
            attach,
            command,
        } => {
            let mut words = command.into_iter();
            let program = words.next().unwrap_or_default();
            let current = terminal::current_size();
            let size = TermSize::new(rows.unwrap_or(current.rows), cols.unwrap_or(current.cols));
            let summary = commands::control::run_create(
                &client,
                commands::control::CreateArgs {
                    command: program,
                    args: words.collect(),
                    cwd,
                    env,
                    size,
                },
            )
            .await?;
            if attach && summary.state.is_live() {
                commands::attach::run(&client, summary.id.as_str()).await
            } else {
                println!("{}", summary.id);
                if !summary.state.is_live() {
                    anyhow::bail!("session {} did not start: {}", summary.id.short(), summary.state);
                }
                Ok(())
            }
        }
        Commands::State { session } => {
            let id = commands::resolve_session(&client, &session).await?;
            commands::sessions::run_state(&client, &id).await
        }
        Commands::Attach { session } => {
            let id = commands::resolve_session(&client, &session).await?;
            commands::attach::run(&client, &id).await
        }
        Commands::Send {
            session,
            text,
            no_newline,
        } => {
            let id = commands::resolve_session(&client, &session).await?;
            commands::control::run_send(&client, &id, &text, !no_newline).await
        }
        Commands::Resize { session, rows, cols } => {
            let id = commands::resolve_session(&client, &session).await?;
            commands::control::run_resize(&client, &id, TermSize::new(rows, cols)).await
        }
        Commands::Terminate { session } => {
            let id = commands::resolve_session(&client, &session).await?;
            commands::control::run_terminate(&client, &id).await
        }
        Commands::Reap { session } => {
            let id = commands::resolve_session(&client, &session).await?;
            commands::control::run_reap(&client, &id).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn create_keeps_hyphenated_program_args() {
        let cli = Cli::try_parse_from([
            "termin", "create", "--env", "LANG=C", "--rows", "40", "/bin/sh", "-c", "echo hi",
        ])
        .unwrap();
        let Commands::Create { env, rows, command, .. } = cli.command else {
            panic!("expected create");
        };
        assert_eq!(env, vec![("LANG".to_string(), "C".to_string())]);
        assert_eq!(rows, Some(40));
        assert_eq!(command, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["termin", "list", "--port", "9000", "-v"]).unwrap();
        assert_eq!(cli.port, Some(9000));
        assert!(cli.verbose);
    }
}
