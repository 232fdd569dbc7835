//! terminservice: terminal session service daemon.
//!
//! Listens for broker requests over TCP and keeps sessions running across
//! client connections.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use termin_service::config::{Overrides, ServiceConfig};
use termin_service::server::{self, Server};
use termin_service::Broker;
use tracing::{error, info};

/// terminservice: terminal session service
#[derive(Parser, Debug)]
#[command(name = "terminservice", version, about = "Terminal session service")]
struct Cli {
    /// Listen address
    #[arg(long)]
    listen: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.terminservice/config.toml")]
    config: String,

    /// Maximum concurrent live sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Output bytes retained per session for replay
    #[arg(long)]
    scrollback_bytes: Option<usize>,

    /// Seconds an ended session is kept before it is collected
    #[arg(long)]
    reap_grace: Option<u64>,

    /// Record sessions as JSON lines into this directory
    #[arg(long)]
    recording_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen: self.listen.clone(),
            port: self.port,
            max_sessions: self.max_sessions,
            scrollback_bytes: self.scrollback_bytes,
            reap_grace_secs: self.reap_grace,
            recording_dir: self.recording_dir.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match ServiceConfig::load(Some(&config_path), &cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.addr(),
        max_sessions = config.broker.max_sessions,
        "starting terminservice"
    );

    let listener = match Server::bind(config.addr()).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let broker = Arc::new(Broker::native(config.broker.clone()));
    let collector = server::spawn_collector(broker.clone(), config.gc_interval, config.reap_grace);
    let server = Arc::new(Server::new(broker.clone()));

    tokio::select! {
        result = server.clone().run(listener) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown();
    collector.abort();
    broker.shutdown().await;
    info!("terminservice stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
