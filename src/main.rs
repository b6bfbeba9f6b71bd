#![forbid(unsafe_code)]

//! `datagate` — read-only data-access server binary.
//!
//! Bootstraps configuration, starts the session reaper and the selected
//! transports (stdio, HTTP, or both), then waits for a shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use datagate::config::GlobalConfig;
use datagate::mcp::handler::AppState;
use datagate::mcp::{sse, transport};
use datagate::session::reaper;
use datagate::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Transport {
    Stdio,
    Http,
    Both,
}

#[derive(Debug, Parser)]
#[command(name = "datagate", about = "Read-only data-access MCP server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the data root directory.
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Which transports to serve.
    #[arg(long, value_enum, default_value_t = Transport::Stdio)]
    transport: Transport,

    /// Override the HTTP bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the HTTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("datagate server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

fn load_config(args: &Cli) -> Result<GlobalConfig> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::with_data_root(".")?,
    };
    if let Some(root) = &args.data_root {
        config.set_data_root(root)?;
    }
    if let Some(host) = &args.host {
        config.http.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }
    Ok(config)
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = load_config(&args)?;
    info!(data_root = %config.data_root.display(), "configuration loaded");

    let state = AppState::new(config);
    let ct = CancellationToken::new();

    // ── Start session reaper ────────────────────────────
    let reaper_handle = reaper::spawn_reaper(
        Arc::clone(&state.sessions),
        Duration::from_secs(state.config.sessions.reap_interval_seconds),
        ct.clone(),
    );

    // ── Start transports ────────────────────────────────
    // The HTTP listener binds before anything is reported ready so a bind
    // failure is fatal at startup.
    let http_handle = if matches!(args.transport, Transport::Http | Transport::Both) {
        let listener = sse::bind_listener(&state.config).await?;
        let http_state = Arc::clone(&state);
        let http_ct = ct.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = sse::serve_http_on(listener, http_state, http_ct).await {
                error!(%err, "http transport failed");
            }
        }))
    } else {
        None
    };

    let stdio_handle = if matches!(args.transport, Transport::Stdio | Transport::Both) {
        let stdio_state = Arc::clone(&state);
        let stdio_ct = ct.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = transport::serve_stdio(stdio_state, stdio_ct).await {
                error!(%err, "stdio transport failed");
            }
        }))
    } else {
        None
    };

    info!(transport = ?args.transport, "datagate ready");

    // ── Wait for shutdown ───────────────────────────────
    // With stdio as the only transport, the peer closing stdin ends the
    // process.
    match (args.transport, stdio_handle) {
        (Transport::Stdio, Some(mut handle)) => {
            let finished = tokio::select! {
                () = shutdown_signal() => {
                    info!("shutdown signal received");
                    false
                }
                _ = &mut handle => {
                    info!("stdin closed");
                    true
                }
            };
            ct.cancel();
            if !finished {
                let _ = handle.await;
            }
        }
        (_, stdio_handle) => {
            shutdown_signal().await;
            info!("shutdown signal received");
            ct.cancel();
            if let Some(handle) = stdio_handle {
                let _ = handle.await;
            }
        }
    }

    if let Some(handle) = http_handle {
        let _ = handle.await;
    }
    state.sessions.close_all();
    let _ = reaper_handle.await;
    info!("datagate shut down");

    Ok(())
}

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
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the local protocol channel.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
