#![forbid(unsafe_code)]

//! `datagate-ctl` — operator CLI for a running `datagate` HTTP listener.
//!
//! Fetches the read-only `/health` and `/stats` endpoints and prints the
//! JSON body.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "datagate-ctl",
    about = "Operator CLI for the datagate server",
    version,
    long_about = None
)]
struct Cli {
    /// Base URL of the server's HTTP listener.
    #[arg(long, default_value = "http://127.0.0.1:8765")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show liveness and the active session count.
    Status,

    /// Show cache, pool, session and message counters.
    Stats,
}

impl Command {
    fn path(&self) -> &'static str {
        match self {
            Self::Status => "/health",
            Self::Stats => "/stats",
        }
    }
}

fn main() {
    let args = Cli::parse();
    let url = format!("{}{}", args.url.trim_end_matches('/'), args.command.path());

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(fetch(&url)) {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
        }
        Err(err) => {
            eprintln!("Failed to query server: {err}");
            eprintln!("Is datagate serving HTTP at '{}'?", args.url);
            std::process::exit(1);
        }
    }
}

/// GET `url` and decode the JSON body.
async fn fetch(url: &str) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let response = reqwest::get(url).await?.error_for_status()?;
    Ok(response.json().await?)
}
