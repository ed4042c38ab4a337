//! Detour server
//!
//! Runs the remote tunnel endpoint: accepts encrypted sessions, decodes the
//! requested target and dials it on the client's behalf.

use anyhow::{Context, Result};
use clap::Parser;
use detour::tunnel::TunnelServer;
use tracing::info;

/// Detour server - remote tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "detour-server")]
#[command(about = "Remote relay endpoint for the detour proxy")]
#[command(version)]
struct Args {
    /// Listen port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Shared passphrase; must match the clients
    #[arg(short = 'k', long, default_value = "detour")]
    passkey: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    info!("Detour server v{}", detour::VERSION);

    let server = TunnelServer::bind(args.port, &args.passkey)
        .await
        .context("failed to start endpoint")?;

    tokio::select! {
        result = server.run() => result.context("endpoint failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down..."),
    }

    Ok(())
}
