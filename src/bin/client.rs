//! Detour client
//!
//! Runs the local SOCKS5 proxy:
//! - resolves every target against the rule table
//! - relays directly, through the encrypted tunnel, or drops

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use detour::proxy::ProxyServer;
use detour::rules::{Mode, RuleTable};
use detour::Settings;
use tracing::{error, info};

/// Detour client - rule-routed SOCKS5 proxy
#[derive(Parser, Debug)]
#[command(name = "detour-client")]
#[command(about = "Rule-routed SOCKS5 proxy with an encrypted relay tunnel")]
#[command(version)]
struct Args {
    /// Local SOCKS5 listen port
    #[arg(short, long, default_value_t = 1080)]
    port: u16,

    /// Remote endpoint URL, e.g. https://relay.example.com
    #[arg(short, long)]
    remote: String,

    /// Shared passphrase; must match the remote endpoint
    #[arg(short = 'k', long, default_value = "detour")]
    passkey: String,

    /// Rules file to initialize the table from
    #[arg(short = 'f', long)]
    rules: Option<String>,

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

    info!("Detour client v{}", detour::VERSION);

    // without rules everything goes through the tunnel; a non-empty rules
    // file switches the table into rule lookup
    let rules = Arc::new(RuleTable::new(Mode::Tunnel));
    if let Some(path) = &args.rules {
        match rules.load(path.as_ref()) {
            Ok(count) => {
                info!("loaded {count} rules");
                if count > 0 {
                    rules.set_mode(Mode::Rule);
                }
            }
            Err(e) => error!("failed to load rules from {path}: {e}"),
        }
    }

    let settings = Settings {
        remote: args.remote,
        passkey: args.passkey,
        port: args.port,
    };

    let server = ProxyServer::bind(&settings, rules)
        .await
        .context("failed to start proxy")?;
    let handle = server.start();

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    handle.stop().await;

    Ok(())
}
