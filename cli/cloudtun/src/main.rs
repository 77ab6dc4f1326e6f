//! cloudtun - local tunnels to cluster pods and managed SQL instances.
//!
//! The primary interface for operators: start a tunnel in the
//! foreground, replay one from history, or run the web console.

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cloudtun::commands::Cli;
use cloudtun::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "cloudtun=info".into()))
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    if let Err(e) = cli.run(config).await {
        eprintln!("{} {e:#}", "Error:".red().bold());
        std::process::exit(1);
    }

    Ok(())
}
