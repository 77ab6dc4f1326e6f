//! CLI commands.

mod console;
mod history;
mod start;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::store::Store;

pub use start::{ProxyTypeArg, StartArgs};

/// cloudtun - local tunnels to cluster pods and managed SQL instances.
#[derive(Debug, Parser)]
#[command(name = "cloudtun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a tunnel and keep it in the foreground until interrupted.
    Start(start::StartArgs),

    /// List stored tunnel records, or replay one.
    History(history::HistoryArgs),

    /// Run the web console.
    Console(console::ConsoleArgs),
}

impl Cli {
    /// Run the selected command.
    pub async fn run(self, config: Config) -> Result<()> {
        match self.command {
            Command::Start(args) => start::run(args, &config).await,
            Command::History(args) => history::run(args, &config).await,
            Command::Console(args) => console::run(args, &config).await,
        }
    }
}

/// Open the config store honoring the configured directory override.
pub(crate) fn open_store(config: &Config) -> Result<Store> {
    match &config.config_dir {
        Some(dir) => Store::open(dir),
        None => Store::open_default(),
    }
}
