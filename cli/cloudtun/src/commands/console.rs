//! `cloudtun console`: run the web console.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::console;
use crate::notify::EventNotifier;
use crate::session::SessionRegistry;
use crate::spawn::ExecSpawner;

#[derive(Debug, Args)]
pub struct ConsoleArgs {
    /// Listen address; the configured default when omitted.
    #[arg(long)]
    pub listen: Option<SocketAddr>,
}

pub async fn run(args: ConsoleArgs, config: &Config) -> Result<()> {
    let store = super::open_store(config)?;
    let (notifier, events) = EventNotifier::channel();
    let registry = SessionRegistry::new(Arc::new(ExecSpawner::new(config)), notifier.clone());

    let addr = args.listen.unwrap_or(config.console_addr);
    console::serve(addr, registry, store, notifier, events).await
}
