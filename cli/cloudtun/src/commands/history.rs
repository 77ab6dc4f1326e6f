//! `cloudtun history`: list stored records, or replay one.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;

use crate::config::Config;
use crate::history;
use crate::notify::EventNotifier;
use crate::session::SessionRegistry;
use crate::spawn::ExecSpawner;

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// Replay the record with this number (as shown by the listing)
    /// instead of listing.
    #[arg(long)]
    pub connect: Option<usize>,
}

pub async fn run(args: HistoryArgs, config: &Config) -> Result<()> {
    let store = super::open_store(config)?;
    let entries = history::list_parsed(&store)?;

    let Some(index) = args.connect else {
        if entries.is_empty() {
            println!("History is empty");
            return Ok(());
        }
        for (number, entry) in entries.iter().enumerate() {
            println!("{:>3}  {}", number + 1, entry.raw);
        }
        return Ok(());
    };

    let entry = entries
        .get(index.checked_sub(1).context("record numbers start at 1")?)
        .with_context(|| format!("no history record #{index}"))?;
    let Some(invocation) = entry.invocation.clone() else {
        bail!("history record #{index} is not a valid tunnel record: '{}'", entry.raw);
    };

    let (notifier, _events) = EventNotifier::channel();
    let registry = SessionRegistry::new(Arc::new(ExecSpawner::new(config)), notifier);

    let accepted = registry.start_session(invocation.clone()).await?;
    if !accepted {
        bail!(
            "local port {} is occupied by another process",
            invocation.local_port()
        );
    }

    super::start::run_foreground(&registry, &invocation).await
}
