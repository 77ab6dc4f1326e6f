//! Command history over the config store.
//!
//! Every accepted tunnel start is appended as its invocation record.
//! The list is deduplicated by exact string equality keeping first-seen
//! order, then capped FIFO at [`MAX_COMMANDS`]; the oldest records are
//! the first to go.

use anyhow::Result;
use cloudtun_invocation::TunnelInvocation;

use crate::store::Store;

/// Maximum number of stored history records.
pub const MAX_COMMANDS: usize = 100;

/// One stored record, with its parse result.
///
/// Records are plain strings on disk and may have been edited by hand; an
/// unparseable record is still listed, it just cannot be replayed.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub raw: String,
    pub invocation: Option<TunnelInvocation>,
}

/// Append a record to the history, dedup, cap, and persist.
pub fn append(store: &Store, record: &str) -> Result<()> {
    let mut doc = store.read()?;
    doc.history.commands.push(record.to_string());
    doc.history.commands = dedup_first_seen(doc.history.commands);

    // Cap after dedup: a re-appended duplicate keeps its original slot
    // and must not evict anything.
    let len = doc.history.commands.len();
    if len > MAX_COMMANDS {
        doc.history.commands.drain(..len - MAX_COMMANDS);
    }

    store.write(&doc)
}

/// All stored records, oldest first.
pub fn list(store: &Store) -> Result<Vec<String>> {
    Ok(store.read()?.history.commands)
}

/// All stored records with their parsed invocations.
pub fn list_parsed(store: &Store) -> Result<Vec<HistoryEntry>> {
    Ok(list(store)?
        .into_iter()
        .map(|raw| {
            let invocation = raw.parse().ok();
            HistoryEntry { raw, invocation }
        })
        .collect())
}

/// Keep the first occurrence of every string, preserving order.
fn dedup_first_seen(commands: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    commands
        .into_iter()
        .filter(|record| seen.insert(record.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn appends_preserve_order() {
        let (_dir, store) = test_store();
        for record in ["a", "b", "c"] {
            append(&store, record).unwrap();
        }
        assert_eq!(list(&store).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicates_keep_first_seen_position() {
        let (_dir, store) = test_store();
        for record in ["a", "b", "a", "c"] {
            append(&store, record).unwrap();
        }
        assert_eq!(list(&store).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cap_keeps_the_most_recent_hundred_in_order() {
        let (_dir, store) = test_store();
        for i in 0..(MAX_COMMANDS + 25) {
            append(&store, &format!("record-{i:03}")).unwrap();
        }

        let stored = list(&store).unwrap();
        assert_eq!(stored.len(), MAX_COMMANDS);
        assert_eq!(stored[0], "record-025");
        assert_eq!(stored[MAX_COMMANDS - 1], format!("record-{:03}", MAX_COMMANDS + 24));
    }

    #[test]
    fn duplicate_append_never_evicts() {
        let (_dir, store) = test_store();
        for i in 0..MAX_COMMANDS {
            append(&store, &format!("record-{i:03}")).unwrap();
        }

        // Re-append the oldest record: length stays, order stays.
        append(&store, "record-000").unwrap();
        let stored = list(&store).unwrap();
        assert_eq!(stored.len(), MAX_COMMANDS);
        assert_eq!(stored[0], "record-000");
        assert_eq!(stored[1], "record-001");
    }

    #[test]
    fn list_parsed_flags_unparseable_records() {
        let (_dir, store) = test_store();
        append(
            &store,
            "--project=acme --sql-instance=acme:ew1:db --local-port=3306 --proxy-type=sql",
        )
        .unwrap();
        append(&store, "not a record").unwrap();

        let entries = list_parsed(&store).unwrap();
        assert!(entries[0].invocation.is_some());
        assert!(entries[1].invocation.is_none());
    }
}
