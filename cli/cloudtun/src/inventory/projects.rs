//! Lazily-warmed project metadata cache.
//!
//! Lookups never block on the backing `gcloud` call: the first lookup
//! kicks off a background warmup and returns "not found" until the cache
//! is filled. Callers treat a miss as "unknown right now" and retry on a
//! later interaction.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::GcloudCli;

/// Project metadata, as listed by gcloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub number: String,
}

#[derive(Default)]
struct CacheState {
    projects: Option<Vec<Project>>,
    warmup_in_progress: bool,
}

/// Non-blocking cache over the project listing.
#[derive(Clone)]
pub struct ProjectCache {
    cli: GcloudCli,
    state: Arc<Mutex<CacheState>>,
}

impl ProjectCache {
    pub fn new(cli: GcloudCli) -> Self {
        Self {
            cli,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Look up a project by id. Triggers a background warmup on first
    /// use; a lookup before the cache is warm yields `None` rather than
    /// blocking.
    pub fn get(&self, id: &str) -> Option<Project> {
        self.ensure_warming();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .projects
            .as_ref()?
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// True once the backing listing has been loaded.
    pub fn is_warm(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.projects.is_some()
    }

    fn ensure_warming(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.projects.is_some() || state.warmup_in_progress {
                return;
            }
            state.warmup_in_progress = true;
        }

        let cli = self.cli.clone();
        let shared = Arc::clone(&self.state);
        tokio::spawn(async move {
            let result = cli.projects_list_full().await;
            let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
            state.warmup_in_progress = false;
            match result {
                Ok(list) => {
                    debug!(count = list.len(), "Project cache warmed");
                    state.projects = Some(
                        list.into_iter()
                            .map(|(id, name, number)| Project { id, name, number })
                            .collect(),
                    );
                }
                Err(e) => {
                    // Leave the cache cold; the next lookup retries.
                    warn!(error = %e, "Project cache warmup failed");
                }
            }
        });
    }
}
