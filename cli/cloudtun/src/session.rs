//! The session registry.
//!
//! Tracks every running tunnel session, keyed by its invocation record,
//! and enforces the one-session-per-local-port invariant. The registry is
//! the only owner of [`Session`] handles; callers refer to sessions by
//! invocation identity.
//!
//! Locking: one mutex around the session list. Critical sections are list
//! mutations only; process spawns and teardown waits always happen
//! outside the lock, so a stuck tunnel cannot stall unrelated ports.

use std::sync::Arc;

use anyhow::Result;
use cloudtun_invocation::TunnelInvocation;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::notify::{Event, EventNotifier};
use crate::spawn::{Session, Spawner};

/// Occupancy of one local port, computed fresh on every query.
///
/// Port state is inherently racy against the rest of the OS, so this is
/// never cached; the tunnel subprocess's own bind is the final arbiter.
#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    /// A probe bind on the port succeeded just now.
    pub available: bool,

    /// The port is busy, but only because a registry session holds it,
    /// so replacing that session would free it.
    pub available_after_replace: bool,

    /// The registry session occupying the port, if any.
    pub occupying: Option<TunnelInvocation>,
}

struct Inner {
    spawner: Arc<dyn Spawner>,
    notifier: EventNotifier,
    sessions: Mutex<Vec<Arc<Session>>>,
}

/// Registry of active tunnel sessions. Cheap to clone; all clones share
/// the same state, so it can be handed to the console and the CLI alike
/// without any ambient singleton.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    /// Create an empty registry over the given spawner.
    pub fn new(spawner: Arc<dyn Spawner>, notifier: EventNotifier) -> Self {
        Self {
            inner: Arc::new(Inner {
                spawner,
                notifier,
                sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start a tunnel session for `invocation`.
    ///
    /// Returns `Ok(false)` when the local port is occupied by a foreign
    /// process (nothing is mutated). When the port is occupied by a
    /// registry session, that session is stopped first and fully torn
    /// down before the new process is spawned: the old and the new
    /// tunnel never hold the port at the same time. Spawn failures are
    /// returned as errors with no session registered.
    ///
    /// Two concurrent calls for the same free port can both pass the
    /// probe; the loser's subprocess fails its own bind and surfaces as
    /// an ordinary spawn error.
    pub async fn start_session(&self, invocation: TunnelInvocation) -> Result<bool> {
        let status = self.port_status(invocation.local_port()).await;
        if !status.available {
            match status.occupying {
                Some(occupying) => {
                    info!(
                        port = invocation.local_port(),
                        old = %occupying,
                        new = %invocation,
                        "Port held by an existing session, replacing"
                    );
                    self.stop_session(&occupying).await;
                }
                None => {
                    warn!(
                        port = invocation.local_port(),
                        record = %invocation,
                        "Port occupied by a foreign process, rejecting"
                    );
                    return Ok(false);
                }
            }
        }

        let session = Arc::new(self.inner.spawner.spawn(&invocation).await?);
        {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.push(Arc::clone(&session));
        }
        info!(record = %invocation, port = invocation.local_port(), "Session registered");
        self.inner.notifier.publish(Event::MembershipChanged);

        // Background watcher: reap the registry entry when the process
        // exits on its own. An explicit stop already removed the entry,
        // in which case this finds nothing and stays silent.
        let registry = self.clone();
        tokio::spawn(async move {
            session.wait().await;
            if registry.remove_exact(&session).await {
                info!(record = %session.invocation(), "Session exited by itself, deregistered");
                registry.inner.notifier.publish(Event::MembershipChanged);
            }
        });

        Ok(true)
    }

    /// Stop the session whose invocation matches, if any.
    ///
    /// Idempotent: stopping an unknown or already-exited session is a
    /// no-op. The entry is removed under lock first; kill and the
    /// teardown wait run outside the lock since the wait can block for
    /// arbitrarily long.
    pub async fn stop_session(&self, invocation: &TunnelInvocation) {
        let session = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions
                .iter()
                .position(|s| s.invocation() == invocation)
                .map(|index| sessions.remove(index))
        };

        let Some(session) = session else {
            debug!(record = %invocation, "Stop requested for a session that is not registered");
            return;
        };

        session.kill();
        session.wait().await;
        info!(record = %invocation, "Session stopped");
        self.inner.notifier.publish(Event::MembershipChanged);
    }

    /// Compute the occupancy of `port` right now.
    pub async fn port_status(&self, port: u16) -> PortStatus {
        let available = cloudtun_portcheck::is_port_free(port);
        let occupying = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .iter()
                .find(|s| s.invocation().local_port() == port)
                .map(|s| s.invocation().clone())
        };

        if available {
            // A registry entry claiming a free port means its process
            // died and the watcher has not fired yet. Report reality and
            // leave the cleanup to the watcher.
            if let Some(stale) = occupying {
                debug!(port, record = %stale, "Registry entry is stale, port is actually free");
            }
            return PortStatus {
                available: true,
                available_after_replace: false,
                occupying: None,
            };
        }

        PortStatus {
            available: false,
            available_after_replace: occupying.is_some(),
            occupying,
        }
    }

    /// True iff a session with exactly this invocation is registered.
    pub async fn is_active(&self, invocation: &TunnelInvocation) -> bool {
        let sessions = self.inner.sessions.lock().await;
        sessions.iter().any(|s| s.invocation() == invocation)
    }

    /// Invocations of all registered sessions, in registration order.
    pub async fn active_sessions(&self) -> Vec<TunnelInvocation> {
        let sessions = self.inner.sessions.lock().await;
        sessions.iter().map(|s| s.invocation().clone()).collect()
    }

    /// Block until the session with this invocation is gone (stopped or
    /// exited by itself). Returns immediately if it is not registered.
    pub async fn wait_session(&self, invocation: &TunnelInvocation) {
        let session = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .iter()
                .find(|s| s.invocation() == invocation)
                .cloned()
        };
        if let Some(session) = session {
            session.wait().await;
        }
    }

    /// Remove this exact session instance (not merely an equal record).
    async fn remove_exact(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        match sessions.iter().position(|s| Arc::ptr_eq(s, session)) {
            Some(index) => {
                sessions.remove(index);
                true
            }
            None => false,
        }
    }
}
