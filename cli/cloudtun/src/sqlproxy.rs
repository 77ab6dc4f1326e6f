//! Local relay for dynamically discovered SQL instances.
//!
//! Keeps one local listener open per instance in the most recent
//! discovery update (via the reconciler, so flapping membership never
//! churns sockets) and hands each accepted connection to the
//! externally-supplied [`Dialer`] that speaks the actual proxy protocol.
//! The relay is agnostic to the bytes; it just splices.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use cloudtun_reconcile::{Accepted, Endpoint, EndpointSet, ReconcileError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::inventory::SqlInstance;

/// A connection to the remote side of a tunnel.
pub type RemoteConn = Box<dyn RemoteStream>;

/// Marker for anything the dialer can hand back.
pub trait RemoteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RemoteStream for T {}

/// Opens the remote leg for an endpoint. This is the seam to the
/// tunneling library; cloudtun never implements the wire protocol.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to the instance identified by `endpoint`.
    async fn dial(&self, endpoint: &str) -> anyhow::Result<RemoteConn>;
}

/// Map discovered instances to desired local endpoints.
///
/// Each instance listens on its engine's conventional port; instances of
/// an unknown engine are skipped (there is nothing sensible to bind).
pub fn desired_endpoints(instances: &[SqlInstance]) -> Vec<Endpoint> {
    instances
        .iter()
        .filter_map(|instance| {
            let port = instance.default_port()?;
            Some(Endpoint::new(
                instance.connection_name.clone(),
                SocketAddr::from(([0, 0, 0, 0], port)),
            ))
        })
        .collect()
}

/// Bind the static endpoints and run the relay until the update stream
/// closes.
pub async fn run(
    static_endpoints: &[Endpoint],
    updates: mpsc::Receiver<Vec<Endpoint>>,
    dialer: Arc<dyn Dialer>,
) -> Result<(), ReconcileError> {
    let (set, conn_rx) = EndpointSet::bind(static_endpoints).await?;
    run_with(set, conn_rx, updates, dialer).await;
    Ok(())
}

/// Run the relay over an already-bound endpoint set.
///
/// Every accepted connection is dialed and spliced on its own task, so
/// one slow instance never holds up the others. Returns once the update
/// stream closes and all listeners are shut down.
pub async fn run_with(
    set: EndpointSet,
    mut conn_rx: mpsc::Receiver<Accepted>,
    updates: mpsc::Receiver<Vec<Endpoint>>,
    dialer: Arc<dyn Dialer>,
) {
    let watcher = tokio::spawn(set.watch(updates));

    while let Some(accepted) = conn_rx.recv().await {
        let dialer = Arc::clone(&dialer);
        tokio::spawn(splice(accepted, dialer));
    }

    // All listeners are closed once the update stream ends; the accept
    // channel drains right after.
    let _ = watcher.await;
}

/// Dial the remote leg for one accepted connection and splice.
async fn splice(accepted: Accepted, dialer: Arc<dyn Dialer>) {
    let endpoint = accepted.endpoint;
    let mut client = accepted.stream;
    match dialer.dial(&endpoint).await {
        Ok(mut remote) => match tokio::io::copy_bidirectional(&mut client, &mut remote).await {
            Ok((to_remote, from_remote)) => {
                debug!(
                    endpoint = %endpoint,
                    peer = %accepted.peer_addr,
                    to_remote,
                    from_remote,
                    "Connection closed"
                );
            }
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "Connection error");
            }
        },
        Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "Dial failed, dropping connection");
        }
    }
}
