//! Endpoint listener set reconciliation.
//!
//! This library converges a set of open local listening sockets to a
//! desired set of named endpoints. Key concepts:
//!
//! - **Static entries**: endpoints configured up front. Bound once, never
//!   closed by reconciliation, only by final shutdown.
//! - **Dynamic entries**: endpoints that come and go with each update
//!   (e.g. SQL instances discovered asynchronously). Opened and closed to
//!   match the most recent desired set.
//! - **Carry-forward**: a dynamic endpoint present in consecutive updates
//!   keeps its socket. Membership can flap; re-opening on every update
//!   would disrupt clients mid-reconnect and waste file descriptors.
//!
//! Accepted connections from every listener flow into one bounded channel
//! as [`Accepted`] values; the consumer decides where the bytes go.
//! Closing a listener never severs connections it already accepted.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Depth of the accepted-connection channel.
const ACCEPT_QUEUE_DEPTH: usize = 16;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A static endpoint could not be bound. Static endpoints must be
    /// available at startup; this is fatal to set construction.
    #[error("failed to bind '{name}' on {addr}: {source}")]
    Bind {
        name: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A named endpoint and the local address its listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Identity of the endpoint (e.g. a SQL instance connection name).
    pub name: String,

    /// Local address to listen on.
    pub bind_addr: SocketAddr,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            bind_addr,
        }
    }
}

/// One connection accepted on behalf of an endpoint.
#[derive(Debug)]
pub struct Accepted {
    /// Name of the endpoint whose listener accepted the connection.
    pub endpoint: String,

    /// The accepted stream.
    pub stream: TcpStream,

    /// Peer address of the client.
    pub peer_addr: SocketAddr,
}

/// A bound listener and the task accepting on it.
struct BoundListener {
    /// Monotonic id, unique per opened socket. A carried-forward entry
    /// keeps its id; a close-then-reopen gets a new one.
    id: u64,

    /// Address the socket actually bound (resolves port 0).
    local_addr: SocketAddr,

    /// Signals the accept loop to stop and drop the socket.
    shutdown: watch::Sender<bool>,

    /// The accept loop task.
    task: JoinHandle<()>,
}

impl BoundListener {
    async fn bind(
        id: u64,
        endpoint: &Endpoint,
        conn_tx: mpsc::Sender<Accepted>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(endpoint.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            endpoint = %endpoint.name,
            addr = %local_addr,
            listener_id = id,
            "Listener opened"
        );

        let name = endpoint.name.clone();
        let task = tokio::spawn(accept_loop(listener, name, conn_tx, shutdown_rx));

        Ok(Self {
            id,
            local_addr,
            shutdown,
            task,
        })
    }

    /// Stop the accept loop and wait for the socket to be released.
    async fn close(self, endpoint: &str) {
        info!(endpoint = %endpoint, addr = %self.local_addr, "Closing listener");
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Accept connections until shutdown or the consumer goes away.
async fn accept_loop(
    listener: TcpListener,
    endpoint: String,
    conn_tx: mpsc::Sender<Accepted>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(endpoint = %endpoint, peer = %peer_addr, "Connection accepted");
                        let conn = Accepted {
                            endpoint: endpoint.clone(),
                            stream,
                            peer_addr,
                        };
                        if conn_tx.send(conn).await.is_err() {
                            debug!(endpoint = %endpoint, "Connection consumer gone, stopping accept loop");
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "Accept error");
                        // Brief sleep to avoid a tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// The reconciled set of endpoint listeners.
///
/// Constructed with the static endpoints; [`EndpointSet::apply`] converges
/// the dynamic half to each new desired set.
pub struct EndpointSet {
    conn_tx: mpsc::Sender<Accepted>,
    next_listener_id: u64,
    static_entries: BTreeMap<String, BoundListener>,
    dynamic_entries: BTreeMap<String, BoundListener>,
}

impl EndpointSet {
    /// Bind all static endpoints and return the set plus the receiving
    /// end of the accepted-connection channel.
    ///
    /// A static endpoint that cannot be bound fails construction; dynamic
    /// endpoints that fail later are skipped with a log line instead.
    pub async fn bind(
        static_endpoints: &[Endpoint],
    ) -> Result<(Self, mpsc::Receiver<Accepted>), ReconcileError> {
        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);

        let mut set = Self {
            conn_tx,
            next_listener_id: 0,
            static_entries: BTreeMap::new(),
            dynamic_entries: BTreeMap::new(),
        };

        for endpoint in static_endpoints {
            let id = set.next_id();
            let bound = BoundListener::bind(id, endpoint, set.conn_tx.clone())
                .await
                .map_err(|source| ReconcileError::Bind {
                    name: endpoint.name.clone(),
                    addr: endpoint.bind_addr,
                    source,
                })?;
            set.static_entries.insert(endpoint.name.clone(), bound);
        }

        Ok((set, conn_rx))
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        id
    }

    /// Converge the dynamic listeners to `desired`.
    ///
    /// Endpoints already in the static set are skipped (open, permanent).
    /// Dynamic endpoints present in `desired` are carried forward with
    /// their socket untouched; missing ones are opened; ones absent from
    /// `desired` are closed. Connections accepted before a close are
    /// unaffected.
    pub async fn apply(&mut self, desired: &[Endpoint]) {
        let mut still_open: BTreeMap<String, BoundListener> = BTreeMap::new();

        for endpoint in desired {
            if self.static_entries.contains_key(&endpoint.name) {
                continue;
            }

            if let Some(bound) = self.dynamic_entries.remove(&endpoint.name) {
                still_open.insert(endpoint.name.clone(), bound);
                continue;
            }

            let id = self.next_id();
            match BoundListener::bind(id, endpoint, self.conn_tx.clone()).await {
                Ok(bound) => {
                    still_open.insert(endpoint.name.clone(), bound);
                }
                Err(e) => {
                    warn!(
                        endpoint = %endpoint.name,
                        addr = %endpoint.bind_addr,
                        error = %e,
                        "Could not open listener, skipping endpoint"
                    );
                }
            }
        }

        // Whatever remains was not in the desired set: close it.
        let vanished = std::mem::take(&mut self.dynamic_entries);
        for (name, bound) in vanished {
            bound.close(&name).await;
        }

        self.dynamic_entries = still_open;
    }

    /// Close every listener, static and dynamic. Consumes the set.
    pub async fn close_all(mut self) {
        let static_entries = std::mem::take(&mut self.static_entries);
        for (name, bound) in static_entries {
            bound.close(&name).await;
        }
        let dynamic_entries = std::mem::take(&mut self.dynamic_entries);
        for (name, bound) in dynamic_entries {
            bound.close(&name).await;
        }
    }

    /// Drive the set from a stream of desired-set updates until the
    /// sender is dropped, then close everything.
    pub async fn watch(mut self, mut updates: mpsc::Receiver<Vec<Endpoint>>) {
        while let Some(desired) = updates.recv().await {
            debug!(desired = desired.len(), "Applying endpoint update");
            self.apply(&desired).await;
        }
        info!("Endpoint update stream closed, shutting listeners down");
        self.close_all().await;
    }

    /// The socket id for an endpoint, if one is open. Stable across
    /// carry-forward, fresh after close-and-reopen.
    #[must_use]
    pub fn listener_id(&self, name: &str) -> Option<u64> {
        self.entry(name).map(|bound| bound.id)
    }

    /// The bound local address for an endpoint, if one is open.
    #[must_use]
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.entry(name).map(|bound| bound.local_addr)
    }

    /// Number of currently open dynamic listeners.
    #[must_use]
    pub fn dynamic_len(&self) -> usize {
        self.dynamic_entries.len()
    }

    fn entry(&self, name: &str) -> Option<&BoundListener> {
        self.static_entries
            .get(name)
            .or_else(|| self.dynamic_entries.get(name))
    }
}

impl Drop for EndpointSet {
    fn drop(&mut self) {
        // Best-effort: signal accept loops so sockets are released even if
        // close_all was never awaited.
        for bound in self
            .static_entries
            .values()
            .chain(self.dynamic_entries.values())
        {
            let _ = bound.shutdown.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn loopback(name: &str, port: u16) -> Endpoint {
        Endpoint::new(name, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    async fn connect(addr: SocketAddr) -> std::io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }

    #[tokio::test]
    async fn static_endpoints_bind_at_construction() {
        let (set, _conn_rx) = EndpointSet::bind(&[loopback("static-a", 0)]).await.unwrap();
        let addr = set.local_addr("static-a").unwrap();
        assert!(connect(addr).await.is_ok());
        set.close_all().await;
    }

    #[tokio::test]
    async fn static_bind_conflict_is_fatal() {
        let (set, _conn_rx) = EndpointSet::bind(&[loopback("static-a", 0)]).await.unwrap();
        let taken = set.local_addr("static-a").unwrap();

        let err = EndpointSet::bind(&[loopback("static-b", taken.port())])
            .await
            .err()
            .expect("second bind on the same port must fail");
        assert!(matches!(err, ReconcileError::Bind { ref name, .. } if name == "static-b"));
        set.close_all().await;
    }

    #[tokio::test]
    async fn carry_forward_keeps_the_socket() {
        let (mut set, _conn_rx) = EndpointSet::bind(&[]).await.unwrap();

        set.apply(&[loopback("x", 0), loopback("y", 0)]).await;
        assert_eq!(set.dynamic_len(), 2);

        let x_addr = set.local_addr("x").unwrap();
        let y_addr = set.local_addr("y").unwrap();
        let y_id = set.listener_id("y").unwrap();

        set.apply(&[loopback("y", y_addr.port()), loopback("z", 0)])
            .await;
        assert_eq!(set.dynamic_len(), 2);

        // Y kept the same socket: same id, same address, still accepting.
        assert_eq!(set.listener_id("y").unwrap(), y_id);
        assert_eq!(set.local_addr("y").unwrap(), y_addr);
        assert!(connect(y_addr).await.is_ok());

        // X was closed; Z is new.
        assert!(set.listener_id("x").is_none());
        assert!(connect(x_addr).await.is_err());
        assert!(connect(set.local_addr("z").unwrap()).await.is_ok());

        set.close_all().await;
    }

    #[tokio::test]
    async fn reopened_endpoint_gets_a_fresh_listener_id() {
        let (mut set, _conn_rx) = EndpointSet::bind(&[]).await.unwrap();

        set.apply(&[loopback("x", 0)]).await;
        let first_id = set.listener_id("x").unwrap();

        set.apply(&[]).await;
        assert_eq!(set.dynamic_len(), 0);

        set.apply(&[loopback("x", 0)]).await;
        assert_ne!(set.listener_id("x").unwrap(), first_id);

        set.close_all().await;
    }

    #[tokio::test]
    async fn static_entries_survive_reconciliation() {
        let (mut set, _conn_rx) = EndpointSet::bind(&[loopback("perm", 0)]).await.unwrap();
        let perm_addr = set.local_addr("perm").unwrap();
        let perm_id = set.listener_id("perm").unwrap();

        // An update naming the static endpoint must not reopen it, and an
        // update omitting it must not close it.
        set.apply(&[Endpoint::new("perm", perm_addr)]).await;
        assert_eq!(set.dynamic_len(), 0);
        assert_eq!(set.listener_id("perm").unwrap(), perm_id);

        set.apply(&[]).await;
        assert!(connect(perm_addr).await.is_ok());

        set.close_all().await;
    }

    #[tokio::test]
    async fn accepted_connections_carry_the_endpoint_name() {
        let (mut set, mut conn_rx) = EndpointSet::bind(&[]).await.unwrap();
        set.apply(&[loopback("named", 0)]).await;
        let addr = set.local_addr("named").unwrap();

        let mut client = connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let accepted = conn_rx.recv().await.unwrap();
        assert_eq!(accepted.endpoint, "named");

        set.close_all().await;
    }

    #[tokio::test]
    async fn closing_a_listener_keeps_live_connections() {
        let (mut set, mut conn_rx) = EndpointSet::bind(&[]).await.unwrap();
        set.apply(&[loopback("x", 0)]).await;
        let addr = set.local_addr("x").unwrap();

        let mut client = connect(addr).await.unwrap();
        let mut accepted = conn_rx.recv().await.unwrap();

        set.apply(&[]).await;
        assert!(connect(addr).await.is_err());

        // The already-accepted pair still passes bytes.
        client.write_all(b"still-here").await.unwrap();
        let mut buf = [0u8; 10];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still-here");

        set.close_all().await;
    }

    #[tokio::test]
    async fn update_stream_close_shuts_everything_down() {
        let (set, _conn_rx) = EndpointSet::bind(&[loopback("perm", 0)]).await.unwrap();
        let perm_addr = set.local_addr("perm").unwrap();

        let (update_tx, update_rx) = mpsc::channel(1);
        let watcher = tokio::spawn(set.watch(update_rx));

        update_tx.send(vec![loopback("dyn", 0)]).await.unwrap();
        drop(update_tx);

        watcher.await.unwrap();
        assert!(connect(perm_addr).await.is_err());
    }
}
