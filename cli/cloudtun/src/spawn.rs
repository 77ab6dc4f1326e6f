//! Tunnel process supervision.
//!
//! The [`Spawner`] trait abstracts launching the external binary that
//! performs one concrete tunnel (kubectl for pod forwards, cloud-sql-proxy
//! for SQL instances). A mock implementation is provided for tests.
//!
//! Each spawned process is owned by a supervision task; the returned
//! [`Session`] handle only carries a kill request channel and an exit
//! observation channel. Killing is cooperative (SIGTERM); the session is
//! fully torn down once `wait` returns.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cloudtun_invocation::TunnelInvocation;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Handle to one running tunnel subprocess.
///
/// The registry holds the only strong reference for the session's
/// lifetime; everything else observes it through the registry.
#[derive(Debug)]
pub struct Session {
    invocation: TunnelInvocation,
    kill_tx: watch::Sender<bool>,
    exited_rx: watch::Receiver<bool>,
}

impl Session {
    fn new(invocation: TunnelInvocation) -> (Self, watch::Receiver<bool>, watch::Sender<bool>) {
        let (kill_tx, kill_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = watch::channel(false);
        (
            Self {
                invocation,
                kill_tx,
                exited_rx,
            },
            kill_rx,
            exited_tx,
        )
    }

    /// The invocation this session is running.
    pub fn invocation(&self) -> &TunnelInvocation {
        &self.invocation
    }

    /// Request cooperative termination of the subprocess.
    ///
    /// Idempotent: safe to call repeatedly, concurrently, and after the
    /// process already exited on its own. No hard-kill escalation is
    /// performed; the process is expected to honor SIGTERM.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(true);
    }

    /// Wait until the subprocess exit has been observed.
    ///
    /// Idempotent and concurrency-safe: any number of callers may wait,
    /// and all unblock together once the supervision task reaps the
    /// process.
    pub async fn wait(&self) {
        let mut exited = self.exited_rx.clone();
        loop {
            if *exited.borrow_and_update() {
                return;
            }
            // A dropped sender means the supervision task is gone; there
            // is nothing left to wait for.
            if exited.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Launches tunnel-backing subprocesses.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Spawn the external tunnel process for `invocation`.
    ///
    /// Fails synchronously if the process cannot be started (missing
    /// binary, bad arguments); callers must not register a session for a
    /// process that never started. A later non-zero exit is logged by the
    /// supervision task, not surfaced here.
    async fn spawn(&self, invocation: &TunnelInvocation) -> Result<Session>;
}

/// Spawner backed by the real external binaries.
pub struct ExecSpawner {
    kubectl_path: String,
    sql_proxy_path: String,
}

impl ExecSpawner {
    /// Create a spawner using the binary paths from `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            kubectl_path: config.kubectl_path.clone(),
            sql_proxy_path: config.sql_proxy_path.clone(),
        }
    }

    /// Build the command line for an invocation.
    fn command_for(&self, invocation: &TunnelInvocation) -> Command {
        let mut cmd = match invocation {
            TunnelInvocation::Pod {
                namespace,
                pod,
                local_port,
                remote_port,
                ..
            } => {
                let mut cmd = Command::new(&self.kubectl_path);
                cmd.arg("port-forward")
                    .arg(pod)
                    .arg(format!("{local_port}:{remote_port}"))
                    .arg("--namespace")
                    .arg(namespace)
                    .arg("--address")
                    .arg("0.0.0.0");
                cmd
            }
            TunnelInvocation::Sql {
                instance,
                local_port,
                ..
            } => {
                let mut cmd = Command::new(&self.sql_proxy_path);
                cmd.arg("--address")
                    .arg("0.0.0.0")
                    .arg("--port")
                    .arg(local_port.to_string())
                    .arg(instance);
                cmd
            }
        };

        // The tunnel's own output is the operator's feedback channel;
        // pass it straight through.
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // Backstop if the supervision task is dropped without killing.
        cmd.kill_on_drop(true);

        // If the parent dies abnormally the kernel delivers SIGTERM to
        // the child; otherwise a dead parent leaves the tunnel holding
        // the port.
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd
    }
}

#[async_trait]
impl Spawner for ExecSpawner {
    async fn spawn(&self, invocation: &TunnelInvocation) -> Result<Session> {
        let child = self
            .command_for(invocation)
            .spawn()
            .with_context(|| format!("failed to spawn tunnel process for '{invocation}'"))?;

        info!(
            record = %invocation,
            local_port = invocation.local_port(),
            pid = child.id(),
            "Tunnel process started"
        );

        let (session, kill_rx, exited_tx) = Session::new(invocation.clone());
        tokio::spawn(supervise(
            child,
            invocation.clone(),
            kill_rx,
            exited_tx,
        ));
        Ok(session)
    }
}

/// Own the child process until it exits, honoring kill requests.
async fn supervise(
    mut child: Child,
    invocation: TunnelInvocation,
    mut kill_rx: watch::Receiver<bool>,
    exited_tx: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_requested(&mut kill_rx) => {
            terminate(&mut child);
            child.wait().await
        }
    };

    match status {
        Ok(status) if status.success() => {
            info!(record = %invocation, "Tunnel process exited");
        }
        Ok(status) => {
            // Not escalated: the start call returned long ago. Observers
            // learn about it through the registry watcher.
            warn!(record = %invocation, status = %status, "Tunnel process exited abnormally");
        }
        Err(e) => {
            warn!(record = %invocation, error = %e, "Failed to reap tunnel process");
        }
    }

    let _ = exited_tx.send(true);
}

async fn kill_requested(kill_rx: &mut watch::Receiver<bool>) {
    loop {
        if *kill_rx.borrow_and_update() {
            return;
        }
        if kill_rx.changed().await.is_err() {
            // Session handle dropped without a kill request; keep
            // supervising until natural exit.
            std::future::pending::<()>().await;
        }
    }
}

/// Send SIGTERM to the child (cooperative stop).
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            debug!(pid, "Sending SIGTERM to tunnel process");
            // Safety: plain kill(2) on a pid we own.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            return;
        }
    }
    // Already reaped, or no pid available on this platform: fall back to
    // the runtime's kill handle.
    let _ = child.start_kill();
}

// =============================================================================
// Mock spawner
// =============================================================================

/// Mock spawner for tests and development.
///
/// Instead of a subprocess it runs a small in-process task per session.
/// With `holding_ports`, each "process" binds the invocation's local port
/// for its lifetime, which makes port-occupancy behavior observable the
/// same way a real tunnel child makes it observable.
pub struct MockSpawner {
    fail_starts: bool,
    hold_ports: bool,
    spawned: std::sync::Mutex<Vec<TunnelInvocation>>,
    exit_triggers: std::sync::Mutex<Vec<(TunnelInvocation, watch::Sender<bool>)>>,
}

impl MockSpawner {
    /// Create a mock spawner whose sessions run until killed.
    pub fn new() -> Self {
        Self {
            fail_starts: false,
            hold_ports: false,
            spawned: std::sync::Mutex::new(Vec::new()),
            exit_triggers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create a mock spawner that fails every spawn.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::new()
        }
    }

    /// Create a mock spawner whose sessions bind their local port.
    pub fn holding_ports() -> Self {
        Self {
            hold_ports: true,
            ..Self::new()
        }
    }

    /// Every invocation spawned so far, in spawn order.
    pub fn spawned(&self) -> Vec<TunnelInvocation> {
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Simulate the subprocess for `invocation` dying on its own.
    pub fn trigger_exit(&self, invocation: &TunnelInvocation) {
        let triggers = self.exit_triggers.lock().unwrap_or_else(|e| e.into_inner());
        for (candidate, tx) in triggers.iter() {
            if candidate == invocation {
                let _ = tx.send(true);
            }
        }
    }
}

impl Default for MockSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Spawner for MockSpawner {
    async fn spawn(&self, invocation: &TunnelInvocation) -> Result<Session> {
        if self.fail_starts {
            anyhow::bail!("mock spawner configured to fail");
        }

        // A real child re-validates the port at bind time; the mock does
        // the same so probe races surface as spawn failures here too.
        let held_port = if self.hold_ports {
            let listener = std::net::TcpListener::bind(("0.0.0.0", invocation.local_port()))
                .with_context(|| {
                    format!(
                        "mock tunnel could not bind local port {}",
                        invocation.local_port()
                    )
                })?;
            Some(listener)
        } else {
            None
        };

        self.spawned.lock().unwrap_or_else(|e| e.into_inner()).push(invocation.clone());

        let (natural_tx, mut natural_rx) = watch::channel(false);
        self.exit_triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((invocation.clone(), natural_tx));

        let (session, mut kill_rx, exited_tx) = Session::new(invocation.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = kill_rx.changed() => {}
                _ = natural_rx.changed() => {}
            }
            // Dropping the listener is the mock equivalent of the child
            // releasing the port on exit.
            drop(held_port);
            let _ = exited_tx.send(true);
        });

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_invocation(port: u16) -> TunnelInvocation {
        TunnelInvocation::Sql {
            project: "acme".to_string(),
            instance: "acme:europe-west1:db".to_string(),
            local_port: port,
        }
    }

    #[tokio::test]
    async fn mock_session_waits_until_killed() {
        let spawner = MockSpawner::new();
        let session = spawner.spawn(&sql_invocation(13306)).await.unwrap();

        session.kill();
        session.wait().await;
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let spawner = MockSpawner::new();
        let session = spawner.spawn(&sql_invocation(13307)).await.unwrap();

        session.kill();
        session.kill();
        session.wait().await;
        session.kill();
        session.wait().await;
    }

    #[tokio::test]
    async fn all_waiters_unblock_together() {
        let spawner = MockSpawner::new();
        let session = std::sync::Arc::new(spawner.spawn(&sql_invocation(13308)).await.unwrap());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let session = std::sync::Arc::clone(&session);
                tokio::spawn(async move { session.wait().await })
            })
            .collect();

        session.kill();
        for waiter in waiters {
            waiter.await.unwrap();
        }
    }

    #[tokio::test]
    async fn failing_spawner_surfaces_the_error() {
        let spawner = MockSpawner::failing();
        assert!(spawner.spawn(&sql_invocation(13309)).await.is_err());
    }

    #[tokio::test]
    async fn trigger_exit_simulates_a_crash() {
        let spawner = MockSpawner::new();
        let invocation = sql_invocation(13310);
        let session = spawner.spawn(&invocation).await.unwrap();

        spawner.trigger_exit(&invocation);
        session.wait().await;
    }

    #[test]
    fn exec_spawner_builds_kubectl_arguments() {
        let spawner = ExecSpawner {
            kubectl_path: "kubectl".to_string(),
            sql_proxy_path: "cloud-sql-proxy".to_string(),
        };
        let invocation = TunnelInvocation::Pod {
            project: "acme".to_string(),
            cluster: "main".to_string(),
            namespace: "web".to_string(),
            pod: "api-0".to_string(),
            local_port: 3000,
            remote_port: 8080,
        };

        let cmd = spawner.command_for(&invocation);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec![
                "port-forward",
                "api-0",
                "3000:8080",
                "--namespace",
                "web",
                "--address",
                "0.0.0.0"
            ]
        );
    }

    #[test]
    fn exec_spawner_builds_sql_proxy_arguments() {
        let spawner = ExecSpawner {
            kubectl_path: "kubectl".to_string(),
            sql_proxy_path: "cloud-sql-proxy".to_string(),
        };
        let cmd = spawner.command_for(&sql_invocation(3306));
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec!["--address", "0.0.0.0", "--port", "3306", "acme:europe-west1:db"]
        );
    }
}
