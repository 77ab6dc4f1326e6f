//! Opaque external inventory sources.
//!
//! Projects, clusters, namespaces, pods, and SQL instances come from the
//! operator's installed tooling (`gcloud`, `kubectl`), invoked as
//! subprocesses and parsed from their machine-readable output formats.
//! Nothing here is authoritative for the tunnel core; these are lookup
//! helpers for building invocations.

mod gcloud;
mod kubectl;
mod projects;
mod sqladmin;

pub use gcloud::{Cluster, GcloudCli};
pub use kubectl::{KubectlCli, Pod};
pub use projects::{Project, ProjectCache};
pub use sqladmin::{instances_list, SqlInstance, SqlInstanceType};

use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// Run an inventory command and capture stdout.
///
/// A failing command is an error to the caller, never fatal to the
/// process; stderr is included in the error so the operator sees what the
/// tool complained about.
pub(crate) async fn run_capture(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run '{program}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "'{program} {}' failed ({}): {}",
            args.join(" "),
            output.status,
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
