//! gcloud CLI adapter: projects, clusters, credentials.

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::info;

use super::run_capture;

/// A container cluster, as listed by gcloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub location: String,
}

/// Adapter around the `gcloud` binary.
#[derive(Debug, Clone)]
pub struct GcloudCli {
    path: String,
}

impl GcloudCli {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the gcloud binary this adapter invokes.
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    /// List project ids visible to the active account.
    pub async fn projects_list(&self) -> Result<Vec<String>> {
        let out = run_capture(
            &self.path,
            &["projects", "list", "--format", "value(projectId)"],
        )
        .await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    /// List projects with id, display name, and number.
    pub async fn projects_list_full(&self) -> Result<Vec<(String, String, String)>> {
        let out = run_capture(
            &self.path,
            &[
                "projects",
                "list",
                "--format",
                "value(projectId,name,projectNumber)",
            ],
        )
        .await?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                Some((
                    fields.next()?.to_string(),
                    fields.next()?.to_string(),
                    fields.next()?.to_string(),
                ))
            })
            .collect())
    }

    /// List container clusters in a project.
    pub async fn container_clusters_list(&self, project: &str) -> Result<Vec<Cluster>> {
        let out = run_capture(
            &self.path,
            &[
                "container",
                "clusters",
                "list",
                "--format",
                "value(name, location)",
                "--project",
                project,
            ],
        )
        .await?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let name = fields.next()?.to_string();
                let location = fields.next()?.to_string();
                Some(Cluster { name, location })
            })
            .collect())
    }

    /// Fetch kubeconfig credentials for a cluster so kubectl can reach it.
    pub async fn get_cluster_credentials(&self, project: &str, cluster: &Cluster) -> Result<()> {
        info!(project, cluster = %cluster.name, "Fetching cluster credentials");
        let status = Command::new(&self.path)
            .args([
                "container",
                "clusters",
                "get-credentials",
                &cluster.name,
                "--project",
                project,
                "--zone",
                &cluster.location,
            ])
            .status()
            .await
            .with_context(|| format!("failed to run '{}'", self.path))?;
        anyhow::ensure!(
            status.success(),
            "'{} container clusters get-credentials' failed ({status})",
            self.path
        );
        Ok(())
    }
}
