//! `cloudtun start`: build an invocation from flags and run it.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use cloudtun_invocation::TunnelInvocation;
use tracing::info;

use crate::config::Config;
use crate::history;
use crate::inventory::{GcloudCli, SqlInstanceType};
use crate::notify::EventNotifier;
use crate::session::SessionRegistry;
use crate::spawn::ExecSpawner;

/// Fallback starting point for local port suggestions.
const DEFAULT_POD_PORT: u16 = 3000;

/// MongoDB's native port, used when the target name suggests mongo.
const MONGO_PORT: u16 = 27017;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProxyTypeArg {
    Pod,
    Sql,
}

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Project the target lives in.
    #[arg(long)]
    pub project: String,

    /// What kind of tunnel to open.
    #[arg(long, value_enum)]
    pub proxy_type: ProxyTypeArg,

    /// Cluster name (pod tunnels).
    #[arg(long)]
    pub cluster: Option<String>,

    /// Namespace of the pod (pod tunnels).
    #[arg(long)]
    pub namespace: Option<String>,

    /// Pod name (pod tunnels).
    #[arg(long)]
    pub pod: Option<String>,

    /// SQL instance connection name, `project:region:instance` (sql
    /// tunnels).
    #[arg(long)]
    pub sql_instance: Option<String>,

    /// Local port to bind; the first free port from a sensible default
    /// when omitted.
    #[arg(long)]
    pub local_port: Option<u16>,

    /// Remote container port (pod tunnels).
    #[arg(long)]
    pub remote_port: Option<u16>,

    /// Do not record this tunnel in the history.
    #[arg(long)]
    pub no_save: bool,
}

pub async fn run(args: StartArgs, config: &Config) -> Result<()> {
    let gcloud = GcloudCli::new(config.gcloud_path.clone());
    let invocation = build_invocation(&args, &gcloud).await?;

    if let TunnelInvocation::Pod { project, cluster, .. } = &invocation {
        let clusters = gcloud.container_clusters_list(project).await?;
        let cluster = clusters
            .iter()
            .find(|c| &c.name == cluster)
            .with_context(|| format!("cluster '{cluster}' not found in project '{project}'"))?;
        gcloud.get_cluster_credentials(project, cluster).await?;
    }

    let (notifier, _events) = EventNotifier::channel();
    let registry = SessionRegistry::new(Arc::new(ExecSpawner::new(config)), notifier);

    let accepted = registry.start_session(invocation.clone()).await?;
    if !accepted {
        bail!(
            "local port {} is occupied by another process",
            invocation.local_port()
        );
    }

    if !args.no_save {
        let store = super::open_store(config)?;
        history::append(&store, &invocation.record())?;
    }

    run_foreground(&registry, &invocation).await
}

/// Keep a session in the foreground until ctrl-c or natural exit.
pub(crate) async fn run_foreground(
    registry: &SessionRegistry,
    invocation: &TunnelInvocation,
) -> Result<()> {
    info!(record = %invocation, port = invocation.local_port(), "Tunnel running, ctrl-c to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping tunnel");
            registry.stop_session(invocation).await;
        }
        _ = registry.wait_session(invocation) => {
            info!("Tunnel exited");
        }
    }
    Ok(())
}

/// Assemble the invocation from flags, filling the local port if needed.
async fn build_invocation(args: &StartArgs, gcloud: &GcloudCli) -> Result<TunnelInvocation> {
    match args.proxy_type {
        ProxyTypeArg::Pod => {
            let cluster = require(&args.cluster, "--cluster")?;
            let namespace = require(&args.namespace, "--namespace")?;
            let pod = require(&args.pod, "--pod")?;
            let remote_port = args
                .remote_port
                .context("--remote-port is required for pod tunnels")?;
            let local_port = match args.local_port {
                Some(port) => port,
                None => suggest_port(preferred_pod_port(pod))?,
            };

            Ok(TunnelInvocation::Pod {
                project: args.project.clone(),
                cluster: cluster.to_string(),
                namespace: namespace.to_string(),
                pod: pod.to_string(),
                local_port,
                remote_port,
            })
        }
        ProxyTypeArg::Sql => {
            let instance = require(&args.sql_instance, "--sql-instance")?;
            let local_port = match args.local_port {
                Some(port) => port,
                None => suggest_port(discover_sql_port(args, gcloud).await)?,
            };

            Ok(TunnelInvocation::Sql {
                project: args.project.clone(),
                instance: instance.to_string(),
                local_port,
            })
        }
    }
}

fn require<'a>(value: &'a Option<String>, flag: &str) -> Result<&'a str> {
    value
        .as_deref()
        .with_context(|| format!("{flag} is required for this proxy type"))
}

/// Starting point for a pod tunnel's local port suggestion.
fn preferred_pod_port(pod: &str) -> u16 {
    if pod.contains("mongo") {
        MONGO_PORT
    } else {
        DEFAULT_POD_PORT
    }
}

/// Starting point for a SQL tunnel's local port: the engine's
/// conventional port when discovery can tell us, MySQL's otherwise.
async fn discover_sql_port(args: &StartArgs, gcloud: &GcloudCli) -> u16 {
    let fallback = SqlInstanceType::MySql
        .default_port()
        .unwrap_or(DEFAULT_POD_PORT);
    let Some(wanted) = args.sql_instance.as_deref() else {
        return fallback;
    };
    match crate::inventory::instances_list(gcloud, &args.project).await {
        Ok(instances) => instances
            .iter()
            .find(|i| i.connection_name == wanted)
            .and_then(|i| i.default_port())
            .unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn suggest_port(start: u16) -> Result<u16> {
    cloudtun_portcheck::first_free_port(start)
        .with_context(|| format!("no free local port found at or above {start}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mongo_pods_prefer_the_mongo_port() {
        assert_eq!(preferred_pod_port("mongodb-0"), MONGO_PORT);
        assert_eq!(preferred_pod_port("api-7d9f"), DEFAULT_POD_PORT);
    }
}
