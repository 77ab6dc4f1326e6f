//! Configuration for cloudtun.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Tool configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the kubectl binary.
    pub kubectl_path: String,

    /// Path of the gcloud binary.
    pub gcloud_path: String,

    /// Path of the cloud-sql-proxy binary.
    pub sql_proxy_path: String,

    /// Address the web console listens on.
    pub console_addr: SocketAddr,

    /// Override for the config directory (default: the platform config
    /// dir, e.g. `~/.config/cloudtun`).
    pub config_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let kubectl_path =
            std::env::var("CLOUDTUN_KUBECTL").unwrap_or_else(|_| "kubectl".to_string());
        let gcloud_path =
            std::env::var("CLOUDTUN_GCLOUD").unwrap_or_else(|_| "gcloud".to_string());
        let sql_proxy_path =
            std::env::var("CLOUDTUN_SQL_PROXY").unwrap_or_else(|_| "cloud-sql-proxy".to_string());

        let console_addr = std::env::var("CLOUDTUN_CONSOLE_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let console_addr = console_addr
            .parse()
            .with_context(|| format!("invalid CLOUDTUN_CONSOLE_ADDR '{console_addr}'"))?;

        let config_dir = std::env::var("CLOUDTUN_CONFIG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            kubectl_path,
            gcloud_path,
            sql_proxy_path,
            console_addr,
            config_dir,
        })
    }
}
