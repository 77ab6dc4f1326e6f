//! Cloud SQL instance discovery.

use anyhow::Result;

use super::{run_capture, GcloudCli};

/// Database engine of a managed SQL instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlInstanceType {
    Postgres,
    MySql,
    SqlServer,
    Unknown,
}

impl SqlInstanceType {
    /// Classify from the instance's database version string
    /// (e.g. `POSTGRES_15`, `MYSQL_8_0`).
    #[must_use]
    pub fn from_database_version(version: &str) -> Self {
        if version.contains("POSTGRES") {
            SqlInstanceType::Postgres
        } else if version.contains("SQLSERVER") {
            SqlInstanceType::SqlServer
        } else if version.contains("MYSQL") {
            SqlInstanceType::MySql
        } else {
            SqlInstanceType::Unknown
        }
    }

    /// Conventional client port for the engine; `None` when unknown.
    #[must_use]
    pub const fn default_port(&self) -> Option<u16> {
        match self {
            SqlInstanceType::Postgres => Some(5432),
            SqlInstanceType::MySql => Some(3306),
            SqlInstanceType::SqlServer => Some(1433),
            SqlInstanceType::Unknown => None,
        }
    }
}

/// A managed SQL instance reachable through the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlInstance {
    /// `project:region:instance`, the proxy's addressing format.
    pub connection_name: String,
    pub instance_type: SqlInstanceType,
}

impl SqlInstance {
    /// Conventional client port for this instance's engine.
    #[must_use]
    pub fn default_port(&self) -> Option<u16> {
        self.instance_type.default_port()
    }
}

/// List SQL instances in a project.
pub async fn instances_list(gcloud: &GcloudCli, project: &str) -> Result<Vec<SqlInstance>> {
    let out = run_capture(
        gcloud.path(),
        &[
            "sql",
            "instances",
            "list",
            "--project",
            project,
            "--format",
            "value(connectionName,databaseVersion)",
        ],
    )
    .await?;

    Ok(out
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let connection_name = fields.next()?.to_string();
            let version = fields.next().unwrap_or_default();
            Some(SqlInstance {
                connection_name,
                instance_type: SqlInstanceType::from_database_version(version),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_database_versions() {
        assert_eq!(
            SqlInstanceType::from_database_version("POSTGRES_15"),
            SqlInstanceType::Postgres
        );
        assert_eq!(
            SqlInstanceType::from_database_version("MYSQL_8_0"),
            SqlInstanceType::MySql
        );
        assert_eq!(
            SqlInstanceType::from_database_version("SQLSERVER_2019_STANDARD"),
            SqlInstanceType::SqlServer
        );
        assert_eq!(
            SqlInstanceType::from_database_version("SPANNER"),
            SqlInstanceType::Unknown
        );
    }

    #[test]
    fn default_ports_follow_the_engine() {
        assert_eq!(SqlInstanceType::Postgres.default_port(), Some(5432));
        assert_eq!(SqlInstanceType::MySql.default_port(), Some(3306));
        assert_eq!(SqlInstanceType::SqlServer.default_port(), Some(1433));
        assert_eq!(SqlInstanceType::Unknown.default_port(), None);
    }
}
