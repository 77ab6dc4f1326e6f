//! The invocation value type and its record syntax.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::InvocationError;

/// Which external mechanism performs the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    /// `kubectl port-forward` to a cluster pod.
    Pod,
    /// `cloud-sql-proxy` to a managed SQL instance.
    Sql,
}

impl ProxyKind {
    /// The record token for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Pod => "pod",
            ProxyKind::Sql => "sql",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one tunnel request.
///
/// Equality follows the rendered record: two invocations are the same
/// session exactly when `to_string()` agrees.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TunnelInvocation {
    /// Port-forward to a pod container port.
    Pod {
        project: String,
        cluster: String,
        namespace: String,
        pod: String,
        local_port: u16,
        remote_port: u16,
    },
    /// Proxy to a managed SQL instance, addressed by connection name
    /// (`project:region:instance`). The remote side has no port of its
    /// own; the proxy binary owns that detail.
    Sql {
        project: String,
        instance: String,
        local_port: u16,
    },
}

impl TunnelInvocation {
    /// The proxy kind of this invocation.
    #[must_use]
    pub const fn kind(&self) -> ProxyKind {
        match self {
            TunnelInvocation::Pod { .. } => ProxyKind::Pod,
            TunnelInvocation::Sql { .. } => ProxyKind::Sql,
        }
    }

    /// The local TCP port this invocation occupies.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        match self {
            TunnelInvocation::Pod { local_port, .. }
            | TunnelInvocation::Sql { local_port, .. } => *local_port,
        }
    }

    /// The project the target lives in.
    #[must_use]
    pub fn project(&self) -> &str {
        match self {
            TunnelInvocation::Pod { project, .. } | TunnelInvocation::Sql { project, .. } => {
                project
            }
        }
    }

    /// A short human label for the remote end (pod name or connection name).
    #[must_use]
    pub fn target_label(&self) -> &str {
        match self {
            TunnelInvocation::Pod { pod, .. } => pod,
            TunnelInvocation::Sql { instance, .. } => instance,
        }
    }

    /// The canonical record string. Alias for `to_string` that reads
    /// better at call sites keying maps by identity.
    #[must_use]
    pub fn record(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TunnelInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelInvocation::Pod {
                project,
                cluster,
                namespace,
                pod,
                local_port,
                remote_port,
            } => write!(
                f,
                "--project={project} --cluster={cluster} --namespace={namespace} \
                 --pod={pod} --local-port={local_port} --remote-port={remote_port} \
                 --proxy-type=pod"
            ),
            TunnelInvocation::Sql {
                project,
                instance,
                local_port,
            } => write!(
                f,
                "--project={project} --sql-instance={instance} --local-port={local_port} \
                 --proxy-type=sql"
            ),
        }
    }
}

const FLAG_PROJECT: &str = "project";
const FLAG_CLUSTER: &str = "cluster";
const FLAG_NAMESPACE: &str = "namespace";
const FLAG_POD: &str = "pod";
const FLAG_SQL_INSTANCE: &str = "sql-instance";
const FLAG_LOCAL_PORT: &str = "local-port";
const FLAG_REMOTE_PORT: &str = "remote-port";
const FLAG_PROXY_TYPE: &str = "proxy-type";

const KNOWN_FLAGS: &[&str] = &[
    FLAG_PROJECT,
    FLAG_CLUSTER,
    FLAG_NAMESPACE,
    FLAG_POD,
    FLAG_SQL_INSTANCE,
    FLAG_LOCAL_PORT,
    FLAG_REMOTE_PORT,
    FLAG_PROXY_TYPE,
];

fn take<'a>(
    flags: &'a BTreeMap<&str, &str>,
    name: &'static str,
) -> Result<&'a str, InvocationError> {
    flags
        .get(name)
        .copied()
        .ok_or(InvocationError::MissingFlag(name))
}

fn take_port(
    flags: &BTreeMap<&str, &str>,
    name: &'static str,
) -> Result<u16, InvocationError> {
    let raw = take(flags, name)?;
    raw.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| InvocationError::InvalidPort {
            flag: name,
            value: raw.to_string(),
        })
}

impl FromStr for TunnelInvocation {
    type Err = InvocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(InvocationError::Empty);
        }

        let mut flags: BTreeMap<&str, &str> = BTreeMap::new();
        for token in s.split_whitespace() {
            let body = token
                .strip_prefix("--")
                .ok_or_else(|| InvocationError::MalformedToken(token.to_string()))?;
            let (flag, value) = body
                .split_once('=')
                .ok_or_else(|| InvocationError::MalformedToken(token.to_string()))?;
            if !KNOWN_FLAGS.contains(&flag) {
                return Err(InvocationError::UnknownFlag(flag.to_string()));
            }
            if flags.insert(flag, value).is_some() {
                return Err(InvocationError::DuplicateFlag(flag.to_string()));
            }
        }

        let kind = take(&flags, FLAG_PROXY_TYPE)?;
        match kind {
            "pod" => Ok(TunnelInvocation::Pod {
                project: take(&flags, FLAG_PROJECT)?.to_string(),
                cluster: take(&flags, FLAG_CLUSTER)?.to_string(),
                namespace: take(&flags, FLAG_NAMESPACE)?.to_string(),
                pod: take(&flags, FLAG_POD)?.to_string(),
                local_port: take_port(&flags, FLAG_LOCAL_PORT)?,
                remote_port: take_port(&flags, FLAG_REMOTE_PORT)?,
            }),
            "sql" => Ok(TunnelInvocation::Sql {
                project: take(&flags, FLAG_PROJECT)?.to_string(),
                instance: take(&flags, FLAG_SQL_INSTANCE)?.to_string(),
                local_port: take_port(&flags, FLAG_LOCAL_PORT)?,
            }),
            other => Err(InvocationError::UnknownProxyType(other.to_string())),
        }
    }
}

impl serde::Serialize for TunnelInvocation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for TunnelInvocation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn pod_invocation() -> TunnelInvocation {
        TunnelInvocation::Pod {
            project: "acme-prod".to_string(),
            cluster: "main".to_string(),
            namespace: "web".to_string(),
            pod: "api-7d9f".to_string(),
            local_port: 3000,
            remote_port: 8080,
        }
    }

    fn sql_invocation() -> TunnelInvocation {
        TunnelInvocation::Sql {
            project: "acme-prod".to_string(),
            instance: "acme-prod:europe-west1:db".to_string(),
            local_port: 3306,
        }
    }

    #[test]
    fn pod_record_renders_all_fields() {
        assert_eq!(
            pod_invocation().to_string(),
            "--project=acme-prod --cluster=main --namespace=web --pod=api-7d9f \
             --local-port=3000 --remote-port=8080 --proxy-type=pod"
        );
    }

    #[test]
    fn sql_record_has_no_remote_port() {
        let record = sql_invocation().to_string();
        assert!(!record.contains("remote-port"));
        assert!(record.ends_with("--proxy-type=sql"));
    }

    #[rstest]
    #[case(pod_invocation())]
    #[case(sql_invocation())]
    fn record_round_trips(#[case] invocation: TunnelInvocation) {
        let parsed: TunnelInvocation = invocation.to_string().parse().unwrap();
        assert_eq!(parsed, invocation);
        assert_eq!(parsed.to_string(), invocation.to_string());
    }

    #[test]
    fn identity_is_the_record_string() {
        let a = pod_invocation();
        let mut b = pod_invocation();
        assert_eq!(a.record(), b.record());

        if let TunnelInvocation::Pod { local_port, .. } = &mut b {
            *local_port = 3001;
        }
        assert_ne!(a.record(), b.record());
    }

    #[rstest]
    #[case("", InvocationError::Empty)]
    #[case("project=x", InvocationError::MalformedToken("project=x".to_string()))]
    #[case("--project", InvocationError::MalformedToken("--project".to_string()))]
    #[case("--zone=a --proxy-type=pod", InvocationError::UnknownFlag("zone".to_string()))]
    #[case(
        "--project=a --project=b --proxy-type=sql",
        InvocationError::DuplicateFlag("project".to_string())
    )]
    #[case(
        "--project=a --sql-instance=a:b:c --local-port=x --proxy-type=sql",
        InvocationError::InvalidPort { flag: "local-port", value: "x".to_string() }
    )]
    #[case(
        "--project=a --sql-instance=a:b:c --local-port=0 --proxy-type=sql",
        InvocationError::InvalidPort { flag: "local-port", value: "0".to_string() }
    )]
    #[case(
        "--project=a --local-port=1 --proxy-type=vm",
        InvocationError::UnknownProxyType("vm".to_string())
    )]
    fn rejects_malformed_records(#[case] record: &str, #[case] expected: InvocationError) {
        let err = record.parse::<TunnelInvocation>().unwrap_err();
        assert_eq!(err, expected);
    }

    #[test]
    fn pod_record_requires_remote_port() {
        let err = "--project=a --cluster=c --namespace=n --pod=p --local-port=1 --proxy-type=pod"
            .parse::<TunnelInvocation>()
            .unwrap_err();
        assert_eq!(err, InvocationError::MissingFlag("remote-port"));
    }

    #[test]
    fn serializes_as_record_string() {
        let json = serde_json::to_string(&sql_invocation()).unwrap();
        let expected = format!("\"{}\"", sql_invocation());
        assert_eq!(json, expected);

        let back: TunnelInvocation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sql_invocation());
    }
}
