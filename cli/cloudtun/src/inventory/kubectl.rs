//! kubectl CLI adapter: namespaces and pods.

use anyhow::Result;

use super::run_capture;

/// A pod with the details needed to build a port-forward invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub containers: Vec<String>,
    pub container_ports: Vec<u16>,
    pub app_label: Option<String>,
}

/// Adapter around the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct KubectlCli {
    path: String,
}

impl KubectlCli {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// List namespace names in the current cluster context.
    pub async fn namespaces_list(&self) -> Result<Vec<String>> {
        let out = run_capture(
            &self.path,
            &[
                "get",
                "namespaces",
                "-o=custom-columns=NAME:.metadata.name",
                "--no-headers",
            ],
        )
        .await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    /// List pods in a namespace with containers, exposed ports, and the
    /// `app` label.
    pub async fn pods_list(&self, namespace: &str) -> Result<Vec<Pod>> {
        let out = run_capture(
            &self.path,
            &[
                "get",
                "pods",
                "--namespace",
                namespace,
                "--no-headers",
                "-o=custom-columns=NAME:.metadata.name,\
                 CONTAINERS:spec.containers[*].name,\
                 PORTS:.spec.containers[*].ports[*].containerPort,\
                 LABELS=:.metadata.labels.app",
            ],
        )
        .await?;
        Ok(out.lines().filter_map(parse_pod_line).collect())
    }
}

/// Parse one line of the custom-columns pod listing.
///
/// Columns: name, comma-joined containers, comma-joined ports, app label.
/// Ports can be `<none>` for pods exposing nothing; labels can be
/// `<none>` too.
fn parse_pod_line(line: &str) -> Option<Pod> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 {
        return None;
    }

    let containers = tokens[1].split(',').map(str::to_string).collect();
    let container_ports = tokens[2]
        .split(',')
        .filter_map(|p| p.parse::<u16>().ok())
        .collect();
    let app_label = tokens
        .get(3)
        .filter(|label| **label != "<none>")
        .map(|label| label.to_string());

    Some(Pod {
        name: tokens[0].to_string(),
        containers,
        container_ports,
        app_label,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_pod_line() {
        let pod = parse_pod_line("api-7d9f   api,sidecar   8080,9090   api").unwrap();
        assert_eq!(pod.name, "api-7d9f");
        assert_eq!(pod.containers, vec!["api", "sidecar"]);
        assert_eq!(pod.container_ports, vec![8080, 9090]);
        assert_eq!(pod.app_label.as_deref(), Some("api"));
    }

    #[test]
    fn tolerates_missing_ports_and_labels() {
        let pod = parse_pod_line("job-x   main   <none>   <none>").unwrap();
        assert!(pod.container_ports.is_empty());
        assert!(pod.app_label.is_none());
    }

    #[test]
    fn skips_truncated_lines() {
        assert!(parse_pod_line("").is_none());
        assert!(parse_pod_line("name-only").is_none());
    }
}
