use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use tracing::debug;

use super::{ControlPlane, PodRef};
use crate::remote::{CommandOutput, RemoteExecutor, SshTarget};

/// A [`ControlPlane`] that runs `kubectl` on a cluster member over SSH.
pub struct KubectlControlPlane<'a> {
    executor: &'a dyn RemoteExecutor,
    entry: SshTarget,
}

impl<'a> KubectlControlPlane<'a> {
    /// Use `entry` (normally a master) as the host that runs `kubectl`.
    pub fn new(executor: &'a dyn RemoteExecutor, entry: SshTarget) -> Self {
        KubectlControlPlane { executor, entry }
    }

    async fn kubectl(&self, args: &str) -> anyhow::Result<CommandOutput> {
        let command = format!("kubectl {}", args);
        debug!(entry = %self.entry, %command, "Running kubectl");
        self.executor.run(&self.entry, &command).await
    }
}

#[async_trait]
impl<'a> ControlPlane for KubectlControlPlane<'a> {
    async fn node_exists(&self, node: &str) -> anyhow::Result<bool> {
        let output = self
            .kubectl(&format!("get node {} -o name", quote(node)))
            .await?;
        if output.success() {
            Ok(true)
        } else if is_not_found(&output) {
            Ok(false)
        } else {
            Err(failure("get node", &output))
        }
    }

    async fn pods_on_node(&self, node: &str) -> anyhow::Result<Vec<PodRef>> {
        let output = self
            .kubectl(&format!(
                "get pods --all-namespaces --field-selector {} -o json",
                quote(&format!("spec.nodeName={}", node))
            ))
            .await?;
        if !output.success() {
            return Err(failure("get pods", &output));
        }
        parse_pod_list(&output.stdout)
    }

    async fn drain(&self, node: &str, timeout: Duration) -> anyhow::Result<()> {
        let output = self
            .kubectl(&format!(
                "drain {} --ignore-daemonsets --delete-emptydir-data --force --timeout={}s",
                quote(node),
                timeout.as_secs().max(1)
            ))
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(failure("drain", &output))
        }
    }

    async fn delete_node(&self, node: &str) -> anyhow::Result<()> {
        let output = self
            .kubectl(&format!("delete node {}", quote(node)))
            .await?;
        if output.success() || is_not_found(&output) {
            Ok(())
        } else {
            Err(failure("delete node", &output))
        }
    }

    async fn pod_exists(&self, pod: &PodRef) -> anyhow::Result<bool> {
        let output = self
            .kubectl(&format!(
                "get pod {} -n {} -o name",
                quote(&pod.name),
                quote(&pod.namespace)
            ))
            .await?;
        if output.success() {
            Ok(true)
        } else if is_not_found(&output) {
            Ok(false)
        } else {
            Err(failure("get pod", &output))
        }
    }

    async fn force_delete_pod(&self, pod: &PodRef) -> anyhow::Result<()> {
        let output = self
            .kubectl(&format!(
                "delete pod {} -n {} --grace-period=0 --force",
                quote(&pod.name),
                quote(&pod.namespace)
            ))
            .await?;
        if output.success() || is_not_found(&output) {
            Ok(())
        } else {
            Err(failure("delete pod", &output))
        }
    }
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

fn parse_pod_list(json: &str) -> anyhow::Result<Vec<PodRef>> {
    let list: PodList = serde_json::from_str(json)?;
    Ok(list
        .items
        .into_iter()
        .filter_map(|pod| {
            let name = pod.metadata.name?;
            Some(PodRef {
                namespace: pod.metadata.namespace.unwrap_or_else(|| "default".to_owned()),
                name,
            })
        })
        .collect())
}

fn is_not_found(output: &CommandOutput) -> bool {
    output.stderr.contains("NotFound") || output.stderr.contains("not found")
}

fn failure(action: &str, output: &CommandOutput) -> anyhow::Error {
    anyhow::anyhow!(
        "kubectl {} exited with {:?}: {}",
        action,
        output.code,
        output.stderr.trim()
    )
}

// Wrap in single quotes for the remote shell.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedExecutor {
        responses: Vec<(&'static str, CommandOutput)>,
        commands: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(responses: Vec<(&'static str, CommandOutput)>) -> Self {
            ScriptedExecutor {
                responses,
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedExecutor {
        async fn probe(&self, _target: &SshTarget) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn run(&self, _target: &SshTarget, command: &str) -> anyhow::Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_owned());
            Ok(self
                .responses
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix))
                .map(|(_, output)| output.clone())
                .unwrap_or_else(|| ok("")))
        }
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(0),
            stdout: stdout.to_owned(),
            stderr: String::new(),
        }
    }

    fn not_found(stderr: &str) -> CommandOutput {
        CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_owned(),
        }
    }

    const POD_LIST: &str = r#"{
        "apiVersion": "v1",
        "kind": "List",
        "metadata": {"resourceVersion": ""},
        "items": [
            {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "web-1", "namespace": "default"}},
            {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "kube-proxy-x2x", "namespace": "kube-system"}}
        ]
    }"#;

    fn entry() -> SshTarget {
        SshTarget::new("192.168.1.124", "ubuntu")
    }

    #[test]
    fn pod_list_is_decoded() {
        let pods = parse_pod_list(POD_LIST).unwrap();
        assert_eq!(
            pods,
            vec![
                PodRef {
                    namespace: "default".to_owned(),
                    name: "web-1".to_owned()
                },
                PodRef {
                    namespace: "kube-system".to_owned(),
                    name: "kube-proxy-x2x".to_owned()
                },
            ]
        );
    }

    #[test]
    fn empty_pod_list_is_decoded() {
        let pods = parse_pod_list(r#"{"apiVersion": "v1", "kind": "List", "items": []}"#).unwrap();
        assert!(pods.is_empty());
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(quote("k8s-worker"), "'k8s-worker'");
        assert_eq!(quote("a'b"), r"'a'\''b'");
    }

    #[tokio::test]
    async fn missing_node_is_reported_absent() {
        let executor = ScriptedExecutor::new(vec![(
            "kubectl get node",
            not_found("Error from server (NotFound): nodes \"k8s-worker\" not found"),
        )]);
        let control_plane = KubectlControlPlane::new(&executor, entry());
        assert!(!control_plane.node_exists("k8s-worker").await.unwrap());
    }

    #[tokio::test]
    async fn unexpected_kubectl_failure_is_an_error() {
        let executor = ScriptedExecutor::new(vec![(
            "kubectl get node",
            not_found("The connection to the server localhost:8080 was refused"),
        )]);
        let control_plane = KubectlControlPlane::new(&executor, entry());
        assert!(control_plane.node_exists("k8s-worker").await.is_err());
    }

    #[tokio::test]
    async fn commands_sent_to_the_entry_host() {
        let executor = ScriptedExecutor::new(vec![("kubectl get pods", ok(POD_LIST))]);
        let control_plane = KubectlControlPlane::new(&executor, entry());

        let pods = control_plane.pods_on_node("k8s-worker").await.unwrap();
        control_plane
            .drain("k8s-worker", Duration::from_secs(120))
            .await
            .unwrap();
        control_plane.delete_node("k8s-worker").await.unwrap();
        control_plane.force_delete_pod(&pods[0]).await.unwrap();

        let commands = executor.commands.lock().unwrap().clone();
        assert_eq!(
            commands,
            vec![
                "kubectl get pods --all-namespaces --field-selector 'spec.nodeName=k8s-worker' -o json",
                "kubectl drain 'k8s-worker' --ignore-daemonsets --delete-emptydir-data --force --timeout=120s",
                "kubectl delete node 'k8s-worker'",
                "kubectl delete pod 'web-1' -n 'default' --grace-period=0 --force",
            ]
        );
    }
}
