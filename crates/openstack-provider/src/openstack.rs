use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use provisioner::remote::CommandOutput;
use provisioner::stack::{
    CloudStackClient, ResourceFailure, StackDescriptor, StackEvent, StackId, StackStatus,
};
use serde_derive::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::command::capture;

/// A [`CloudStackClient`] backed by the `openstack` command line client.
///
/// Credentials come from the usual `OS_*` environment variables or from
/// `clouds.yaml` when a cloud name is set.
#[derive(Clone, Debug)]
pub struct OpenStackCli {
    program: String,
    cloud: Option<String>,
}

impl Default for OpenStackCli {
    fn default() -> Self {
        OpenStackCli {
            program: "openstack".to_owned(),
            cloud: None,
        }
    }
}

impl OpenStackCli {
    /// Use `openstack` from `PATH` with credentials from the environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a cloud from `clouds.yaml` (`--os-cloud`).
    pub fn with_cloud(mut self, cloud: impl Into<String>) -> Self {
        self.cloud = Some(cloud.into());
        self
    }

    /// Use a different executable, e.g. an absolute path.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self, args: &[&str]) -> Vec<String> {
        let mut all: Vec<String> = Vec::with_capacity(args.len() + 2);
        if let Some(cloud) = &self.cloud {
            all.push("--os-cloud".to_owned());
            all.push(cloud.clone());
        }
        all.extend(args.iter().map(|a| (*a).to_owned()));
        all
    }

    async fn openstack(&self, args: &[&str]) -> anyhow::Result<CommandOutput> {
        let args = self.args(args);
        debug!(args = %args.join(" "), "Running openstack");
        capture(&self.program, &args).await
    }
}

#[async_trait]
impl CloudStackClient for OpenStackCli {
    async fn describe(&self, name: &str) -> anyhow::Result<Option<StackDescriptor>> {
        let output = self
            .openstack(&["stack", "show", "-f", "json", name])
            .await?;
        if output.success() {
            parse_stack(&output.stdout).map(Some)
        } else if is_not_found(&output) {
            Ok(None)
        } else {
            Err(failure("stack show", &output))
        }
    }

    async fn create(
        &self,
        name: &str,
        template: &Path,
        parameters: &BTreeMap<String, String>,
    ) -> anyhow::Result<StackId> {
        tokio::fs::metadata(template).await.map_err(|e| {
            anyhow::anyhow!("template {} is not readable: {}", template.display(), e)
        })?;

        let template = template.to_string_lossy();
        let pairs: Vec<String> = parameters
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        let mut args = vec!["stack", "create", "-f", "json", "-t", template.as_ref()];
        for pair in &pairs {
            args.push("--parameter");
            args.push(pair.as_str());
        }
        args.push(name);

        let output = self.openstack(&args).await?;
        if !output.success() {
            return Err(failure("stack create", &output));
        }
        let id = parse_created(&output.stdout)?;
        info!(stack = name, %id, "Stack create submitted");
        Ok(id)
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let output = self
            .openstack(&["stack", "delete", "--yes", name])
            .await?;
        if output.success() || is_not_found(&output) {
            Ok(())
        } else {
            Err(failure("stack delete", &output))
        }
    }

    async fn list_failed_resources(&self, name: &str) -> anyhow::Result<Vec<ResourceFailure>> {
        let output = self
            .openstack(&[
                "stack", "resource", "list", "--long", "-n", "5", "-f", "json", name,
            ])
            .await?;
        if !output.success() {
            return Err(failure("stack resource list", &output));
        }
        parse_failed_resources(&output.stdout)
    }

    async fn list_events(&self, name: &str) -> anyhow::Result<Vec<StackEvent>> {
        let output = self
            .openstack(&["stack", "event", "list", "-f", "json", name])
            .await?;
        if !output.success() {
            return Err(failure("stack event list", &output));
        }
        parse_events(&output.stdout)
    }

    async fn server_addresses(&self, instance: &str) -> anyhow::Result<Option<String>> {
        let output = self
            .openstack(&["server", "show", "-f", "json", "-c", "addresses", instance])
            .await?;
        if output.success() {
            parse_server_addresses(&output.stdout)
        } else if is_not_found(&output) {
            Ok(None)
        } else {
            Err(failure("server show", &output))
        }
    }
}

#[derive(Deserialize)]
struct StackShow {
    stack_name: String,
    stack_status: String,
    #[serde(default)]
    stack_status_reason: Option<String>,
    #[serde(default)]
    outputs: Option<Vec<StackOutput>>,
}

#[derive(Deserialize)]
struct StackOutput {
    output_key: String,
    #[serde(default)]
    output_value: Value,
}

#[derive(Deserialize)]
struct StackCreated {
    id: String,
}

#[derive(Deserialize)]
struct ResourceRow {
    resource_name: String,
    resource_type: String,
    resource_status: String,
    #[serde(default)]
    resource_status_reason: Option<String>,
}

#[derive(Deserialize)]
struct EventRow {
    resource_name: String,
    resource_status: String,
    #[serde(default)]
    resource_status_reason: Option<String>,
    #[serde(default)]
    event_time: Option<String>,
}

#[derive(Deserialize)]
struct ServerShow {
    #[serde(default)]
    addresses: Value,
}

fn parse_stack(json: &str) -> anyhow::Result<StackDescriptor> {
    let show: StackShow = serde_json::from_str(json)?;
    let outputs = show
        .outputs
        .unwrap_or_default()
        .into_iter()
        .filter_map(|o| value_text(o.output_value).map(|v| (o.output_key, v)))
        .collect();
    Ok(StackDescriptor {
        name: show.stack_name,
        status: StackStatus::from(show.stack_status.as_str()),
        status_reason: show.stack_status_reason.filter(|r| !r.is_empty()),
        outputs,
    })
}

fn parse_created(json: &str) -> anyhow::Result<StackId> {
    let created: StackCreated = serde_json::from_str(json)?;
    Ok(StackId(created.id))
}

fn parse_failed_resources(json: &str) -> anyhow::Result<Vec<ResourceFailure>> {
    let rows: Vec<ResourceRow> = serde_json::from_str(json)?;
    Ok(rows
        .into_iter()
        .filter(|r| r.resource_status.ends_with("_FAILED"))
        .map(|r| ResourceFailure {
            resource_name: r.resource_name,
            resource_type: r.resource_type,
            status: r.resource_status,
            status_reason: r.resource_status_reason.filter(|s| !s.is_empty()),
        })
        .collect())
}

fn parse_events(json: &str) -> anyhow::Result<Vec<StackEvent>> {
    let rows: Vec<EventRow> = serde_json::from_str(json)?;
    let mut events: Vec<StackEvent> = rows
        .into_iter()
        .map(|r| StackEvent {
            resource_name: r.resource_name,
            status: r.resource_status,
            status_reason: r.resource_status_reason.filter(|s| !s.is_empty()),
            time: r.event_time,
        })
        .collect();
    // ISO 8601 timestamps sort lexically; the sort is stable for equal times.
    events.sort_by(|a, b| a.time.cmp(&b.time));
    Ok(events)
}

/// Normalize the `addresses` column into `<network>=<addr1>, <addr2>` text.
///
/// Older clients print that text directly; newer ones print a
/// `{"network": ["addr", ...]}` map, which is flattened network by network.
fn parse_server_addresses(json: &str) -> anyhow::Result<Option<String>> {
    let show: ServerShow = serde_json::from_str(json)?;
    let text = match show.addresses {
        Value::String(text) => text,
        Value::Object(networks) => networks
            .into_iter()
            .filter_map(|(network, addrs)| {
                let addrs: Vec<String> = match addrs {
                    Value::Array(addrs) => addrs.into_iter().filter_map(value_text).collect(),
                    other => value_text(other).into_iter().collect(),
                };
                if addrs.is_empty() {
                    None
                } else {
                    Some(format!("{}={}", network, addrs.join(", ")))
                }
            })
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::new(),
    };
    if text.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

fn value_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn is_not_found(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    stderr.contains("not found")
        || stderr.contains("no server found")
        || stderr.contains("no server with a name or id")
}

fn failure(action: &str, output: &CommandOutput) -> anyhow::Error {
    anyhow::anyhow!(
        "openstack {} exited with {:?}: {}",
        action,
        output.code,
        output.stderr.trim()
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[test]
    fn stack_show_is_decoded() {
        let json = r#"{
            "id": "5b1f6c4e-4a0e-4bd2-9a55-1f1d8a1b2c3d",
            "stack_name": "k8s-stack",
            "stack_status": "CREATE_COMPLETE",
            "stack_status_reason": "Stack CREATE completed successfully",
            "outputs": [
                {"output_key": "master_floating_ip", "output_value": "192.168.1.124", "description": "Public address"},
                {"output_key": "worker_count", "output_value": 2, "description": "Workers"},
                {"output_key": "unset", "output_value": null, "description": ""}
            ]
        }"#;
        let stack = parse_stack(json).unwrap();
        assert_eq!(stack.name, "k8s-stack");
        assert_eq!(stack.status, StackStatus::CreateComplete);
        assert_eq!(
            stack.status_reason.as_deref(),
            Some("Stack CREATE completed successfully")
        );
        assert_eq!(
            stack.outputs.get("master_floating_ip").map(String::as_str),
            Some("192.168.1.124")
        );
        assert_eq!(stack.outputs.get("worker_count").map(String::as_str), Some("2"));
        assert!(!stack.outputs.contains_key("unset"));
    }

    #[test]
    fn stack_show_without_outputs_is_decoded() {
        let json = r#"{"stack_name": "k8s-stack", "stack_status": "CREATE_IN_PROGRESS", "stack_status_reason": "", "outputs": null}"#;
        let stack = parse_stack(json).unwrap();
        assert_eq!(stack.status, StackStatus::CreateInProgress);
        assert_eq!(stack.status_reason, None);
        assert!(stack.outputs.is_empty());
    }

    #[test]
    fn created_stack_id_is_decoded() {
        let id = parse_created(r#"{"id": "abc-123", "stack_name": "k8s-stack"}"#).unwrap();
        assert_eq!(id, StackId("abc-123".to_owned()));
    }

    #[test]
    fn only_failed_resources_are_kept() {
        let json = r#"[
            {"resource_name": "master-port", "physical_resource_id": "", "resource_type": "OS::Neutron::Port", "resource_status": "CREATE_FAILED", "resource_status_reason": "Conflict: IP address already allocated", "updated_time": "2024-01-01T00:00:00Z", "stack_name": "k8s-stack"},
            {"resource_name": "network", "physical_resource_id": "n1", "resource_type": "OS::Neutron::Net", "resource_status": "CREATE_COMPLETE", "resource_status_reason": "state changed", "updated_time": "2024-01-01T00:00:00Z", "stack_name": "k8s-stack"}
        ]"#;
        let failed = parse_failed_resources(json).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].resource_name, "master-port");
        assert_eq!(failed[0].resource_type, "OS::Neutron::Port");
        assert_eq!(
            failed[0].status_reason.as_deref(),
            Some("Conflict: IP address already allocated")
        );
    }

    #[test]
    fn events_are_ordered_oldest_first() {
        let json = r#"[
            {"id": "2", "resource_name": "k8s-master", "resource_status": "CREATE_IN_PROGRESS", "resource_status_reason": "state changed", "event_time": "2024-01-01T00:00:05Z"},
            {"id": "1", "resource_name": "network", "resource_status": "CREATE_COMPLETE", "resource_status_reason": "", "event_time": "2024-01-01T00:00:01Z"}
        ]"#;
        let events = parse_events(json).unwrap();
        assert_eq!(events[0].resource_name, "network");
        assert_eq!(events[0].status_reason, None);
        assert_eq!(events[1].resource_name, "k8s-master");
        assert_eq!(events[1].time.as_deref(), Some("2024-01-01T00:00:05Z"));
    }

    #[rstest]
    #[case::text(
        r#"{"addresses": "selfservice=172.16.1.64, 192.168.1.124"}"#,
        Some("selfservice=172.16.1.64, 192.168.1.124")
    )]
    #[case::map(
        r#"{"addresses": {"selfservice": ["172.16.1.64", "192.168.1.124"]}}"#,
        Some("selfservice=172.16.1.64, 192.168.1.124")
    )]
    #[case::single(r#"{"addresses": {"selfservice": ["172.16.1.70"]}}"#, Some("selfservice=172.16.1.70"))]
    #[case::empty_map(r#"{"addresses": {}}"#, None)]
    #[case::empty_text(r#"{"addresses": ""}"#, None)]
    fn server_addresses_are_normalized(#[case] json: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            parse_server_addresses(json).unwrap().as_deref(),
            expected
        );
    }

    #[test]
    fn not_found_is_recognized() {
        let missing_stack = CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "Stack not found: k8s-stack\n".to_owned(),
        };
        let missing_server = CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "No Server found for k8s-worker\n".to_owned(),
        };
        let auth = CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "The request you have made requires authentication. (HTTP 401)".to_owned(),
        };
        assert!(is_not_found(&missing_stack));
        assert!(is_not_found(&missing_server));
        assert!(!is_not_found(&auth));
    }

    #[test]
    fn cloud_name_is_passed_first() {
        let cli = OpenStackCli::new().with_cloud("lab");
        assert_eq!(
            cli.args(&["stack", "show", "k8s-stack"]),
            vec!["--os-cloud", "lab", "stack", "show", "k8s-stack"]
        );
    }

    #[tokio::test]
    async fn unreadable_template_is_rejected_before_calling_the_cli() {
        let dir = tempfile::tempdir().unwrap();
        let cli = OpenStackCli::new().with_program("/nonexistent/openstack");
        let err = cli
            .create(
                "k8s-stack",
                &dir.path().join("missing.yaml"),
                &BTreeMap::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is not readable"));
    }
}
