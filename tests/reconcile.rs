use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use provisioner::config::{Config, HostSpec};
use provisioner::config_management::{ConfigManagement, RunOutcome};
use provisioner::error::{
    EXIT_CODE_CANCELLED, EXIT_CODE_CONFIGURATION_FAILED, EXIT_CODE_PROVISIONING_FAILED,
};
use provisioner::remote::{CommandOutput, RemoteExecutor, SshTarget};
use provisioner::stack::{
    CloudStackClient, ResourceFailure, StackDescriptor, StackEvent, StackId, StackStatus,
};
use provisioner::{Collaborators, NodeRole, Phase, ReconcileError, Reconciler};

#[derive(Default)]
struct FakeCloud {
    // Answers to successive describe calls; the last one repeats.
    describes: Mutex<VecDeque<Option<StackDescriptor>>>,
    last_describe: Mutex<Option<StackDescriptor>>,
    addresses: BTreeMap<String, String>,
    failed_resources: Vec<ResourceFailure>,
    events: Vec<StackEvent>,
    calls: Mutex<Vec<String>>,
}

impl FakeCloud {
    fn new(describes: Vec<Option<StackDescriptor>>) -> Self {
        let mut addresses = BTreeMap::new();
        addresses.insert(
            "k8s-master".to_owned(),
            "selfservice=172.16.1.64, 192.168.1.124".to_owned(),
        );
        addresses.insert("k8s-worker".to_owned(), "selfservice=172.16.1.70".to_owned());
        FakeCloud {
            describes: Mutex::new(describes.into_iter().collect()),
            addresses,
            ..Default::default()
        }
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_owned());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudStackClient for FakeCloud {
    async fn describe(&self, _name: &str) -> anyhow::Result<Option<StackDescriptor>> {
        self.record("describe");
        let mut last = self.last_describe.lock().unwrap();
        if let Some(next) = self.describes.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }

    async fn create(
        &self,
        _name: &str,
        _template: &Path,
        _parameters: &BTreeMap<String, String>,
    ) -> anyhow::Result<StackId> {
        self.record("create");
        Ok(StackId("5b1f6c4e".to_owned()))
    }

    async fn delete(&self, _name: &str) -> anyhow::Result<()> {
        self.record("delete");
        Ok(())
    }

    async fn list_failed_resources(&self, _name: &str) -> anyhow::Result<Vec<ResourceFailure>> {
        self.record("list_failed_resources");
        Ok(self.failed_resources.clone())
    }

    async fn list_events(&self, _name: &str) -> anyhow::Result<Vec<StackEvent>> {
        self.record("list_events");
        Ok(self.events.clone())
    }

    async fn server_addresses(&self, instance: &str) -> anyhow::Result<Option<String>> {
        Ok(self.addresses.get(instance).cloned())
    }
}

const POD_LIST: &str = r#"{"apiVersion": "v1", "kind": "List", "items": [
    {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "web-1", "namespace": "default"}}
]}"#;

#[derive(Default)]
struct FakeRemote {
    unreachable: bool,
    // Probes answered negatively before the hosts come up.
    down_for_probes: usize,
    drain_fails: bool,
    delete_node_fails: bool,
    probes: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
}

impl FakeRemote {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.to_owned(),
        stderr: stderr.to_owned(),
    }
}

#[async_trait]
impl RemoteExecutor for FakeRemote {
    async fn probe(&self, target: &SshTarget) -> anyhow::Result<bool> {
        let mut probes = self.probes.lock().unwrap();
        probes.push(target.to_string());
        Ok(!self.unreachable && probes.len() > self.down_for_probes)
    }

    async fn run(&self, _target: &SshTarget, command: &str) -> anyhow::Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_owned());
        let result = if command.starts_with("kubectl get pods") {
            output(0, POD_LIST, "")
        } else if command.starts_with("kubectl drain") && self.drain_fails {
            output(1, "", "error: timed out waiting for the condition")
        } else if command.starts_with("kubectl delete node") && self.delete_node_fails {
            output(1, "", "Error from server (Forbidden): nodes is forbidden")
        } else {
            output(0, "", "")
        };
        Ok(result)
    }
}

#[derive(Default)]
struct FakeAnsible {
    code: Option<i32>,
    runs: Mutex<Vec<(PathBuf, PathBuf)>>,
}

#[async_trait]
impl ConfigManagement for FakeAnsible {
    async fn apply(&self, inventory: &Path, playbook: &Path) -> anyhow::Result<RunOutcome> {
        assert!(inventory.exists(), "inventory must be written before hand-off");
        self.runs
            .lock()
            .unwrap()
            .push((inventory.to_owned(), playbook.to_owned()));
        Ok(RunOutcome { code: self.code })
    }
}

fn stack(status: StackStatus) -> Option<StackDescriptor> {
    Some(StackDescriptor {
        name: "k8s-stack".to_owned(),
        status,
        status_reason: None,
        outputs: BTreeMap::new(),
    })
}

fn config(dir: &Path) -> Config {
    let mut config = Config::default_config("k8s-stack").unwrap();
    config.hosts = vec![
        HostSpec {
            name: "k8s-master".to_owned(),
            role: NodeRole::Master,
            floating_ip_output: None,
        },
        HostSpec {
            name: "k8s-worker".to_owned(),
            role: NodeRole::Worker,
            floating_ip_output: None,
        },
    ];
    config.inventory_path = dir.join("k8s-stack").join("inventory.yaml");
    config.stack_timeout = Duration::from_millis(20);
    config.stack_poll_interval = Duration::from_millis(1);
    config.cleanup_timeout = Duration::from_secs(5);
    config.delete_poll_interval = Duration::from_millis(1);
    config.ssh_attempts = 3;
    config.ssh_interval = Duration::from_millis(1);
    config
}

struct Harness {
    cloud: Arc<FakeCloud>,
    remote: Arc<FakeRemote>,
    ansible: Arc<FakeAnsible>,
}

impl Harness {
    fn new(cloud: FakeCloud) -> Self {
        Harness {
            cloud: Arc::new(cloud),
            remote: Arc::new(FakeRemote::default()),
            ansible: Arc::new(FakeAnsible {
                code: Some(0),
                ..Default::default()
            }),
        }
    }

    fn reconciler(&self, config: Config) -> Reconciler {
        Reconciler::new(
            Arc::new(config),
            Collaborators {
                cloud: self.cloud.clone(),
                remote: self.remote.clone(),
                config_management: self.ansible.clone(),
            },
        )
    }
}

#[tokio::test]
async fn missing_stack_is_provisioned_without_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeCloud::new(vec![
        None,
        stack(StackStatus::CreateInProgress),
        stack(StackStatus::CreateComplete),
    ]));

    let report = harness.reconciler(config(dir.path())).run().await.unwrap();

    let calls = harness.cloud.calls();
    assert!(!calls.contains(&"delete".to_owned()));
    assert_eq!(calls, vec!["describe", "create", "describe", "describe"]);
    assert!(report.drained.is_empty());
    assert!(harness.remote.commands().is_empty());

    let master = &report.addresses["k8s-master"];
    assert_eq!(master.internal_ip, Some("172.16.1.64".parse().unwrap()));
    assert_eq!(master.floating_ip, Some("192.168.1.124".parse().unwrap()));
    let worker = &report.addresses["k8s-worker"];
    assert_eq!(worker.internal_ip, Some("172.16.1.70".parse().unwrap()));
    assert_eq!(worker.floating_ip, None);

    // Only hosts with a floating IP are probed
    assert_eq!(
        harness.remote.probes.lock().unwrap().clone(),
        vec!["ubuntu@192.168.1.124"]
    );

    let inventory = std::fs::read_to_string(&report.inventory_path).unwrap();
    assert_eq!(inventory, report.inventory.to_yaml().unwrap());
    assert_eq!(harness.ansible.runs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn create_failed_surfaces_failed_resources() {
    let dir = tempfile::tempdir().unwrap();
    let mut cloud = FakeCloud::new(vec![None, stack(StackStatus::CreateFailed)]);
    cloud.failed_resources = vec![ResourceFailure {
        resource_name: "master-port".to_owned(),
        resource_type: "OS::Neutron::Port".to_owned(),
        status: "CREATE_FAILED".to_owned(),
        status_reason: Some("Conflict: IP address already allocated".to_owned()),
    }];
    let harness = Harness::new(cloud);

    let failure = harness
        .reconciler(config(dir.path()))
        .run()
        .await
        .unwrap_err();

    assert_eq!(failure.phase, Phase::AwaitingConvergence);
    assert!(matches!(failure.error, ReconcileError::PollFailed { .. }));
    assert!(failure.to_string().contains("master-port"));
    assert_eq!(failure.exit_code(), EXIT_CODE_PROVISIONING_FAILED);
    assert_eq!(failure.observed.stack_status, Some(StackStatus::CreateFailed));
    assert!(harness.ansible.runs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn convergence_timeout_reports_recent_events() {
    let dir = tempfile::tempdir().unwrap();
    let mut cloud = FakeCloud::new(vec![None, stack(StackStatus::CreateInProgress)]);
    cloud.events = vec![StackEvent {
        resource_name: "k8s-worker".to_owned(),
        status: "CREATE_IN_PROGRESS".to_owned(),
        status_reason: Some("state changed".to_owned()),
        time: Some("2024-01-01T00:00:05Z".to_owned()),
    }];
    let harness = Harness::new(cloud);

    let failure = harness
        .reconciler(config(dir.path()))
        .run()
        .await
        .unwrap_err();

    assert_eq!(failure.phase, Phase::AwaitingConvergence);
    match &failure.error {
        ReconcileError::PollTimeout {
            last_observed,
            events,
            ..
        } => {
            assert_eq!(last_observed.as_deref(), Some("CREATE_IN_PROGRESS"));
            assert_eq!(events.len(), 1);
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(harness.cloud.calls().contains(&"list_events".to_owned()));
}

#[tokio::test]
async fn existing_stack_is_drained_deleted_and_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness {
        remote: Arc::new(FakeRemote {
            drain_fails: true,
            ..Default::default()
        }),
        ..Harness::new(FakeCloud::new(vec![
            stack(StackStatus::CreateComplete),
            stack(StackStatus::DeleteInProgress),
            None,
            stack(StackStatus::CreateComplete),
        ]))
    };

    let report = harness.reconciler(config(dir.path())).run().await.unwrap();

    assert_eq!(
        harness.cloud.calls(),
        vec!["describe", "delete", "describe", "describe", "create", "describe"]
    );

    let commands = harness.remote.commands();
    let node_deletes = commands
        .iter()
        .filter(|c| c.starts_with("kubectl delete node 'k8s-worker'"))
        .count();
    assert_eq!(node_deletes, 1);
    assert!(commands
        .iter()
        .any(|c| c.starts_with("kubectl delete pod 'web-1' -n 'default'")));
    // The master is never drained
    assert!(!commands.iter().any(|c| c.contains("'k8s-master'")));

    assert_eq!(report.drained.len(), 1);
    let drained = &report.drained[0];
    assert_eq!(drained.node, "k8s-worker");
    assert!(drained.removed);
    assert!(drained.drain_warning.is_some());
    assert_eq!(drained.forcibly_deleted_pods.len(), 1);
}

#[tokio::test]
async fn failed_node_removal_keeps_the_existing_stack() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness {
        remote: Arc::new(FakeRemote {
            delete_node_fails: true,
            ..Default::default()
        }),
        ..Harness::new(FakeCloud::new(vec![stack(StackStatus::CreateComplete)]))
    };

    let failure = harness
        .reconciler(config(dir.path()))
        .run()
        .await
        .unwrap_err();

    assert_eq!(failure.phase, Phase::CleanupExisting);
    assert!(matches!(failure.error, ReconcileError::NodeRemoval(_)));
    assert_eq!(failure.exit_code(), EXIT_CODE_PROVISIONING_FAILED);
    let calls = harness.cloud.calls();
    assert!(!calls.contains(&"delete".to_owned()));
    assert!(!calls.contains(&"create".to_owned()));
    assert!(harness
        .remote
        .commands()
        .iter()
        .any(|c| c.starts_with("kubectl delete node 'k8s-worker'")));
}

#[tokio::test]
async fn unreachable_existing_master_skips_drain() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness {
        remote: Arc::new(FakeRemote {
            down_for_probes: 1,
            ..Default::default()
        }),
        ..Harness::new(FakeCloud::new(vec![
            stack(StackStatus::CreateComplete),
            None,
            stack(StackStatus::CreateComplete),
        ]))
    };

    let report = harness.reconciler(config(dir.path())).run().await.unwrap();

    assert_eq!(
        harness.cloud.calls(),
        vec!["describe", "delete", "describe", "create", "describe"]
    );
    assert!(harness.remote.commands().is_empty());
    assert!(report.drained.is_empty());
}

#[tokio::test]
async fn terminal_failure_status_is_reported_as_observed() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeCloud::new(vec![None, stack(StackStatus::UpdateFailed)]));

    let failure = harness
        .reconciler(config(dir.path()))
        .run()
        .await
        .unwrap_err();

    assert_eq!(failure.phase, Phase::AwaitingConvergence);
    match &failure.error {
        ReconcileError::PollFailed { cause, .. } => assert_eq!(cause, "UPDATE_FAILED"),
        other => panic!("expected PollFailed, got {:?}", other),
    }
    assert_eq!(failure.observed.stack_status, Some(StackStatus::UpdateFailed));
}

#[tokio::test]
async fn addresses_of_a_deleted_stack_are_not_reported() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeCloud::new(vec![
        stack(StackStatus::CreateComplete),
        None,
        stack(StackStatus::CreateFailed),
    ]));

    let failure = harness
        .reconciler(config(dir.path()))
        .run()
        .await
        .unwrap_err();

    assert_eq!(failure.phase, Phase::AwaitingConvergence);
    // The old master was resolved for the drain
    assert!(harness.remote.commands().iter().any(|c| c.starts_with("kubectl")));
    assert!(failure.observed.addresses.is_empty());
}

#[tokio::test]
async fn skip_drain_deletes_without_touching_the_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeCloud::new(vec![
        stack(StackStatus::CreateComplete),
        None,
        stack(StackStatus::CreateComplete),
    ]));
    let mut config = config(dir.path());
    config.drain_nodes = false;

    let report = harness.reconciler(config).run().await.unwrap();

    assert!(report.drained.is_empty());
    assert!(harness.remote.commands().is_empty());
    assert!(harness.cloud.calls().contains(&"delete".to_owned()));
}

#[tokio::test]
async fn failed_deletion_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeCloud::new(vec![
        stack(StackStatus::CreateFailed),
        stack(StackStatus::DeleteFailed),
    ]));

    let failure = harness
        .reconciler(config(dir.path()))
        .run()
        .await
        .unwrap_err();

    assert_eq!(failure.phase, Phase::CleanupExisting);
    assert!(matches!(failure.error, ReconcileError::PollFailed { .. }));
    assert_eq!(failure.observed.stack_status, Some(StackStatus::DeleteFailed));
    assert!(!harness.cloud.calls().contains(&"create".to_owned()));
    // A stack that never completed has no cluster to drain
    assert!(harness.remote.commands().is_empty());
}

#[tokio::test]
async fn configuration_failure_leaves_infrastructure_intact() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness {
        ansible: Arc::new(FakeAnsible {
            code: Some(2),
            ..Default::default()
        }),
        ..Harness::new(FakeCloud::new(vec![None, stack(StackStatus::CreateComplete)]))
    };
    let config = config(dir.path());

    let failure = harness
        .reconciler(config.clone())
        .run()
        .await
        .unwrap_err();

    assert_eq!(failure.phase, Phase::Handoff);
    assert_eq!(failure.exit_code(), EXIT_CODE_CONFIGURATION_FAILED);
    assert!(failure.error.infrastructure_intact());
    assert!(config.inventory_path.exists());
    let calls = harness.cloud.calls();
    assert_eq!(calls.iter().filter(|c| *c == "delete").count(), 0);

    let steps = failure.remediation(&config);
    assert!(steps.iter().any(|s| s.contains("ansible-playbook -i")));
}

#[tokio::test]
async fn unreachable_host_fails_after_configured_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness {
        remote: Arc::new(FakeRemote {
            unreachable: true,
            ..Default::default()
        }),
        ..Harness::new(FakeCloud::new(vec![None, stack(StackStatus::CreateComplete)]))
    };
    let config = config(dir.path());

    let failure = harness
        .reconciler(config.clone())
        .run()
        .await
        .unwrap_err();

    assert_eq!(failure.phase, Phase::AwaitingReachability);
    assert!(matches!(
        failure.error,
        ReconcileError::PollTimeout { attempts: 3, .. }
    ));
    assert_eq!(harness.remote.probes.lock().unwrap().len(), 3);
    assert!(failure
        .remediation(&config)
        .iter()
        .any(|s| s == "Check SSH access: ssh ubuntu@192.168.1.124 true"));
    assert!(!config.inventory_path.exists());
}

#[tokio::test]
async fn missing_instance_address_fails_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let mut cloud = FakeCloud::new(vec![None, stack(StackStatus::CreateComplete)]);
    cloud.addresses.remove("k8s-worker");
    let harness = Harness::new(cloud);

    let failure = harness
        .reconciler(config(dir.path()))
        .run()
        .await
        .unwrap_err();

    assert_eq!(failure.phase, Phase::ResolvingAddresses);
    match failure.error {
        ReconcileError::AddressNotFound { instance } => assert_eq!(instance, "k8s-worker"),
        other => panic!("expected AddressNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn stack_output_overrides_floating_ip() {
    let dir = tempfile::tempdir().unwrap();
    let mut converged = stack(StackStatus::CreateComplete);
    if let Some(stack) = converged.as_mut() {
        stack
            .outputs
            .insert("worker_floating_ip".to_owned(), "192.168.1.130".to_owned());
    }
    let harness = Harness::new(FakeCloud::new(vec![None, converged]));
    let mut config = config(dir.path());
    config.hosts[1].floating_ip_output = Some("worker_floating_ip".to_owned());

    let report = harness.reconciler(config).run().await.unwrap();

    let worker = &report.addresses["k8s-worker"];
    assert_eq!(worker.floating_ip, Some("192.168.1.130".parse().unwrap()));
    assert_eq!(
        report.outputs.get("worker_floating_ip").map(String::as_str),
        Some("192.168.1.130")
    );
    assert_eq!(harness.remote.probes.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn cancelled_run_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeCloud::new(vec![None]));
    let reconciler = harness.reconciler(config(dir.path()));
    reconciler.cancellation_token().cancel();

    let failure = reconciler.run().await.unwrap_err();

    assert_eq!(failure.phase, Phase::Start);
    assert!(matches!(failure.error, ReconcileError::Cancelled));
    assert_eq!(failure.exit_code(), EXIT_CODE_CANCELLED);
    assert!(harness.cloud.calls().is_empty());
}

#[tokio::test]
async fn passed_deadline_stops_before_the_next_phase() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeCloud::new(vec![None]));
    let mut config = config(dir.path());
    config.deadline = Some(Duration::from_secs(0));

    let failure = harness.reconciler(config).run().await.unwrap_err();

    assert_eq!(failure.phase, Phase::Start);
    assert!(matches!(failure.error, ReconcileError::DeadlineExceeded(_)));
    assert!(harness.cloud.calls().is_empty());
}

#[tokio::test]
async fn unrepresentable_deadline_does_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeCloud::new(vec![None, stack(StackStatus::CreateComplete)]));
    let mut config = config(dir.path());
    config.deadline = Some(Duration::from_secs(u64::MAX));

    let report = harness.reconciler(config).run().await.unwrap();

    assert_eq!(report.stack_name, "k8s-stack");
}
