//! Configuration for a reconciliation run
//!
//! The best way to configure a run is by using [`Config::default_config`]
//! or by turning on the "cli" feature and using [`Config::new_from_flags`].
//! The config is built once at process start and passed to the
//! [`Reconciler`](crate::Reconciler); nothing reads the environment after that.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

use crate::inventory::NodeRole;

const DEFAULT_STACK_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_STACK_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_CLEANUP_TIMEOUT_SECS: u64 = 600;
const DEFAULT_DELETE_POLL_INTERVAL_SECS: u64 = 3;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 120;
const DEFAULT_SSH_ATTEMPTS: u32 = 30;
const DEFAULT_SSH_INTERVAL_SECS: u64 = 10;
const DEFAULT_SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SSH_USER: &str = "ubuntu";
const DEFAULT_TEMPLATE: &str = "k8s-stack.yaml";
const DEFAULT_PLAYBOOK: &str = "site.yml";
const DEFAULT_MASTER: &str = "k8s-master";

/// A host the stack is expected to create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostSpec {
    /// Instance name; also the node name in the cluster and the inventory alias
    pub name: String,
    /// The role the host plays
    pub role: NodeRole,
    /// Stack output holding this host's floating IP, when the template
    /// surfaces it there instead of on the instance
    pub floating_ip_output: Option<String>,
}

/// The configuration needed for a reconciliation run.
///
/// This can be configured manually in your code or if you are exposing a CLI, use
/// [`Config::new_from_flags`] (this requires the "cli" feature to be enabled).
#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the stack to reconcile
    pub stack_name: String,
    /// Heat template the stack is created from
    pub template: PathBuf,
    /// Template parameters
    pub parameters: BTreeMap<String, String>,
    /// Every host the stack creates, masters first
    pub hosts: Vec<HostSpec>,
    /// SSH user on master hosts
    pub master_user: String,
    /// SSH user on worker hosts
    pub worker_user: String,
    /// Private key used for SSH and Ansible
    pub ssh_key: Option<PathBuf>,
    /// Playbook handed to configuration management
    pub playbook: PathBuf,
    /// Where the generated inventory is written
    pub inventory_path: PathBuf,
    /// Variables applied to every inventory host
    pub inventory_vars: BTreeMap<String, String>,
    /// How long a stack may take to reach CREATE_COMPLETE
    pub stack_timeout: Duration,
    /// Wait between stack status checks while the stack is created
    pub stack_poll_interval: Duration,
    /// How long an existing stack may take to disappear once deleted
    pub cleanup_timeout: Duration,
    /// Wait between checks while an existing stack is deleted
    pub delete_poll_interval: Duration,
    /// Cooperative drain timeout per node
    pub drain_timeout: Duration,
    /// Whether to drain workers of an existing cluster before deleting its stack
    pub drain_nodes: bool,
    /// SSH reachability attempts per host
    pub ssh_attempts: u32,
    /// Wait between SSH reachability attempts
    pub ssh_interval: Duration,
    /// Connect timeout of a single SSH attempt
    pub ssh_connect_timeout: Duration,
    /// Optional ceiling on the whole run
    pub deadline: Option<Duration>,
    /// Skip the interactive confirmation
    pub assume_yes: bool,
    /// Cloud to select from `clouds.yaml`; the `OS_*` environment is used when unset
    pub os_cloud: Option<String>,
}

impl Config {
    /// Returns a Config object for `stack_name` with all of the defaults set.
    pub fn default_config(stack_name: &str) -> anyhow::Result<Self> {
        Ok(Config {
            stack_name: stack_name.to_owned(),
            template: PathBuf::from(DEFAULT_TEMPLATE),
            parameters: BTreeMap::new(),
            hosts: vec![HostSpec {
                name: DEFAULT_MASTER.to_owned(),
                role: NodeRole::Master,
                floating_ip_output: None,
            }],
            master_user: DEFAULT_SSH_USER.to_owned(),
            worker_user: DEFAULT_SSH_USER.to_owned(),
            ssh_key: None,
            playbook: PathBuf::from(DEFAULT_PLAYBOOK),
            inventory_path: default_inventory_path(stack_name)?,
            inventory_vars: BTreeMap::new(),
            stack_timeout: Duration::from_secs(DEFAULT_STACK_TIMEOUT_SECS),
            stack_poll_interval: Duration::from_secs(DEFAULT_STACK_POLL_INTERVAL_SECS),
            cleanup_timeout: Duration::from_secs(DEFAULT_CLEANUP_TIMEOUT_SECS),
            delete_poll_interval: Duration::from_secs(DEFAULT_DELETE_POLL_INTERVAL_SECS),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            drain_nodes: true,
            ssh_attempts: DEFAULT_SSH_ATTEMPTS,
            ssh_interval: Duration::from_secs(DEFAULT_SSH_INTERVAL_SECS),
            ssh_connect_timeout: Duration::from_secs(DEFAULT_SSH_CONNECT_TIMEOUT_SECS),
            deadline: None,
            assume_yes: false,
            os_cloud: None,
        })
    }

    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(version: &str) -> anyhow::Result<Self> {
        let app = Opts::clap().version(version);
        let mut opts = Opts::from_clap(&app.get_matches());
        // Bare switches cannot carry an `env` fallback in clap 2.
        opts.skip_drain |= parse_switch(
            "STACKUP_SKIP_DRAIN",
            std::env::var("STACKUP_SKIP_DRAIN").ok().as_deref(),
        )?;
        opts.yes |= parse_switch("STACKUP_YES", std::env::var("STACKUP_YES").ok().as_deref())?;
        Self::from_opts(opts)
    }

    #[cfg(any(feature = "cli", feature = "docs"))]
    fn from_opts(opts: Opts) -> anyhow::Result<Self> {
        let floating_ip_outputs = key_values("--floating-ip-output", &opts.floating_ip_outputs)?;

        let hosts = opts
            .masters
            .iter()
            .map(|name| (name, NodeRole::Master))
            .chain(opts.workers.iter().map(|name| (name, NodeRole::Worker)))
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, role)| HostSpec {
                name: name.clone(),
                role,
                floating_ip_output: floating_ip_outputs.get(name).cloned(),
            })
            .collect();

        let inventory_path = match opts.inventory {
            Some(path) => path,
            None => default_inventory_path(&opts.stack_name)?,
        };

        let config = Config {
            parameters: key_values("--parameter", &opts.parameters)?,
            inventory_vars: key_values("--inventory-var", &opts.inventory_vars)?,
            stack_name: opts.stack_name,
            template: opts.template,
            hosts,
            master_user: opts.master_user,
            worker_user: opts.worker_user,
            ssh_key: opts.ssh_key,
            playbook: opts.playbook,
            inventory_path,
            stack_timeout: Duration::from_secs(opts.stack_timeout),
            stack_poll_interval: Duration::from_secs(DEFAULT_STACK_POLL_INTERVAL_SECS),
            cleanup_timeout: Duration::from_secs(opts.cleanup_timeout),
            delete_poll_interval: Duration::from_secs(DEFAULT_DELETE_POLL_INTERVAL_SECS),
            drain_timeout: Duration::from_secs(opts.drain_timeout),
            drain_nodes: !opts.skip_drain,
            ssh_attempts: opts.ssh_attempts,
            ssh_interval: Duration::from_secs(opts.ssh_interval),
            ssh_connect_timeout: Duration::from_secs(opts.ssh_connect_timeout),
            deadline: opts.deadline.map(Duration::from_secs),
            assume_yes: opts.yes,
            os_cloud: opts.os_cloud.filter(|c| !c.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants a run relies on.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stack_name.is_empty() {
            anyhow::bail!("stack name must not be empty");
        }
        if !self.hosts.iter().any(|h| h.role == NodeRole::Master) {
            anyhow::bail!("at least one master host is required");
        }
        let mut seen = std::collections::BTreeSet::new();
        for host in &self.hosts {
            if !seen.insert(host.name.as_str()) {
                anyhow::bail!("host {} is listed more than once", host.name);
            }
        }
        if self.ssh_attempts == 0 {
            anyhow::bail!("ssh attempts must be at least 1");
        }
        if let Some(deadline) = self.deadline {
            if std::time::Instant::now().checked_add(deadline).is_none() {
                anyhow::bail!("deadline of {}s is out of range", deadline.as_secs());
            }
        }
        Ok(())
    }

    /// Hosts with the master role, in configuration order.
    pub fn masters(&self) -> impl Iterator<Item = &HostSpec> {
        self.hosts.iter().filter(|h| h.role == NodeRole::Master)
    }

    /// Hosts with the worker role, in configuration order.
    pub fn workers(&self) -> impl Iterator<Item = &HostSpec> {
        self.hosts.iter().filter(|h| h.role == NodeRole::Worker)
    }

    /// Whether `name` is a configured master.
    pub fn is_master(&self, name: &str) -> bool {
        self.masters().any(|h| h.name == name)
    }

    /// The SSH user for a role.
    pub fn ssh_user(&self, role: NodeRole) -> &str {
        match role {
            NodeRole::Master => &self.master_user,
            NodeRole::Worker => &self.worker_user,
        }
    }

    /// The SSH user for a host name; unknown hosts get the worker user.
    pub fn ssh_user_for(&self, name: &str) -> &str {
        if self.is_master(name) {
            &self.master_user
        } else {
            &self.worker_user
        }
    }
}

/// CLI options that can be configured for a run
///
/// These can be parsed from args using `Opts::from_args()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "stackup",
    about = "Provisions a Kubernetes cluster on an OpenStack Heat stack"
)]
pub struct Opts {
    #[structopt(
        short = "s",
        long = "stack-name",
        default_value = "k8s-stack",
        env = "STACKUP_STACK_NAME",
        help = "The name of the Heat stack to reconcile"
    )]
    stack_name: String,

    #[structopt(
        short = "t",
        long = "template",
        default_value = "k8s-stack.yaml",
        env = "STACKUP_TEMPLATE",
        help = "The Heat template the stack is created from"
    )]
    template: PathBuf,

    #[structopt(
        short = "P",
        long = "parameter",
        env = "STACKUP_PARAMETERS",
        value_delimiter = ";",
        help = "A template parameter as key=value; repeat the flag for more. Values may contain ','. The environment form separates pairs with ';'"
    )]
    parameters: Vec<String>,

    #[structopt(
        long = "master",
        default_value = "k8s-master",
        env = "STACKUP_MASTERS",
        use_delimiter = true,
        help = "Instance names of the master hosts, separated by ','"
    )]
    masters: Vec<String>,

    #[structopt(
        long = "worker",
        env = "STACKUP_WORKERS",
        use_delimiter = true,
        help = "Instance names of the worker hosts, separated by ','"
    )]
    workers: Vec<String>,

    #[structopt(
        long = "floating-ip-output",
        env = "STACKUP_FLOATING_IP_OUTPUTS",
        value_delimiter = ";",
        help = "A host=output pair naming the stack output that holds a host's floating IP. The environment form separates pairs with ';'"
    )]
    floating_ip_outputs: Vec<String>,

    #[structopt(
        long = "master-user",
        default_value = "ubuntu",
        env = "STACKUP_MASTER_USER",
        help = "The SSH user on master hosts"
    )]
    master_user: String,

    #[structopt(
        long = "worker-user",
        default_value = "ubuntu",
        env = "STACKUP_WORKER_USER",
        help = "The SSH user on worker hosts"
    )]
    worker_user: String,

    #[structopt(
        short = "i",
        long = "ssh-key",
        env = "STACKUP_SSH_KEY",
        help = "The private key used for SSH and Ansible"
    )]
    ssh_key: Option<PathBuf>,

    #[structopt(
        long = "playbook",
        default_value = "site.yml",
        env = "STACKUP_PLAYBOOK",
        help = "The Ansible playbook to run once the hosts are reachable"
    )]
    playbook: PathBuf,

    #[structopt(
        long = "inventory",
        env = "STACKUP_INVENTORY",
        help = "Where to write the generated inventory. Defaults to $HOME/.stackup/<stack-name>/inventory.yaml"
    )]
    inventory: Option<PathBuf>,

    #[structopt(
        long = "inventory-var",
        env = "STACKUP_INVENTORY_VARS",
        value_delimiter = ";",
        help = "A variable applied to every inventory host as key=value; repeat the flag for more. The environment form separates pairs with ';'"
    )]
    inventory_vars: Vec<String>,

    #[structopt(
        long = "stack-timeout",
        default_value = "1800",
        env = "STACKUP_STACK_TIMEOUT",
        help = "Seconds the stack may take to reach CREATE_COMPLETE"
    )]
    stack_timeout: u64,

    #[structopt(
        long = "cleanup-timeout",
        default_value = "600",
        env = "STACKUP_CLEANUP_TIMEOUT",
        help = "Seconds an existing stack may take to disappear once deleted"
    )]
    cleanup_timeout: u64,

    #[structopt(
        long = "drain-timeout",
        default_value = "120",
        env = "STACKUP_DRAIN_TIMEOUT",
        help = "Seconds allowed for the cooperative drain of each worker"
    )]
    drain_timeout: u64,

    #[structopt(
        long = "skip-drain",
        help = "Delete an existing stack without draining its workers first [env: STACKUP_SKIP_DRAIN]"
    )]
    skip_drain: bool,

    #[structopt(
        long = "ssh-attempts",
        default_value = "30",
        env = "STACKUP_SSH_ATTEMPTS",
        help = "SSH reachability attempts per host"
    )]
    ssh_attempts: u32,

    #[structopt(
        long = "ssh-interval",
        default_value = "10",
        env = "STACKUP_SSH_INTERVAL",
        help = "Seconds between SSH reachability attempts"
    )]
    ssh_interval: u64,

    #[structopt(
        long = "ssh-connect-timeout",
        default_value = "10",
        env = "STACKUP_SSH_CONNECT_TIMEOUT",
        help = "Connect timeout in seconds of a single SSH attempt"
    )]
    ssh_connect_timeout: u64,

    #[structopt(
        long = "deadline",
        env = "STACKUP_DEADLINE",
        help = "Give up after this many seconds for the whole run"
    )]
    deadline: Option<u64>,

    #[structopt(
        short = "y",
        long = "yes",
        help = "Do not ask for confirmation before deleting and recreating the stack [env: STACKUP_YES]"
    )]
    yes: bool,

    #[structopt(
        long = "os-cloud",
        env = "STACKUP_OS_CLOUD",
        help = "The cloud to use from clouds.yaml. Defaults to the OS_* environment variables"
    )]
    os_cloud: Option<String>,
}

fn default_inventory_path(stack_name: &str) -> anyhow::Result<PathBuf> {
    Ok(dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Unable to get home directory"))?
        .join(".stackup")
        .join(stack_name)
        .join("inventory.yaml"))
}

#[cfg(any(feature = "cli", feature = "docs", test))]
fn split_key_value(in_string: &str) -> Option<(String, String)> {
    let (key, value) = in_string.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_owned(), value.trim().to_owned()))
}

#[cfg(any(feature = "cli", feature = "docs", test))]
fn key_values(flag: &str, entries: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    entries
        .iter()
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            split_key_value(entry).ok_or_else(|| {
                anyhow::anyhow!("{} expects key=value, got {:?}", flag, entry)
            })
        })
        .collect()
}

#[cfg(any(feature = "cli", feature = "docs", test))]
fn parse_switch(name: &str, value: Option<&str>) -> anyhow::Result<bool> {
    match value.map(|v| v.trim().to_lowercase()).as_deref() {
        None | Some("") => Ok(false),
        Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some(other) => anyhow::bail!("{} must be true or false, got {:?}", name, other),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_value_pairs_split_on_first_equals() {
        assert_eq!(
            split_key_value("image=ubuntu=22.04"),
            Some(("image".to_owned(), "ubuntu=22.04".to_owned()))
        );
        assert_eq!(
            split_key_value("empty="),
            Some(("empty".to_owned(), String::new()))
        );
        assert_eq!(split_key_value("flag"), None);
        assert_eq!(split_key_value("=value"), None);
        assert_eq!(split_key_value(""), None);
    }

    #[test]
    fn key_values_reject_entries_without_a_key() {
        let ok = key_values(
            "--parameter",
            &["dns_nameservers=8.8.8.8,8.8.4.4".to_owned(), "flavor=m1.large".to_owned()],
        )
        .unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok["dns_nameservers"], "8.8.8.8,8.8.4.4");

        let err = key_values("--parameter", &["flavor".to_owned()]).unwrap_err();
        assert!(err.to_string().contains("--parameter expects key=value"));
        assert!(key_values("--inventory-var", &["=x".to_owned()]).is_err());
    }

    #[test]
    fn switches_parse_common_spellings() {
        assert!(!parse_switch("STACKUP_YES", None).unwrap());
        assert!(!parse_switch("STACKUP_YES", Some("")).unwrap());
        assert!(parse_switch("STACKUP_YES", Some("TRUE")).unwrap());
        assert!(parse_switch("STACKUP_YES", Some("1")).unwrap());
        assert!(!parse_switch("STACKUP_YES", Some("off")).unwrap());
        assert!(parse_switch("STACKUP_YES", Some("maybe")).is_err());
    }

    #[test]
    fn out_of_range_deadline_is_rejected() {
        let mut config = Config::default_config("k8s-stack").unwrap();
        config.deadline = Some(Duration::from_secs(u64::MAX));
        assert!(config.validate().is_err());
        config.deadline = Some(Duration::from_secs(3600));
        config.validate().unwrap();
    }

    #[test]
    fn default_config_is_valid() {
        let config = Config::default_config("k8s-stack").unwrap();
        config.validate().unwrap();
        assert!(config.inventory_path.ends_with(".stackup/k8s-stack/inventory.yaml"));
        assert_eq!(config.masters().count(), 1);
        assert_eq!(config.workers().count(), 0);
    }

    #[test]
    fn config_without_master_is_rejected() {
        let mut config = Config::default_config("k8s-stack").unwrap();
        config.hosts = vec![HostSpec {
            name: "k8s-worker".to_owned(),
            role: NodeRole::Worker,
            floating_ip_output: None,
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_hosts_are_rejected() {
        let mut config = Config::default_config("k8s-stack").unwrap();
        config.hosts.push(HostSpec {
            name: "k8s-master".to_owned(),
            role: NodeRole::Worker,
            floating_ip_output: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn ssh_user_follows_role() {
        let mut config = Config::default_config("k8s-stack").unwrap();
        config.worker_user = "debian".to_owned();
        config.hosts.push(HostSpec {
            name: "k8s-worker".to_owned(),
            role: NodeRole::Worker,
            floating_ip_output: None,
        });
        assert_eq!(config.ssh_user(NodeRole::Master), "ubuntu");
        assert_eq!(config.ssh_user_for("k8s-worker"), "debian");
        assert_eq!(config.ssh_user_for("k8s-master"), "ubuntu");
    }

    #[cfg(feature = "cli")]
    #[test]
    fn flags_build_a_config() {
        let opts = Opts::from_iter(vec![
            "stackup",
            "--stack-name",
            "lab",
            "--worker",
            "w1,w2",
            "--parameter",
            "key_name=ops",
            "--parameter",
            "flavor=m1.large",
            "--floating-ip-output",
            "w1=worker_floating_ip",
            "--parameter",
            "dns_nameservers=8.8.8.8,8.8.4.4",
            "--skip-drain",
            "--os-cloud",
            "lab-cloud",
            "--inventory",
            "/tmp/lab/inventory.yaml",
        ]);
        let config = Config::from_opts(opts).unwrap();
        assert_eq!(config.stack_name, "lab");
        let names: Vec<_> = config.hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["k8s-master", "w1", "w2"]);
        assert_eq!(
            config.hosts[1].floating_ip_output.as_deref(),
            Some("worker_floating_ip")
        );
        assert_eq!(config.parameters.get("flavor").map(String::as_str), Some("m1.large"));
        assert_eq!(config.parameters.len(), 3);
        assert_eq!(
            config.parameters.get("dns_nameservers").map(String::as_str),
            Some("8.8.8.8,8.8.4.4")
        );
        assert_eq!(config.os_cloud.as_deref(), Some("lab-cloud"));
        assert!(!config.drain_nodes);
        assert_eq!(config.inventory_path, PathBuf::from("/tmp/lab/inventory.yaml"));
    }

    #[cfg(feature = "cli")]
    #[test]
    fn bare_parameter_is_rejected() {
        let opts = Opts::from_iter(vec!["stackup", "--parameter", "flavor"]);
        assert!(Config::from_opts(opts).is_err());
    }
}
