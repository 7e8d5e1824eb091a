use std::sync::Arc;

use openstack_provider::{AnsiblePlaybook, OpenStackCli, SshExecutor};
use provisioner::config::Config;
use provisioner::error::{EXIT_CODE_CANCELLED, EXIT_CODE_INVALID_CONFIG, EXIT_CODE_SUCCESS};
use provisioner::{Collaborators, ReconcileReport, Reconciler};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = match Config::new_from_flags(env!("CARGO_PKG_VERSION")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {:#}", e);
            std::process::exit(EXIT_CODE_INVALID_CONFIG);
        }
    };

    if !config.assume_yes {
        match confirm(&config).await {
            Ok(true) => {}
            Ok(false) => {
                eprintln!("Aborted, nothing was changed");
                std::process::exit(EXIT_CODE_CANCELLED);
            }
            Err(e) => {
                eprintln!("Unable to read confirmation ({}); pass --yes to run unattended", e);
                std::process::exit(EXIT_CODE_CANCELLED);
            }
        }
    }

    // Ctrl-C stops the run at the next phase boundary or poll wait. A provider
    // call already in flight is allowed to finish.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next safe point");
            on_signal.cancel();
        }
    });

    let mut cloud = OpenStackCli::new();
    if let Some(name) = &config.os_cloud {
        cloud = cloud.with_cloud(name.clone());
    }
    let collaborators = Collaborators {
        cloud: Arc::new(cloud),
        remote: Arc::new(
            SshExecutor::new(config.ssh_connect_timeout).with_key(config.ssh_key.clone()),
        ),
        config_management: Arc::new(AnsiblePlaybook::new()),
    };
    let config = Arc::new(config);
    let reconciler = Reconciler::new(config.clone(), collaborators).with_cancellation(cancel);

    match reconciler.run().await {
        Ok(report) => {
            print_summary(&report);
            std::process::exit(EXIT_CODE_SUCCESS);
        }
        Err(failure) => {
            error!(phase = %failure.phase, code = failure.exit_code(), "Run failed");
            eprintln!("{}", failure);
            eprintln!("Next steps:");
            for step in failure.remediation(&config) {
                eprintln!("  - {}", step);
            }
            std::process::exit(failure.exit_code());
        }
    }
}

async fn confirm(config: &Config) -> anyhow::Result<bool> {
    eprint!(
        "Stack {} will be deleted if it exists and recreated from {}. Continue? [y/N] ",
        config.stack_name,
        config.template.display()
    );
    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn print_summary(report: &ReconcileReport) {
    println!("Stack {} is up", report.stack_name);
    for result in report.drained.iter().filter(|r| r.removed) {
        println!(
            "  removed node {} from the previous cluster ({} pods force-deleted)",
            result.node,
            result.forcibly_deleted_pods.len()
        );
    }
    for address in report.addresses.values() {
        println!("  {}", address);
    }
    println!("Inventory: {}", report.inventory_path.display());
}
