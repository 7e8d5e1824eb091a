//! Collaborators for the `provisioner` crate that shell out to the
//! `openstack`, `ssh` and `ansible-playbook` command line tools.
//!
//! Every process is awaited through `tokio::process`; nothing here retries or
//! interprets statuses beyond decoding the tools' output.

#![deny(missing_docs)]

mod ansible;
mod command;
mod openstack;
mod ssh;

pub use ansible::AnsiblePlaybook;
pub use openstack::OpenStackCli;
pub use ssh::SshExecutor;
