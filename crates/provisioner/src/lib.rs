//! A crate for reconciling a Kubernetes cluster running on an OpenStack
//! [Heat](https://docs.openstack.org/heat/latest/) stack.
//!
//! The crate provides the collaborator traits ([`CloudStackClient`],
//! [`RemoteExecutor`], [`ConfigManagement`]) for declaring the outside world
//! as well as the [`Reconciler`] type which drives a stack from whatever
//! state it is in to a freshly provisioned, reachable and configured cluster.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use provisioner::{config::Config, Collaborators, Reconciler};
//! # fn collaborators() -> Collaborators { todo!() }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default_config("k8s-stack").unwrap();
//!     let reconciler = Reconciler::new(Arc::new(config), collaborators());
//!
//!     match reconciler.run().await {
//!         Ok(report) => println!("inventory written to {}", report.inventory_path.display()),
//!         Err(failure) => eprintln!("{}", failure),
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

pub mod address;
pub mod backoff;
pub mod config;
pub mod config_management;
pub mod drain;
pub mod error;
pub mod inventory;
pub mod poll;
pub mod reconcile;
pub mod remote;
pub mod stack;

#[doc(inline)]
pub use address::{AddressResolver, InstanceAddress};
#[doc(inline)]
pub use config_management::ConfigManagement;
#[doc(inline)]
pub use drain::{ControlPlane, DrainResult, NodeDrainer};
#[doc(inline)]
pub use error::{Failure, ReconcileError};
#[doc(inline)]
pub use inventory::{HostInventory, InventoryBuilder, NodeRole};
#[doc(inline)]
pub use poll::{ReadinessPoller, RetryPolicy};
#[doc(inline)]
pub use reconcile::{Collaborators, Phase, ReconcileReport, Reconciler};
#[doc(inline)]
pub use remote::RemoteExecutor;
#[doc(inline)]
pub use stack::{CloudStackClient, StackDescriptor, StackStatus};
