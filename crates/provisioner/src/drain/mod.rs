//! `drain` removes a node from a live cluster before the instance backing it is
//! destroyed.
//!
//! The cooperative drain is a courtesy to running workloads and may fail; the
//! node object deletion and the forced cleanup of the pods left behind are what
//! must succeed, because pods bound to a node object that no longer exists can
//! never be rescheduled.
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

mod kubectl;

pub use kubectl::KubectlControlPlane;

/// A pod identified by namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PodRef {
    /// The pod namespace
    pub namespace: String,
    /// The pod name
    pub name: String,
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Operations against the cluster control plane needed to remove a node.
///
/// **Note**: this trait is defined using [async-trait](https://crates.io/crates/async-trait).
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Whether the cluster has a node object with this name.
    async fn node_exists(&self, node: &str) -> anyhow::Result<bool>;
    /// Every pod currently scheduled on the node.
    async fn pods_on_node(&self, node: &str) -> anyhow::Result<Vec<PodRef>>;
    /// Cordon the node and evict its pods, ignoring DaemonSet-managed ones,
    /// giving up after `timeout`.
    async fn drain(&self, node: &str, timeout: Duration) -> anyhow::Result<()>;
    /// Delete the node object.
    async fn delete_node(&self, node: &str) -> anyhow::Result<()>;
    /// Whether the pod still exists.
    async fn pod_exists(&self, pod: &PodRef) -> anyhow::Result<bool>;
    /// Delete the pod with a zero grace period.
    async fn force_delete_pod(&self, pod: &PodRef) -> anyhow::Result<()>;
}

/// What happened to a node during [`NodeDrainer::drain`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainResult {
    /// The node that was processed
    pub node: String,
    /// `false` when the node was not part of the cluster and nothing was done
    pub removed: bool,
    /// Pods that had to be force-deleted after the node object was gone
    pub forcibly_deleted_pods: Vec<PodRef>,
    /// Set when the cooperative drain failed but removal went ahead
    pub drain_warning: Option<String>,
}

/// Errors that stop a node removal.
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    /// Could not tell whether the node is part of the cluster.
    #[error("unable to look up node {node}: {source}")]
    Lookup {
        /// The node name
        node: String,
        /// Underlying error
        source: anyhow::Error,
    },
    /// The node object could not be deleted.
    #[error("unable to delete node {node} from the control plane: {source}")]
    NodeRemoval {
        /// The node name
        node: String,
        /// Underlying error
        source: anyhow::Error,
    },
    /// A pod left on the deleted node could not be cleaned up.
    #[error("unable to force-delete pod {pod} of removed node {node}: {source}")]
    PodCleanup {
        /// The node name
        node: String,
        /// The pod that could not be deleted
        pod: PodRef,
        /// Underlying error
        source: anyhow::Error,
    },
}

/// Removes nodes from a cluster through a [`ControlPlane`].
pub struct NodeDrainer<C> {
    control_plane: C,
}

impl<C: ControlPlane> NodeDrainer<C> {
    /// Create a drainer talking to the given control plane.
    pub fn new(control_plane: C) -> Self {
        NodeDrainer { control_plane }
    }

    /// Drain and remove `node`.
    ///
    /// A node that is not part of the cluster is left alone and reported with
    /// `removed == false`.
    pub async fn drain(&self, node: &str, timeout: Duration) -> Result<DrainResult, DrainError> {
        let exists = self
            .control_plane
            .node_exists(node)
            .await
            .map_err(|source| DrainError::Lookup {
                node: node.to_owned(),
                source,
            })?;
        if !exists {
            debug!(node, "Node is not part of the cluster, nothing to drain");
            return Ok(DrainResult {
                node: node.to_owned(),
                ..Default::default()
            });
        }

        let snapshot = match self.control_plane.pods_on_node(node).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(node, error = %e, "Unable to list pods on node, continuing without a snapshot");
                Vec::new()
            }
        };
        info!(node, pods = snapshot.len(), "Draining node");

        let drain_warning = match self.control_plane.drain(node, timeout).await {
            Ok(()) => None,
            Err(e) => {
                warn!(node, error = %e, "Cooperative drain failed, removing node anyway");
                Some(e.to_string())
            }
        };

        self.control_plane
            .delete_node(node)
            .await
            .map_err(|source| DrainError::NodeRemoval {
                node: node.to_owned(),
                source,
            })?;
        info!(node, "Deleted node from the control plane");

        let mut forcibly_deleted_pods = Vec::new();
        for pod in snapshot {
            let still_there = match self.control_plane.pod_exists(&pod).await {
                Ok(exists) => exists,
                Err(e) => {
                    // Assume the worst and try to delete it.
                    debug!(%pod, error = %e, "Unable to check pod, deleting it anyway");
                    true
                }
            };
            if !still_there {
                continue;
            }
            self.control_plane
                .force_delete_pod(&pod)
                .await
                .map_err(|source| DrainError::PodCleanup {
                    node: node.to_owned(),
                    pod: pod.clone(),
                    source,
                })?;
            info!(node, %pod, "Force-deleted orphaned pod");
            forcibly_deleted_pods.push(pod);
        }

        Ok(DrainResult {
            node: node.to_owned(),
            removed: true,
            forcibly_deleted_pods,
            drain_warning,
        })
    }
}
