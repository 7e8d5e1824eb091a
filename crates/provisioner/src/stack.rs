//! Types and the client trait for the cloud provider's orchestration service.
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;

/// The lifecycle status of a stack as reported by the orchestration service.
///
/// A stack that does not exist has no status at all; [`CloudStackClient::describe`]
/// returns `None` for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StackStatus {
    /// Resources are still being created.
    CreateInProgress,
    /// Every resource was created.
    CreateComplete,
    /// At least one resource could not be created.
    CreateFailed,
    /// Teardown has begun.
    DeleteInProgress,
    /// Teardown finished. Some clouds keep reporting the stack for a moment.
    DeleteComplete,
    /// Teardown could not complete.
    DeleteFailed,
    /// An update is in flight.
    UpdateInProgress,
    /// An update finished.
    UpdateComplete,
    /// An update failed.
    UpdateFailed,
    /// Any status this crate does not model (rollbacks, suspends, checks...).
    Other(String),
}

impl StackStatus {
    /// Whether the status means the orchestration service gave up on the stack.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            StackStatus::CreateFailed | StackStatus::DeleteFailed | StackStatus::UpdateFailed
        )
    }
}

impl From<&str> for StackStatus {
    fn from(raw: &str) -> Self {
        match raw {
            "CREATE_IN_PROGRESS" => StackStatus::CreateInProgress,
            "CREATE_COMPLETE" => StackStatus::CreateComplete,
            "CREATE_FAILED" => StackStatus::CreateFailed,
            "DELETE_IN_PROGRESS" => StackStatus::DeleteInProgress,
            "DELETE_COMPLETE" => StackStatus::DeleteComplete,
            "DELETE_FAILED" => StackStatus::DeleteFailed,
            "UPDATE_IN_PROGRESS" => StackStatus::UpdateInProgress,
            "UPDATE_COMPLETE" => StackStatus::UpdateComplete,
            "UPDATE_FAILED" => StackStatus::UpdateFailed,
            other => StackStatus::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackStatus::CreateInProgress => "CREATE_IN_PROGRESS",
            StackStatus::CreateComplete => "CREATE_COMPLETE",
            StackStatus::CreateFailed => "CREATE_FAILED",
            StackStatus::DeleteInProgress => "DELETE_IN_PROGRESS",
            StackStatus::DeleteComplete => "DELETE_COMPLETE",
            StackStatus::DeleteFailed => "DELETE_FAILED",
            StackStatus::UpdateInProgress => "UPDATE_IN_PROGRESS",
            StackStatus::UpdateComplete => "UPDATE_COMPLETE",
            StackStatus::UpdateFailed => "UPDATE_FAILED",
            StackStatus::Other(raw) => raw.as_str(),
        };
        f.write_str(s)
    }
}

/// A snapshot of a stack returned by [`CloudStackClient::describe`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackDescriptor {
    /// The stack name
    pub name: String,
    /// The status at the time of the query
    pub status: StackStatus,
    /// Free-form explanation attached to the status, if any
    pub status_reason: Option<String>,
    /// Stack outputs keyed by output name
    pub outputs: BTreeMap<String, String>,
}

/// The provider's identifier for a stack that was just created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackId(pub String);

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stack resource that ended up in a failed state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceFailure {
    /// Logical name of the resource inside the template
    pub resource_name: String,
    /// Heat resource type, e.g. `OS::Neutron::Port`
    pub resource_type: String,
    /// Status string such as `CREATE_FAILED`
    pub status: String,
    /// Why the resource failed, when the provider says
    pub status_reason: Option<String>,
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) {}",
            self.resource_name, self.resource_type, self.status
        )?;
        if let Some(reason) = &self.status_reason {
            write!(f, ": {}", reason)?;
        }
        Ok(())
    }
}

/// A single entry of the stack event log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackEvent {
    /// The resource the event is about
    pub resource_name: String,
    /// Status the resource moved to
    pub status: String,
    /// Explanation attached to the event
    pub status_reason: Option<String>,
    /// Provider timestamp, kept verbatim
    pub time: Option<String>,
}

impl fmt::Display for StackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(time) = &self.time {
            write!(f, "[{}] ", time)?;
        }
        write!(f, "{} {}", self.resource_name, self.status)?;
        if let Some(reason) = &self.status_reason {
            write!(f, ": {}", reason)?;
        }
        Ok(())
    }
}

/// Typed access to stack lifecycle operations.
///
/// Implementations are a pure I/O boundary and make no decisions of their
/// own; every retry and every interpretation of a status happens in the
/// reconciler.
///
/// **Note**: this trait is defined using [async-trait](https://crates.io/crates/async-trait).
#[async_trait]
pub trait CloudStackClient: Send + Sync {
    /// Look up a stack by name. Returns `Ok(None)` if the stack does not exist.
    async fn describe(&self, name: &str) -> anyhow::Result<Option<StackDescriptor>>;

    /// Ask the provider to create a stack from a template.
    ///
    /// This only starts provisioning; use [`CloudStackClient::describe`] to
    /// follow it to convergence.
    async fn create(
        &self,
        name: &str,
        template: &Path,
        parameters: &BTreeMap<String, String>,
    ) -> anyhow::Result<StackId>;

    /// Ask the provider to delete a stack. Deleting a stack that does not
    /// exist must succeed.
    async fn delete(&self, name: &str) -> anyhow::Result<()>;

    /// List the resources of a stack that are in a failed state.
    async fn list_failed_resources(&self, name: &str) -> anyhow::Result<Vec<ResourceFailure>>;

    /// List the stack's event log, oldest first.
    async fn list_events(&self, name: &str) -> anyhow::Result<Vec<StackEvent>>;

    /// Fetch the raw address text of an instance, shaped like
    /// `<network>=<addr1>[, <addr2>]`. Returns `Ok(None)` if the instance does
    /// not exist.
    async fn server_addresses(&self, instance: &str) -> anyhow::Result<Option<String>>;
}
