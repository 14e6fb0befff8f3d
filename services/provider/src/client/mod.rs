//! Transport to the Flintlock control plane.
//!
//! The transport interface abstracts the four microVM RPCs:
//! - create, get, update (partial), delete
//!
//! Each call either succeeds or fails with a classified [`TransportError`].
//! The transport never touches local state; deadlines and retries belong to
//! the caller.

mod http;
mod mock;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::spec::{NetworkInterface, VmSpec, VmSpecPatch};

pub use http::HttpTransport;
pub use mock::{MockTransport, Rpc};

/// Errors from control plane calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("control plane unavailable: {0}")]
    Transient(String),

    #[error("request rejected: {0}")]
    Permanent(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("vm not found: {0}")]
    NotFound(String),

    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Lifecycle status as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    /// Accepted, still provisioning.
    Pending,
    /// Booted.
    Running,
    /// Provisioning or the guest failed.
    Failed,
    /// Being torn down.
    Deleting,
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteStatus::Pending => write!(f, "pending"),
            RemoteStatus::Running => write!(f, "running"),
            RemoteStatus::Failed => write!(f, "failed"),
            RemoteStatus::Deleting => write!(f, "deleting"),
        }
    }
}

/// A microVM as observed on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVm {
    /// Identifier assigned by the control plane.
    pub uid: String,
    /// Declared identifier.
    pub id: String,
    pub status: RemoteStatus,
    pub vcpu: u32,
    pub memory_mb: u32,
    pub image: String,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Control plane interface.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Create a microVM. The result carries the remote identifier.
    async fn create(&self, spec: &VmSpec) -> Result<RemoteVm, TransportError>;

    /// Fetch a microVM by remote identifier.
    async fn get(&self, uid: &str) -> Result<RemoteVm, TransportError>;

    /// Apply a partial update. Only the fields present in `patch` change.
    async fn update(&self, uid: &str, patch: &VmSpecPatch) -> Result<RemoteVm, TransportError>;

    /// Delete a microVM. Deleting one that is already gone succeeds.
    async fn delete(&self, uid: &str) -> Result<(), TransportError>;
}

/// Wire body for create: the spec without local bookkeeping.
#[derive(Debug, Serialize)]
struct CreateVmRequest<'a> {
    id: &'a str,
    vcpu: u32,
    memory_mb: u32,
    image: &'a str,
    network_interfaces: &'a [NetworkInterface],
    labels: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a VmSpec> for CreateVmRequest<'a> {
    fn from(spec: &'a VmSpec) -> Self {
        Self {
            id: &spec.id,
            vcpu: spec.vcpu,
            memory_mb: spec.memory_mb,
            image: &spec.image,
            network_interfaces: &spec.network_interfaces,
            labels: &spec.labels,
        }
    }
}
