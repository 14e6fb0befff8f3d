//! Flintlock provider core
//!
//! Reconciles declared microVMs against a Flintlock control plane. A
//! provider framework hands over the declared VMs; the provider creates,
//! updates, and deletes VMs until the control plane matches, and returns
//! diagnostics plus a snapshot of what it last observed.
//!
//! ## Architecture
//!
//! ```text
//! Provider (session)
//! ├── ClientConfig      (resolved endpoint and token)
//! ├── TransportClient   (HTTP, or the in-memory mock)
//! ├── SnapshotStore     (per-id state, single writer per id)
//! └── Reconciler        (one task per VM, bounded parallelism)
//! ```
//!
//! ## Modules
//!
//! - `config`: provider configuration and its resolution
//! - `spec`: declared VMs and their canonical form
//! - `client`: control plane transport
//! - `state`: snapshot store
//! - `reconciler`: the per-VM state machine
//! - `diagnostics`: user-facing findings

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod provider;
pub mod reconciler;
pub mod spec;
pub mod state;

// Re-export commonly used types
pub use client::{HttpTransport, MockTransport, RemoteVm, TransportClient, TransportError};
pub use config::{ClientConfig, Configured, ProviderConfig};
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use error::ErrorKind;
pub use provider::{ApplyResult, Provider};
pub use reconciler::{Action, ReconcilerConfig, VmOutcome};
pub use spec::{normalize, RawVmConfig, VmSpec, VmSpecPatch};
pub use state::{SnapshotStore, VmPhase, VmState};
