//! Provider session.
//!
//! A session owns the resolved client configuration, the transport, and the
//! snapshot store. All of them live as long as the session; nothing is kept
//! in process-wide state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::client::{HttpTransport, RemoteVm, TransportClient};
use crate::config::{ClientConfig, ProviderConfig};
use crate::diagnostics::{AttributePath, Diagnostic, Diagnostics};
use crate::reconciler::{Reconciler, ReconcilerConfig, VmOutcome};
use crate::spec::{normalize, RawVmConfig};
use crate::state::{SnapshotStore, VmState};

/// Result of [`Provider::apply`].
#[derive(Debug, Default)]
pub struct ApplyResult {
    /// Every diagnostic produced, normalization first, then per VM.
    pub diagnostics: Diagnostics,
    /// Snapshot after the pass.
    pub snapshot: BTreeMap<String, VmState>,
    /// What happened to each VM that was reconciled.
    pub outcomes: Vec<VmOutcome>,
}

impl ApplyResult {
    pub fn has_error(&self) -> bool {
        self.diagnostics.has_error()
    }

    pub fn outcome(&self, id: &str) -> Option<&VmOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }
}

/// A configured provider session.
pub struct Provider {
    transport: Arc<dyn TransportClient>,
    client_config: Arc<ClientConfig>,
    store: Arc<SnapshotStore>,
    config: ReconcilerConfig,
    cancel: watch::Sender<bool>,
}

impl Provider {
    /// Resolve the declared configuration and build an HTTP session.
    ///
    /// Any configuration problem aborts with diagnostics and no client.
    pub fn configure<F>(config: &ProviderConfig, env: F) -> Result<Self, Diagnostics>
    where
        F: Fn(&str) -> Option<String>,
    {
        let client_config = ClientConfig::resolve(config, env)?;
        let client_config = Arc::new(client_config);

        let transport = HttpTransport::new(Arc::clone(&client_config)).map_err(|e| {
            error!(kind = %e.kind(), error = %e, "Unable to create Flintlock API client");
            Diagnostics::from(Diagnostic::error(
                "Unable to create Flintlock API client",
                format!("The provider cannot create the Flintlock API client: {e}"),
            ))
        })?;

        info!(endpoint = %client_config.endpoint(), "Provider configured");
        Ok(Self::assemble(Arc::new(transport), client_config))
    }

    /// Build a session over an existing transport.
    pub fn with_transport(transport: Arc<dyn TransportClient>, client_config: ClientConfig) -> Self {
        Self::assemble(transport, Arc::new(client_config))
    }

    fn assemble(transport: Arc<dyn TransportClient>, client_config: Arc<ClientConfig>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            transport,
            client_config,
            store: Arc::new(SnapshotStore::new()),
            config: ReconcilerConfig::default(),
            cancel,
        }
    }

    /// Use a store seeded with previously exported state.
    pub fn with_snapshot(mut self, snapshot: BTreeMap<String, VmState>) -> Self {
        self.store = Arc::new(SnapshotStore::restore(snapshot));
        self
    }

    /// Override reconciler tuning.
    pub fn with_reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.client_config
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Export the current snapshot.
    pub async fn snapshot(&self) -> BTreeMap<String, VmState> {
        self.store.export().await
    }

    /// Signal in-flight and later work of this session to stop.
    ///
    /// Cancellation is final for the session.
    pub fn cancel(&self) {
        warn!("Cancellation requested");
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
            Arc::clone(&self.client_config),
            self.config.clone(),
            self.cancel.subscribe(),
        )
    }

    /// Normalize the declared VMs and reconcile them.
    ///
    /// Identifiers that are declared more than once, or whose declaration
    /// does not normalize, are reported and left alone: they are neither
    /// reconciled nor deleted. A failed declaration without a usable
    /// identifier could stand for any VM, so no VM is deleted in that pass.
    pub async fn apply(&self, declared: &[RawVmConfig]) -> ApplyResult {
        let mut diagnostics = Diagnostics::new();
        let mut desired = Vec::with_capacity(declared.len());
        let mut protected = BTreeSet::new();
        let mut unidentified = 0;

        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        for raw in declared {
            if let Some(id) = raw.declared_id() {
                *occurrences.entry(id).or_default() += 1;
            }
        }

        for (index, raw) in declared.iter().enumerate() {
            let id = raw.declared_id();

            if let Some(id) = id.filter(|id| occurrences.get(id).copied().unwrap_or(0) > 1) {
                diagnostics.append(
                    Diagnostic::error(
                        "Duplicate VM identifier",
                        format!(
                            "`{id}` is declared more than once. Each VM needs a unique identifier."
                        ),
                    )
                    .at(AttributePath::root("vm").index(index).key("id"))
                    .for_resource(id),
                );
                protected.insert(id.to_string());
                continue;
            }

            let (spec, diags) = normalize(raw);
            diagnostics.extend(diags);
            match (spec, id) {
                (Some(spec), _) => desired.push(spec),
                (None, Some(id)) => {
                    protected.insert(id.to_string());
                }
                (None, None) => unidentified += 1,
            }
        }

        let delete_stale = unidentified == 0;
        if !delete_stale {
            warn!(unidentified, "Declarations without identifier, deletions deferred");
            diagnostics.append(Diagnostic::warning(
                "Deletions deferred",
                format!(
                    "{unidentified} declaration(s) have no known identifier. No VM is deleted \
                     until every declaration resolves to an identifier."
                ),
            ));
        }

        let report = self
            .reconciler()
            .reconcile_pass(desired, &protected, delete_stale)
            .await;
        diagnostics.extend(report.diagnostics);

        ApplyResult {
            diagnostics,
            snapshot: self.store.export().await,
            outcomes: report.outcomes,
        }
    }

    /// The `vm` data source: look one VM up on the control plane.
    pub async fn read_vm(&self, id: &str) -> (Option<RemoteVm>, Diagnostics) {
        self.reconciler().read(id).await
    }
}
