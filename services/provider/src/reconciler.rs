//! Reconciliation of declared VMs against the control plane.
//!
//! The reconciler:
//! - Creates VMs that have no snapshot entry
//! - Refreshes existing entries from the control plane and sends partial
//!   updates for whatever differs from the declared spec
//! - Deletes VMs whose declaration went away
//! - Records the outcome in the snapshot store and in diagnostics
//!
//! Each VM identifier is handled by one task holding that identifier's
//! snapshot lock; independent identifiers run concurrently. The snapshot is
//! only written after a remote call returned, and always as one whole entry,
//! so a cancelled or failed call never leaves a half-merged entry behind.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use flintlock_reconcile::{ConvergenceStatus, RetryPolicy};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::client::{RemoteStatus, RemoteVm, TransportClient, TransportError};
use crate::config::ClientConfig;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::ErrorKind;
use crate::spec::{ShapeField, VmSpec, VmSpecPatch};
use crate::state::{SnapshotGuard, SnapshotStore, VmPhase, VmState};

/// Default number of VMs reconciled at the same time.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Upper bound on VMs reconciled concurrently.
    pub max_concurrency: usize,

    /// Retry bound for transient failures.
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

/// What a pass did to one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Created on the control plane.
    Created,
    /// Partial update sent.
    Updated,
    /// Refreshed, nothing to send.
    Unchanged,
    /// Deleted and removed from the snapshot.
    Deleted,
    /// Rejected by the control plane.
    Failed,
    /// Not reached (retries exhausted or cancelled); try again later.
    Deferred,
}

/// Per-VM result of a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmOutcome {
    pub id: String,
    pub action: Action,
    /// Phase recorded in the snapshot, if the VM has an entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<VmPhase>,
}

impl VmOutcome {
    fn new(id: &str, action: Action, phase: Option<VmPhase>) -> Self {
        Self {
            id: id.to_string(),
            action,
            phase,
        }
    }

    /// How far the VM is from its declared state.
    pub fn status(&self) -> ConvergenceStatus {
        match (self.action, self.phase) {
            (Action::Deferred, _) => ConvergenceStatus::Unknown,
            (Action::Failed, _) | (_, Some(VmPhase::Failed)) => ConvergenceStatus::Diverged,
            (Action::Deleted, _) | (_, Some(VmPhase::Running)) => ConvergenceStatus::Converged,
            _ => ConvergenceStatus::Converging,
        }
    }
}

/// Result of a reconciliation pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub outcomes: Vec<VmOutcome>,
    pub diagnostics: Diagnostics,
}

impl PassReport {
    pub fn outcome(&self, id: &str) -> Option<&VmOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }
}

/// Converges the control plane towards the declared VMs.
#[derive(Clone)]
pub struct Reconciler {
    transport: Arc<dyn TransportClient>,
    store: Arc<SnapshotStore>,
    client_config: Arc<ClientConfig>,
    config: Arc<ReconcilerConfig>,
    cancel: watch::Receiver<bool>,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        transport: Arc<dyn TransportClient>,
        store: Arc<SnapshotStore>,
        client_config: Arc<ClientConfig>,
        config: ReconcilerConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            store,
            client_config,
            config: Arc::new(config),
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Run one pass over `desired`.
    ///
    /// With `delete_stale`, entries whose identifier is neither in `desired`
    /// nor in `protected` are deleted. `protected` holds identifiers that are
    /// still declared but could not be normalized this time. Without it no
    /// entry is deleted.
    pub async fn reconcile_pass(
        &self,
        desired: Vec<VmSpec>,
        protected: &BTreeSet<String>,
        delete_stale: bool,
    ) -> PassReport {
        let declared: BTreeSet<String> = desired
            .iter()
            .map(|spec| spec.id.clone())
            .chain(protected.iter().cloned())
            .collect();
        let stale: Vec<String> = if delete_stale {
            self.store
                .ids()
                .await
                .into_iter()
                .filter(|id| !declared.contains(id))
                .collect()
        } else {
            Vec::new()
        };

        info!(
            desired = desired.len(),
            protected = protected.len(),
            stale = stale.len(),
            "Starting reconciliation pass"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = Vec::with_capacity(desired.len() + stale.len());

        for spec in desired {
            let id = spec.id.clone();
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                this.reconcile_vm(spec).await
            });
            tasks.push((id, handle));
        }

        for id in stale {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let task_id = id.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                this.delete_vm(&task_id).await
            });
            tasks.push((id, handle));
        }

        let mut report = PassReport::default();
        for (id, handle) in tasks {
            match handle.await {
                Ok((outcome, diagnostics)) => {
                    report.outcomes.push(outcome);
                    report.diagnostics.extend(diagnostics);
                }
                Err(e) => {
                    error!(vm_id = %id, error = %e, "Reconciliation task failed");
                    report.diagnostics.append(
                        Diagnostic::error(
                            "Reconciliation task failed",
                            format!("The reconciliation of `{id}` stopped unexpectedly: {e}"),
                        )
                        .for_resource(&id),
                    );
                    report
                        .outcomes
                        .push(VmOutcome::new(&id, Action::Deferred, None));
                }
            }
        }

        info!(
            vms = report.outcomes.len(),
            diagnostics = report.diagnostics.len(),
            has_error = report.diagnostics.has_error(),
            "Reconciliation pass finished"
        );
        report
    }

    /// Reconcile a single declared VM.
    pub async fn reconcile_vm(&self, desired: VmSpec) -> (VmOutcome, Diagnostics) {
        let mut diags = Diagnostics::new();
        let guard = self.store.entry(&desired.id).await;

        let outcome = match guard.get().await {
            None => self.create(&guard, desired, &mut diags).await,
            Some(prior) => self.converge(&guard, prior, desired, &mut diags).await,
        };

        (outcome, diags)
    }

    /// Delete an undeclared VM and drop its entry.
    pub async fn delete_vm(&self, id: &str) -> (VmOutcome, Diagnostics) {
        let mut diags = Diagnostics::new();
        let guard = self.store.entry(id).await;

        let Some(prior) = guard.get().await else {
            return (VmOutcome::new(id, Action::Deleted, None), diags);
        };

        info!(vm_id = %id, remote_id = %prior.remote_id, "Deleting VM");
        let remote_id = prior.remote_id.clone();
        let outcome = match self
            .call(id, "delete", || self.transport.delete(&remote_id))
            .await
        {
            Ok(()) => {
                guard.delete().await;
                info!(vm_id = %id, "VM deleted");
                VmOutcome::new(id, Action::Deleted, Some(VmPhase::Deleted))
            }
            Err(e) => {
                self.record_failure(&guard, "delete", e, Some(&prior), &mut diags)
                    .await
            }
        };

        (outcome, diags)
    }

    /// Look a VM up without touching the snapshot.
    ///
    /// `id` is resolved through the snapshot when it has an entry, otherwise
    /// it is taken to be the remote identifier.
    pub async fn read(&self, id: &str) -> (Option<RemoteVm>, Diagnostics) {
        let mut diags = Diagnostics::new();
        let remote_id = match self.store.get(id).await {
            Some(state) => state.remote_id,
            None => id.to_string(),
        };

        match self.call(id, "read", || self.transport.get(&remote_id)).await {
            Ok(remote) => (Some(remote), diags),
            Err(e) => {
                let summary = match e.kind() {
                    ErrorKind::NotFound => "VM not found",
                    ErrorKind::Transient => "Control plane unavailable",
                    ErrorKind::Cancelled => "Read cancelled",
                    _ => "Unable to read VM",
                };
                diags.append(
                    Diagnostic::error(summary, format!("Reading `{id}` failed: {e}"))
                        .for_resource(id),
                );
                (None, diags)
            }
        }
    }

    /// NoState -> Creating -> Running | Pending.
    async fn create(
        &self,
        guard: &SnapshotGuard<'_>,
        desired: VmSpec,
        diags: &mut Diagnostics,
    ) -> VmOutcome {
        let id = desired.id.clone();
        info!(
            vm_id = %id,
            vcpu = desired.vcpu,
            memory_mb = desired.memory_mb,
            image = %desired.image,
            phase = %VmPhase::Creating,
            "Creating VM"
        );

        let result = self.call(&id, "create", || self.transport.create(&desired)).await;
        match result {
            Ok(remote) => {
                let state = VmState::acknowledged(desired, &remote);
                let phase = state.phase;
                info!(vm_id = %id, remote_id = %remote.uid, phase = %phase, "VM created");
                guard.put(state).await;
                VmOutcome::new(&id, Action::Created, Some(phase))
            }
            Err(e) => self.record_failure(guard, "create", e, None, diags).await,
        }
    }

    /// Existing entry: refresh, then update whatever differs.
    async fn converge(
        &self,
        guard: &SnapshotGuard<'_>,
        prior: VmState,
        desired: VmSpec,
        diags: &mut Diagnostics,
    ) -> VmOutcome {
        let id = desired.id.clone();

        let remote = match self
            .call(&id, "refresh", || self.transport.get(&prior.remote_id))
            .await
        {
            Ok(remote) => remote,
            Err(TransportError::NotFound(_)) => {
                warn!(vm_id = %id, remote_id = %prior.remote_id, "VM vanished from control plane, recreating");
                diags.append(
                    Diagnostic::warning(
                        "VM disappeared from the control plane",
                        format!(
                            "`{id}` (remote id {}) no longer exists on the control plane. It is being created again.",
                            prior.remote_id
                        ),
                    )
                    .for_resource(&id),
                );
                guard.delete().await;
                return self.create(guard, desired, diags).await;
            }
            Err(e) => {
                return self
                    .record_failure(guard, "refresh", e, Some(&prior), diags)
                    .await
            }
        };

        if remote.id != id {
            let error = TransportError::Conflict(format!(
                "remote id {} now belongs to `{}`",
                remote.uid, remote.id
            ));
            return self
                .record_failure(guard, "refresh", error, Some(&prior), diags)
                .await;
        }

        let observed = prior.observed(&remote);
        if observed.pid != prior.pid || observed.ip_address != prior.ip_address {
            debug!(
                vm_id = %id,
                old_pid = ?prior.pid,
                new_pid = ?observed.pid,
                "Observed fields changed outside this provider"
            );
        }

        let effective = self.effective_spec(&desired, &remote, diags);
        let redeclared = effective.spec_hash() != prior.spec_hash();
        let patch = VmSpecPatch::between(&remote_spec(&remote, &effective), &effective);
        debug!(vm_id = %id, redeclared, fields = ?patch.fields(), "Compared with control plane");

        if patch.is_empty() {
            let mut state = observed;
            if redeclared {
                state.spec_hash = effective.spec_hash().to_string();
                state.applied = effective;
            }
            if state.phase != VmPhase::Failed {
                state.last_error = None;
            } else if remote.status == RemoteStatus::Failed {
                diags.append(
                    Diagnostic::warning(
                        "VM reported failed",
                        format!("The control plane reports `{id}` as failed."),
                    )
                    .for_resource(&id),
                );
            }
            let phase = state.phase;
            debug!(vm_id = %id, phase = %phase, "VM up to date");
            guard.put(state).await;
            return VmOutcome::new(&id, Action::Unchanged, Some(phase));
        }

        info!(
            vm_id = %id,
            remote_id = %remote.uid,
            fields = ?patch.fields(),
            phase = %VmPhase::Updating,
            "Updating VM"
        );

        match self
            .call(&id, "update", || self.transport.update(&remote.uid, &patch))
            .await
        {
            Ok(updated) => {
                let state = VmState::acknowledged(effective, &updated);
                let phase = state.phase;
                info!(vm_id = %id, phase = %phase, "VM updated");
                guard.put(state).await;
                VmOutcome::new(&id, Action::Updated, Some(phase))
            }
            Err(TransportError::NotFound(_)) => {
                warn!(vm_id = %id, "VM vanished during update");
                diags.append(
                    Diagnostic::warning(
                        "VM disappeared from the control plane",
                        format!("`{id}` was deleted while it was being updated. It will be created again on the next apply."),
                    )
                    .for_resource(&id),
                );
                guard.delete().await;
                VmOutcome::new(&id, Action::Deferred, None)
            }
            Err(e) => {
                self.record_failure(guard, "update", e, Some(&observed), diags)
                    .await
            }
        }
    }

    /// The spec to converge to: declared fields as declared, defaulted shape
    /// fields and undeclared interface fields as the control plane reports
    /// them.
    fn effective_spec(&self, desired: &VmSpec, remote: &RemoteVm, diags: &mut Diagnostics) -> VmSpec {
        let mut effective = desired.clone();

        for interface in &mut effective.network_interfaces {
            if let Some(observed) = remote
                .network_interfaces
                .iter()
                .find(|o| o.guest_device_name == interface.guest_device_name)
            {
                *interface = interface.with_observed(observed);
            }
        }

        for field in [ShapeField::Vcpu, ShapeField::MemoryMb] {
            let observed = remote_shape(remote, field);
            if !desired.is_defaulted(field) || observed == desired.shape(field) {
                continue;
            }

            warn!(
                vm_id = %desired.id,
                field = field.as_str(),
                observed,
                default = desired.shape(field),
                "Keeping remote value of undeclared field"
            );
            diags.append(
                Diagnostic::warning(
                    "Remote value kept",
                    format!(
                        "`{}` is {observed} on the control plane. The attribute is not declared, so the remote value is kept instead of the default {}. Declare it to enforce a value.",
                        field.as_str(),
                        desired.shape(field),
                    ),
                )
                .for_resource(&desired.id),
            );
            match field {
                ShapeField::Vcpu => effective.vcpu = observed,
                ShapeField::MemoryMb => effective.memory_mb = observed,
            }
        }

        effective
    }

    /// Turn a failed call into diagnostics and, for rejections, a Failed
    /// marker on the last known good entry.
    async fn record_failure(
        &self,
        guard: &SnapshotGuard<'_>,
        op: &str,
        error: TransportError,
        prior: Option<&VmState>,
        diags: &mut Diagnostics,
    ) -> VmOutcome {
        let id = guard.id();
        let phase = prior.map(|p| p.phase);

        match error.kind() {
            ErrorKind::Transient => {
                warn!(vm_id = %id, op, error = %error, "Retries exhausted");
                diags.append(
                    Diagnostic::warning(
                        "Control plane unavailable",
                        format!(
                            "The {op} of `{id}` did not succeed after {} attempts: {error}. \
                             The state is unchanged; apply again later.",
                            self.config.retry.max_attempts()
                        ),
                    )
                    .for_resource(id),
                );
                VmOutcome::new(id, Action::Deferred, phase)
            }
            ErrorKind::Cancelled => {
                warn!(vm_id = %id, op, "Reconciliation cancelled");
                diags.append(
                    Diagnostic::warning(
                        "Reconciliation cancelled",
                        format!("The {op} of `{id}` was cancelled. The state is unchanged."),
                    )
                    .for_resource(id),
                );
                VmOutcome::new(id, Action::Deferred, phase)
            }
            kind => {
                error!(vm_id = %id, op, kind = %kind, error = %error, "VM operation failed");
                let summary = match kind {
                    ErrorKind::Conflict => "Conflicting remote state",
                    ErrorKind::NotFound => "VM not found",
                    _ => "Control plane rejected the request",
                };
                diags.append(
                    Diagnostic::error(summary, format!("The {op} of `{id}` failed: {error}"))
                        .for_resource(id),
                );

                match prior {
                    Some(prior) => {
                        guard.put(prior.failed(error.to_string())).await;
                        VmOutcome::new(id, Action::Failed, Some(VmPhase::Failed))
                    }
                    None => VmOutcome::new(id, Action::Failed, None),
                }
            }
        }
    }

    /// Run one RPC under the request deadline, racing cancellation, retrying
    /// transient failures per the retry policy.
    async fn call<T, F, Fut>(&self, id: &str, op: &'static str, mut rpc: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut cancel = self.cancel.clone();
        let deadline = self.client_config.request_timeout();
        let mut attempt = 0;

        loop {
            if *cancel.borrow() {
                return Err(TransportError::Cancelled);
            }
            attempt += 1;

            let result = tokio::select! {
                result = tokio::time::timeout(deadline, rpc()) => match result {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Transient(format!(
                        "{op} timed out after {deadline:?}"
                    ))),
                },
                _ = cancelled(&mut cancel) => Err(TransportError::Cancelled),
            };

            let error = match result {
                Err(e) if e.is_retryable() => e,
                other => return other,
            };

            let Some(delay) = self.config.retry.next_delay(attempt) else {
                return Err(error);
            };

            warn!(
                vm_id = %id,
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(&mut cancel) => return Err(TransportError::Cancelled),
            }
        }
    }
}

/// Resolves once cancellation has been signalled. Never resolves if the
/// sender is gone without signalling.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn remote_shape(remote: &RemoteVm, field: ShapeField) -> u32 {
    match field {
        ShapeField::Vcpu => remote.vcpu,
        ShapeField::MemoryMb => remote.memory_mb,
    }
}

/// The remote VM in spec form, for diffing against the declared spec.
fn remote_spec(remote: &RemoteVm, effective: &VmSpec) -> VmSpec {
    VmSpec {
        id: remote.id.clone(),
        vcpu: remote.vcpu,
        memory_mb: remote.memory_mb,
        image: remote.image.clone(),
        network_interfaces: remote.network_interfaces.clone(),
        labels: remote.labels.clone(),
        defaulted: effective.defaulted.clone(),
    }
}
