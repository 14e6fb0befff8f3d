//! In-memory control plane for testing and local development.
//!
//! Behaves like a well-mannered Flintlock: assigns remote identifiers,
//! applies partial updates field by field, treats deleting a missing VM as
//! success. Failures can be scripted per RPC, and VMs can be changed or
//! removed behind the provider's back to exercise drift handling.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{RemoteStatus, RemoteVm, TransportClient, TransportError};
use crate::spec::{NetworkInterface, VmSpec, VmSpecPatch};

/// The RPCs of the transport interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rpc {
    Create,
    Get,
    Update,
    Delete,
}

impl Rpc {
    fn slot(self) -> usize {
        match self {
            Rpc::Create => 0,
            Rpc::Get => 1,
            Rpc::Update => 2,
            Rpc::Delete => 3,
        }
    }
}

#[derive(Default)]
struct MockState {
    /// VMs by remote identifier.
    vms: BTreeMap<String, RemoteVm>,
    next_uid: u64,
    failures: HashMap<Rpc, VecDeque<TransportError>>,
    patches: Vec<(String, VmSpecPatch)>,
}

/// Mock control plane.
pub struct MockTransport {
    state: Mutex<MockState>,
    calls: [AtomicUsize; 4],
    async_provisioning: bool,
    latency: Duration,
}

impl MockTransport {
    /// Create a mock that boots VMs synchronously.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            calls: Default::default(),
            async_provisioning: false,
            latency: Duration::ZERO,
        }
    }

    /// Create a mock whose VMs stay `pending` until [`Self::finish_provisioning`].
    pub fn with_async_provisioning() -> Self {
        Self {
            async_provisioning: true,
            ..Self::new()
        }
    }

    /// Delay every call, so that deadlines and cancellation can be exercised.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next call of `rpc` fail with `error`. Queued failures are
    /// consumed in order.
    pub async fn fail_next(&self, rpc: Rpc, error: TransportError) {
        let mut state = self.state.lock().await;
        state.failures.entry(rpc).or_default().push_back(error);
    }

    /// Make the next `times` calls of `rpc` fail with `error`.
    pub async fn fail_times(&self, rpc: Rpc, times: usize, error: TransportError) {
        let mut state = self.state.lock().await;
        let queue = state.failures.entry(rpc).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Number of calls made to `rpc`, including failed ones.
    pub fn calls(&self, rpc: Rpc) -> usize {
        self.calls[rpc.slot()].load(Ordering::SeqCst)
    }

    /// Patches received by `update`, in order.
    pub async fn patches(&self) -> Vec<(String, VmSpecPatch)> {
        self.state.lock().await.patches.clone()
    }

    /// Current remote view of a VM.
    pub async fn remote(&self, uid: &str) -> Option<RemoteVm> {
        self.state.lock().await.vms.get(uid).cloned()
    }

    /// Remote view of a VM by declared identifier.
    pub async fn find(&self, id: &str) -> Option<RemoteVm> {
        let state = self.state.lock().await;
        state.vms.values().find(|vm| vm.id == id).cloned()
    }

    /// Number of VMs the mock holds.
    pub async fn vm_count(&self) -> usize {
        self.state.lock().await.vms.len()
    }

    /// Change a VM out of band. Returns false when it does not exist.
    pub async fn mutate<F>(&self, uid: &str, f: F) -> bool
    where
        F: FnOnce(&mut RemoteVm),
    {
        let mut state = self.state.lock().await;
        match state.vms.get_mut(uid) {
            Some(vm) => {
                f(vm);
                true
            }
            None => false,
        }
    }

    /// Delete a VM out of band. Returns false when it does not exist.
    pub async fn remove(&self, uid: &str) -> bool {
        self.state.lock().await.vms.remove(uid).is_some()
    }

    /// Complete provisioning of every pending VM.
    pub async fn finish_provisioning(&self) {
        let mut state = self.state.lock().await;
        for vm in state.vms.values_mut() {
            if vm.status == RemoteStatus::Pending {
                vm.status = RemoteStatus::Running;
            }
        }
    }

    /// Count the call, apply latency, and pop a scripted failure if any.
    async fn enter(&self, rpc: Rpc) -> Result<(), TransportError> {
        self.calls[rpc.slot()].fetch_add(1, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.lock().await;
        match state.failures.get_mut(&rpc).and_then(VecDeque::pop_front) {
            Some(error) => {
                debug!(?rpc, error = %error, "[MOCK] Injected failure");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportClient for MockTransport {
    async fn create(&self, spec: &VmSpec) -> Result<RemoteVm, TransportError> {
        self.enter(Rpc::Create).await?;

        let mut state = self.state.lock().await;
        if state.vms.values().any(|vm| vm.id == spec.id) {
            return Err(TransportError::Conflict(format!(
                "microvm {} already exists",
                spec.id
            )));
        }

        state.next_uid += 1;
        let n = state.next_uid;
        // Interfaces without a MAC get one assigned.
        let network_interfaces = spec
            .network_interfaces
            .iter()
            .enumerate()
            .map(|(i, interface)| NetworkInterface {
                guest_mac: interface
                    .guest_mac
                    .clone()
                    .or_else(|| Some(format!("02:00:00:{:02x}:{:02x}:{i:02x}", n / 256 % 256, n % 256))),
                ..interface.clone()
            })
            .collect();
        let vm = RemoteVm {
            uid: format!("uid-{n:06}"),
            id: spec.id.clone(),
            status: if self.async_provisioning {
                RemoteStatus::Pending
            } else {
                RemoteStatus::Running
            },
            vcpu: spec.vcpu,
            memory_mb: spec.memory_mb,
            image: spec.image.clone(),
            network_interfaces,
            labels: spec.labels.clone(),
            ip_address: Some(format!("10.0.{}.{}", n / 250, n % 250 + 2)),
            pid: Some(1000 + n as u32),
        };

        debug!(vm_id = %vm.id, remote_id = %vm.uid, "[MOCK] Created microvm");
        state.vms.insert(vm.uid.clone(), vm.clone());
        Ok(vm)
    }

    async fn get(&self, uid: &str) -> Result<RemoteVm, TransportError> {
        self.enter(Rpc::Get).await?;

        let state = self.state.lock().await;
        state
            .vms
            .get(uid)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(uid.to_string()))
    }

    async fn update(&self, uid: &str, patch: &VmSpecPatch) -> Result<RemoteVm, TransportError> {
        self.enter(Rpc::Update).await?;

        let mut state = self.state.lock().await;
        state.patches.push((uid.to_string(), patch.clone()));

        let vm = state
            .vms
            .get_mut(uid)
            .ok_or_else(|| TransportError::NotFound(uid.to_string()))?;

        if let Some(vcpu) = patch.vcpu {
            vm.vcpu = vcpu;
        }
        if let Some(memory_mb) = patch.memory_mb {
            vm.memory_mb = memory_mb;
        }
        if let Some(image) = &patch.image {
            vm.image = image.clone();
        }
        if let Some(interfaces) = &patch.network_interfaces {
            vm.network_interfaces = interfaces.clone();
        }
        if let Some(labels) = &patch.labels {
            vm.labels = labels.clone();
        }
        if vm.status == RemoteStatus::Failed {
            vm.status = RemoteStatus::Running;
        }

        debug!(remote_id = %uid, fields = ?patch.fields(), "[MOCK] Updated microvm");
        Ok(vm.clone())
    }

    async fn delete(&self, uid: &str) -> Result<(), TransportError> {
        self.enter(Rpc::Delete).await?;

        let mut state = self.state.lock().await;
        if state.vms.remove(uid).is_some() {
            debug!(remote_id = %uid, "[MOCK] Deleted microvm");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmSpec {
        VmSpec::new("vm-1", 2, 512, "img")
    }

    #[tokio::test]
    async fn test_mock_create_and_get() {
        let mock = MockTransport::new();
        let vm = mock.create(&spec()).await.unwrap();

        assert_eq!(vm.status, RemoteStatus::Running);
        assert!(vm.pid.is_some());
        assert_eq!(mock.get(&vm.uid).await.unwrap(), vm);
        assert_eq!(mock.calls(Rpc::Create), 1);
        assert_eq!(mock.calls(Rpc::Get), 1);
    }

    #[tokio::test]
    async fn test_mock_duplicate_create_conflicts() {
        let mock = MockTransport::new();
        mock.create(&spec()).await.unwrap();

        let err = mock.create(&spec()).await.unwrap_err();
        assert!(matches!(err, TransportError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_mock_async_provisioning() {
        let mock = MockTransport::with_async_provisioning();
        let vm = mock.create(&spec()).await.unwrap();
        assert_eq!(vm.status, RemoteStatus::Pending);

        mock.finish_provisioning().await;
        assert_eq!(mock.get(&vm.uid).await.unwrap().status, RemoteStatus::Running);
    }

    #[tokio::test]
    async fn test_mock_partial_update() {
        let mock = MockTransport::new();
        let vm = mock.create(&spec()).await.unwrap();

        let patch = VmSpecPatch {
            memory_mb: Some(1024),
            ..Default::default()
        };
        let updated = mock.update(&vm.uid, &patch).await.unwrap();
        assert_eq!(updated.memory_mb, 1024);
        assert_eq!(updated.vcpu, 2);
        assert_eq!(updated.pid, vm.pid);
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let mock = MockTransport::new();
        mock.fail_times(Rpc::Create, 2, TransportError::Transient("refused".into()))
            .await;

        assert!(mock.create(&spec()).await.is_err());
        assert!(mock.create(&spec()).await.is_err());
        assert!(mock.create(&spec()).await.is_ok());
        assert_eq!(mock.calls(Rpc::Create), 3);
    }

    #[tokio::test]
    async fn test_mock_delete_is_idempotent() {
        let mock = MockTransport::new();
        let vm = mock.create(&spec()).await.unwrap();

        mock.delete(&vm.uid).await.unwrap();
        mock.delete(&vm.uid).await.unwrap();
        assert_eq!(mock.vm_count().await, 0);
        assert!(matches!(
            mock.get(&vm.uid).await,
            Err(TransportError::NotFound(_))
        ));
    }
}
