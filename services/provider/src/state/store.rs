//! In-memory snapshot store with single-writer-per-id access.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flintlock_reconcile::SpecHash;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::client::{RemoteStatus, RemoteVm};
use crate::spec::VmSpec;

/// VM lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmPhase {
    /// Accepted by the control plane, still provisioning.
    Pending,
    /// Create in flight.
    Creating,
    /// VM is running.
    Running,
    /// Update in flight.
    Updating,
    /// Delete in flight.
    Deleting,
    /// The last operation was rejected.
    Failed,
    /// Deletion confirmed.
    Deleted,
}

impl VmPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for VmPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RemoteStatus> for VmPhase {
    fn from(status: RemoteStatus) -> Self {
        match status {
            RemoteStatus::Pending => Self::Pending,
            RemoteStatus::Running => Self::Running,
            RemoteStatus::Failed => Self::Failed,
            RemoteStatus::Deleting => Self::Deleting,
        }
    }
}

/// Snapshot entry for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmState {
    /// Declared identifier.
    pub id: String,
    /// Identifier assigned by the control plane.
    pub remote_id: String,
    /// Current phase.
    pub phase: VmPhase,
    /// Hash of `applied`.
    pub spec_hash: String,
    /// Last spec the control plane acknowledged.
    pub applied: VmSpec,
    /// Observed vCPUs.
    pub vcpu: u32,
    /// Observed memory (MiB).
    pub memory_mb: u32,
    /// Observed guest address.
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Observed VMM process id.
    #[serde(default)]
    pub pid: Option<u32>,
    /// Reason of the last rejected operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Time of the last successful remote call.
    pub observed_at: DateTime<Utc>,
}

impl VmState {
    /// Entry for a spec the control plane just acknowledged.
    pub fn acknowledged(applied: VmSpec, remote: &RemoteVm) -> Self {
        Self {
            id: applied.id.clone(),
            remote_id: remote.uid.clone(),
            phase: remote.status.into(),
            spec_hash: applied.spec_hash().to_string(),
            applied,
            vcpu: remote.vcpu,
            memory_mb: remote.memory_mb,
            ip_address: remote.ip_address.clone(),
            pid: remote.pid,
            last_error: None,
            observed_at: Utc::now(),
        }
    }

    /// Same applied spec, observational fields taken from `remote`.
    pub fn observed(&self, remote: &RemoteVm) -> Self {
        Self {
            phase: remote.status.into(),
            vcpu: remote.vcpu,
            memory_mb: remote.memory_mb,
            ip_address: remote.ip_address.clone(),
            pid: remote.pid,
            observed_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Same last-known-good state, marked failed.
    pub fn failed(&self, reason: impl Into<String>) -> Self {
        Self {
            phase: VmPhase::Failed,
            last_error: Some(reason.into()),
            ..self.clone()
        }
    }

    pub fn spec_hash(&self) -> SpecHash {
        SpecHash::from_string(self.spec_hash.clone())
    }
}

/// Snapshot store.
///
/// Reads are always allowed. Writes go through a [`SnapshotGuard`], which
/// holds the identifier's lock so only one reconciliation touches an entry
/// at a time.
#[derive(Default)]
pub struct SnapshotStore {
    entries: RwLock<HashMap<String, VmState>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with previously exported state.
    pub fn restore(states: BTreeMap<String, VmState>) -> Self {
        Self {
            entries: RwLock::new(states.into_iter().collect()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Take exclusive access to one identifier's entry. Waits while another
    /// guard for the same identifier is alive.
    pub async fn entry(&self, id: &str) -> SnapshotGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(id.to_string()).or_default())
        };

        SnapshotGuard {
            id: id.to_string(),
            store: self,
            lock: lock.lock_owned().await,
            vacated: AtomicBool::new(false),
        }
    }

    /// Get an entry.
    pub async fn get(&self, id: &str) -> Option<VmState> {
        self.entries.read().await.get(id).cloned()
    }

    /// Insert or replace an entry.
    pub async fn put(&self, id: &str, state: VmState) {
        self.entry(id).await.put(state).await;
    }

    /// Remove an entry.
    pub async fn delete(&self, id: &str) {
        self.entry(id).await.delete().await;
    }

    /// Identifiers with an entry, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Copy of every entry, for persistence by the caller.
    pub async fn export(&self) -> BTreeMap<String, VmState> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Exclusive access to one snapshot entry.
///
/// Dropping a guard whose entry was deleted also drops the identifier's lock
/// when nobody else holds or waits on it.
pub struct SnapshotGuard<'a> {
    id: String,
    store: &'a SnapshotStore,
    lock: OwnedMutexGuard<()>,
    vacated: AtomicBool,
}

impl SnapshotGuard<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn get(&self) -> Option<VmState> {
        self.store.get(&self.id).await
    }

    /// Replace the entry in one write.
    pub async fn put(&self, state: VmState) {
        debug!(vm_id = %self.id, phase = %state.phase, "Snapshot updated");
        self.store
            .entries
            .write()
            .await
            .insert(self.id.clone(), state);
        self.vacated.store(false, Ordering::Release);
    }

    /// Remove the entry entirely.
    pub async fn delete(&self) {
        debug!(vm_id = %self.id, "Snapshot entry removed");
        self.store.entries.write().await.remove(&self.id);
        self.vacated.store(true, Ordering::Release);
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        if !self.vacated.load(Ordering::Acquire) {
            return;
        }
        // Contended: leave the lock for a later deletion to prune.
        let Ok(mut locks) = self.store.locks.try_lock() else {
            return;
        };
        // One reference in the map, one in this guard. Any other holder got
        // its clone under the map lock, which is held here.
        let idle = locks.get(&self.id).is_some_and(|lock| {
            Arc::ptr_eq(lock, OwnedMutexGuard::mutex(&self.lock)) && Arc::strong_count(lock) <= 2
        });
        if idle {
            locks.remove(&self.id);
            debug!(vm_id = %self.id, "Snapshot lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn remote(uid: &str, spec: &VmSpec) -> RemoteVm {
        RemoteVm {
            uid: uid.to_string(),
            id: spec.id.clone(),
            status: RemoteStatus::Running,
            vcpu: spec.vcpu,
            memory_mb: spec.memory_mb,
            image: spec.image.clone(),
            network_interfaces: vec![],
            labels: spec.labels.clone(),
            ip_address: Some("10.0.0.2".to_string()),
            pid: Some(1001),
        }
    }

    fn state(id: &str) -> VmState {
        let spec = VmSpec::new(id, 2, 512, "img");
        let remote = remote("uid-1", &spec);
        VmState::acknowledged(spec, &remote)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = SnapshotStore::new();
        assert!(store.get("vm-1").await.is_none());

        store.put("vm-1", state("vm-1")).await;
        let fetched = store.get("vm-1").await.unwrap();
        assert_eq!(fetched.phase, VmPhase::Running);
        assert_eq!(fetched.remote_id, "uid-1");
        assert_eq!(store.ids().await, vec!["vm-1".to_string()]);

        store.delete("vm-1").await;
        assert!(store.get("vm-1").await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_acknowledged_state() {
        let st = state("vm-1");
        assert_eq!(st.spec_hash(), st.applied.spec_hash());
        assert_eq!(st.vcpu, 2);
        assert_eq!(st.pid, Some(1001));
        assert!(st.last_error.is_none());
    }

    #[tokio::test]
    async fn test_observed_keeps_applied_spec() {
        let st = state("vm-1");
        let mut r = remote("uid-1", &st.applied);
        r.pid = Some(2002);
        r.vcpu = 4;

        let refreshed = st.observed(&r);
        assert_eq!(refreshed.pid, Some(2002));
        assert_eq!(refreshed.vcpu, 4);
        assert_eq!(refreshed.applied, st.applied);
        assert_eq!(refreshed.spec_hash, st.spec_hash);
    }

    #[tokio::test]
    async fn test_failed_keeps_last_known_good() {
        let st = state("vm-1");
        let failed = st.failed("invalid image");
        assert_eq!(failed.phase, VmPhase::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("invalid image"));
        assert_eq!(failed.applied, st.applied);
        assert_eq!(failed.remote_id, st.remote_id);
    }

    #[tokio::test]
    async fn test_entry_is_exclusive_per_id() {
        let store = Arc::new(SnapshotStore::new());

        let guard = store.entry("vm-1").await;

        // Same id waits.
        let blocked = tokio::time::timeout(Duration::from_millis(50), store.entry("vm-1")).await;
        assert!(blocked.is_err());

        // Other ids do not.
        let other = tokio::time::timeout(Duration::from_millis(50), store.entry("vm-2")).await;
        assert!(other.is_ok());

        guard.put(state("vm-1")).await;
        drop(guard);

        let guard = store.entry("vm-1").await;
        assert!(guard.get().await.is_some());
    }

    #[tokio::test]
    async fn test_deleted_entry_releases_its_lock() {
        let store = SnapshotStore::new();
        store.put("vm-1", state("vm-1")).await;
        store.put("vm-2", state("vm-2")).await;
        assert_eq!(store.locks.lock().await.len(), 2);

        store.delete("vm-1").await;
        assert!(!store.locks.lock().await.contains_key("vm-1"));
        assert!(store.locks.lock().await.contains_key("vm-2"));

        // Recreated under the same guard: the lock stays.
        let guard = store.entry("vm-2").await;
        guard.delete().await;
        guard.put(state("vm-2")).await;
        drop(guard);
        assert!(store.locks.lock().await.contains_key("vm-2"));
    }

    #[tokio::test]
    async fn test_deleted_entry_keeps_lock_with_waiter() {
        let store = Arc::new(SnapshotStore::new());
        store.put("vm-1", state("vm-1")).await;

        let guard = store.entry("vm-1").await;
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let guard = store.entry("vm-1").await;
                guard.put(state("vm-1")).await;
            })
        };
        // Let the waiter take its clone of the lock.
        tokio::time::sleep(Duration::from_millis(20)).await;

        guard.delete().await;
        drop(guard);
        waiter.await.unwrap();

        assert!(store.get("vm-1").await.is_some());
        assert!(store.locks.lock().await.contains_key("vm-1"));
    }

    #[tokio::test]
    async fn test_export_restore() {
        let store = SnapshotStore::new();
        store.put("vm-1", state("vm-1")).await;
        store.put("vm-2", state("vm-2")).await;

        let exported = store.export().await;
        let json = serde_json::to_string(&exported).unwrap();
        let parsed: BTreeMap<String, VmState> = serde_json::from_str(&json).unwrap();

        let restored = SnapshotStore::restore(parsed);
        assert_eq!(restored.len().await, 2);
        assert_eq!(restored.get("vm-2").await, store.get("vm-2").await);
    }

    #[test]
    fn test_phase_from_remote_status() {
        assert_eq!(VmPhase::from(RemoteStatus::Pending), VmPhase::Pending);
        assert_eq!(VmPhase::from(RemoteStatus::Running), VmPhase::Running);
        assert_eq!(VmPhase::from(RemoteStatus::Failed), VmPhase::Failed);
    }
}
