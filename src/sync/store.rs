use anyhow::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::events::{ChangeOrigin, QueueChange, QueueEvents};
use crate::queue::{DoctorId, Patient, PatientId, PatientQueue};
use crate::storage::SnapshotStore;

/// An agent's local copy of the queue.
///
/// Every change, local or relayed, is persisted and then announced on
/// [`QueueEvents`].
pub struct QueueStore {
    queue: RwLock<PatientQueue>,
    snapshots: Option<SnapshotStore>,
    events: QueueEvents,
}

impl QueueStore {
    /// Open a store pre-populated from the last persisted snapshot.
    pub fn open(snapshots: SnapshotStore) -> Self {
        let patients = snapshots.load();
        tracing::info!(count = patients.len(), "loaded persisted queue");
        Self {
            queue: RwLock::new(PatientQueue::from_snapshot(patients)),
            snapshots: Some(snapshots),
            events: QueueEvents::new(),
        }
    }

    /// A store that keeps nothing across restarts.
    pub fn ephemeral() -> Self {
        Self {
            queue: RwLock::new(PatientQueue::new()),
            snapshots: None,
            events: QueueEvents::new(),
        }
    }

    pub fn snapshot(&self) -> Vec<Patient> {
        self.queue.read().patients().to_vec()
    }

    pub fn queue(&self) -> PatientQueue {
        self.queue.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueChange> {
        self.events.subscribe()
    }

    /// Replace the cache wholesale with a relayed snapshot.
    pub fn apply_remote(&self, patients: Vec<Patient>) {
        let mut queue = self.queue.write();
        *queue = PatientQueue::from_snapshot(patients);
        self.commit(ChangeOrigin::Remote, &queue);
    }

    /// Run a local mutation; persist and announce only when `f` reports a change.
    fn mutate_if(&self, f: impl FnOnce(&mut PatientQueue) -> bool) -> bool {
        let mut queue = self.queue.write();
        if !f(&mut queue) {
            return false;
        }
        self.commit(ChangeOrigin::Local, &queue);
        true
    }

    pub fn add_patient(&self, name: &str, doctor: DoctorId) -> Result<PatientId> {
        let mut result = Err(anyhow::anyhow!("patient was not added"));
        self.mutate_if(|q| {
            result = q.add(name, doctor);
            result.is_ok()
        });
        result
    }

    pub fn remove_patient(&self, id: &PatientId) -> Option<Patient> {
        let mut removed = None;
        self.mutate_if(|q| {
            removed = q.remove(id);
            removed.is_some()
        });
        removed
    }

    pub fn move_up(&self, id: &PatientId) -> bool {
        self.mutate_if(|q| q.move_up(id))
    }

    pub fn move_down(&self, id: &PatientId) -> bool {
        self.mutate_if(|q| q.move_down(id))
    }

    pub fn transfer(&self, id: &PatientId) -> Option<DoctorId> {
        let mut moved_to = None;
        self.mutate_if(|q| {
            moved_to = q.transfer(id);
            moved_to.is_some()
        });
        moved_to
    }

    pub fn clear(&self, doctor: Option<&DoctorId>) -> usize {
        let mut removed = 0;
        self.mutate_if(|q| {
            removed = q.clear(doctor);
            removed > 0
        });
        removed
    }

    /// Persist and publish while the caller still holds the write guard, so
    /// the saved blob and the event order follow the order of mutations.
    fn commit(&self, origin: ChangeOrigin, queue: &PatientQueue) {
        let snapshot = queue.patients().to_vec();
        if let Some(store) = &self.snapshots {
            if let Err(e) = store.save(&snapshot) {
                tracing::warn!(error = %e, "failed to persist queue");
            }
        }
        let subscribers = self.events.publish(QueueChange {
            origin,
            patients: Arc::new(snapshot),
        });
        tracing::debug!(?origin, subscribers, "queue changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    fn persistent() -> (QueueStore, SnapshotStore) {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let snapshots = SnapshotStore::new(Arc::new(db));
        (QueueStore::open(snapshots.clone()), snapshots)
    }

    #[tokio::test]
    async fn test_local_mutation_persists_then_announces() {
        let (store, snapshots) = persistent();
        let mut rx = store.subscribe();

        let id = store.add_patient("Kebede", DoctorId::secondary()).unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.origin, ChangeOrigin::Local);
        assert_eq!(change.patients[0].id, id);
        assert_eq!(snapshots.load(), store.snapshot());
    }

    #[tokio::test]
    async fn test_noop_mutations_are_not_announced() {
        let store = QueueStore::ephemeral();
        let id = store.add_patient("Abebe", DoctorId::primary()).unwrap();
        let mut rx = store.subscribe();

        assert!(!store.move_up(&id));
        assert!(store.remove_patient(&PatientId::from(1)).is_none());
        assert!(store.add_patient("  ", DoctorId::primary()).is_err());
        assert_eq!(store.clear(Some(&DoctorId::secondary())), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_snapshot_overwrites_cache() {
        let (store, snapshots) = persistent();
        store.add_patient("Local", DoctorId::primary()).unwrap();
        let mut rx = store.subscribe();

        let mut other = PatientQueue::new();
        other.add("Remote", DoctorId::secondary()).unwrap();
        store.apply_remote(other.patients().to_vec());

        let change = rx.recv().await.unwrap();
        assert_eq!(change.origin, ChangeOrigin::Remote);
        assert_eq!(store.snapshot(), other.patients());
        assert_eq!(snapshots.load(), other.patients());
    }

    #[test]
    fn test_applying_same_snapshot_twice_is_idempotent() {
        let store = QueueStore::ephemeral();
        let mut q = PatientQueue::new();
        q.add("Abebe", DoctorId::primary()).unwrap();

        store.apply_remote(q.patients().to_vec());
        let once = store.snapshot();
        store.apply_remote(q.patients().to_vec());
        assert_eq!(store.snapshot(), once);
    }

    #[test]
    fn test_reopen_restores_last_snapshot() {
        let db = Arc::new({
            let db = Database::in_memory().unwrap();
            db.initialize().unwrap();
            db
        });
        let first = QueueStore::open(SnapshotStore::new(db.clone()));
        first.add_patient("Almaz", DoctorId::primary()).unwrap();

        let second = QueueStore::open(SnapshotStore::new(db));
        assert_eq!(second.snapshot(), first.snapshot());
    }

    #[test]
    fn test_store_keeps_positions_dense() {
        let store = QueueStore::ephemeral();
        let a = store.add_patient("A", DoctorId::primary()).unwrap();
        let b = store.add_patient("B", DoctorId::primary()).unwrap();
        store.add_patient("C", DoctorId::primary()).unwrap();
        store.move_down(&a);
        store.transfer(&b);
        assert!(store.queue().positions_are_dense());
    }

    #[test]
    fn test_concurrent_commits_persist_and_publish_in_order() {
        let (store, snapshots) = persistent();
        let store = Arc::new(store);
        let mut rx = store.subscribe();

        let mut remote = PatientQueue::new();
        remote.add("Remote", DoctorId::secondary()).unwrap();
        let remote = remote.patients().to_vec();

        let workers: Vec<_> = (0..2)
            .map(|n| {
                let store = store.clone();
                let remote = remote.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        if n == 0 {
                            store.add_patient(&format!("Local {i}"), DoctorId::primary()).unwrap();
                        } else {
                            store.apply_remote(remote.clone());
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let mut last = None;
        while let Ok(change) = rx.try_recv() {
            last = Some(change);
        }
        let last = last.unwrap();
        assert_eq!(*last.patients, store.snapshot());
        assert_eq!(snapshots.load(), store.snapshot());
    }
}
