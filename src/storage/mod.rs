pub mod db;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

pub use db::Database;

use crate::queue::Patient;

/// Fixed key the last-known queue is persisted under.
pub const PATIENTS_KEY: &str = "patients";

/// Open (creating if needed) the local database under `data_dir`.
pub fn init(data_dir: &Path) -> Result<Arc<Database>> {
    let db = Database::new(data_dir)?;
    db.initialize()?;
    Ok(Arc::new(db))
}

/// The single last-known snapshot an agent keeps between runs.
#[derive(Clone)]
pub struct SnapshotStore {
    db: Arc<Database>,
}

impl SnapshotStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Read the persisted queue. A missing or unreadable blob yields an empty
    /// queue so a surface can always start.
    pub fn load(&self) -> Vec<Patient> {
        let raw = match self.db.get(PATIENTS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted queue");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(patients) => patients,
            Err(e) => {
                tracing::warn!(error = %e, "persisted queue is corrupt, starting empty");
                Vec::new()
            }
        }
    }

    pub fn save(&self, patients: &[Patient]) -> Result<()> {
        let json = serde_json::to_string(patients).context("failed to encode queue")?;
        self.db.put(PATIENTS_KEY, &json)?;
        tracing::debug!(count = patients.len(), "queue persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DoctorId, PatientQueue};

    fn store() -> SnapshotStore {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        SnapshotStore::new(Arc::new(db))
    }

    #[test]
    fn test_empty_store_loads_empty_queue() {
        assert!(store().load().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let store = store();
        let mut q = PatientQueue::new();
        q.add("Abebe", DoctorId::primary()).unwrap();
        q.add("Kebede", DoctorId::secondary()).unwrap();

        store.save(q.patients()).unwrap();
        assert_eq!(store.load(), q.patients());
    }

    #[test]
    fn test_corrupt_blob_loads_empty() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.put(PATIENTS_KEY, "{not json").unwrap();
        assert!(SnapshotStore::new(Arc::new(db)).load().is_empty());
    }

    #[test]
    fn test_init_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested/.queue-relay");
        let db = init(&data_dir).unwrap();
        assert!(data_dir.join("queue.db").exists());
        SnapshotStore::new(db).save(&[]).unwrap();
    }
}
