//! In-memory directory.
//!
//! Backs engine tests and single-host setups where all three services run
//! in one process. Semantics match the Redis backend: per-key atomic
//! operations, no transactions.

use crate::{Directory, DirectoryError, MirrorRecord};
use common::types::MeetingId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Directory over a shared in-process map.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    inner: Arc<Mutex<HashMap<MeetingId, MirrorRecord>>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record, builder style.
    #[must_use]
    pub fn with_record(self, id: MeetingId, record: MirrorRecord) -> Self {
        self.lock().insert(id, record);
        self
    }

    /// Number of published records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MeetingId, MirrorRecord>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Directory for MemoryDirectory {
    async fn get(&self, id: &MeetingId) -> Result<Option<MirrorRecord>, DirectoryError> {
        Ok(self.lock().get(id).cloned())
    }

    async fn set(&self, id: &MeetingId, record: &MirrorRecord) -> Result<(), DirectoryError> {
        self.lock().insert(id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &MeetingId) -> Result<(), DirectoryError> {
        self.lock().remove(id);
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), DirectoryError> {
        self.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn record(password: &str, ips: &[&str]) -> MirrorRecord {
        MirrorRecord::new(
            password,
            ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        )
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = MemoryDirectory::new();
        let id = MeetingId::from("123456789");

        assert_eq!(dir.get(&id).await.unwrap(), None);

        let rec = record("pw", &["10.0.0.1"]);
        dir.set(&id, &rec).await.unwrap();
        assert_eq!(dir.get(&id).await.unwrap(), Some(rec.clone()));

        // Replacement overwrites.
        let rec2 = record("pw", &["10.0.0.1", "10.0.0.2"]);
        dir.set(&id, &rec2).await.unwrap();
        assert_eq!(dir.get(&id).await.unwrap(), Some(rec2));

        dir.delete(&id).await.unwrap();
        assert_eq!(dir.get(&id).await.unwrap(), None);

        // Deleting an absent record is fine.
        dir.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_all_empties_the_namespace() {
        let dir = MemoryDirectory::new()
            .with_record(MeetingId::from("111111111"), record("a", &[]))
            .with_record(MeetingId::from("222222222"), record("b", &["10.0.0.1"]));

        assert_eq!(dir.len(), 2);
        dir.flush_all().await.unwrap();
        assert!(dir.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let dir = MemoryDirectory::new();
        let reader = dir.clone();
        let id = MeetingId::from("333333333");

        dir.set(&id, &record("pw", &["10.0.0.9"])).await.unwrap();
        let seen = reader.get(&id).await.unwrap().unwrap();
        assert!(seen.admits("10.0.0.9".parse().unwrap()));
    }
}
