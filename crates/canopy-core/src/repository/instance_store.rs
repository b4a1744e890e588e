//! Persistence port for idle workflow instances.

use canopy_types::error::RepositoryError;
use canopy_types::instance::{InstanceSnapshot, InstanceStatus};
use dashmap::DashMap;
use uuid::Uuid;

/// Storage for [`InstanceSnapshot`]s written at persistable-idle points.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait InstanceStore: Send + Sync + 'static {
    /// Upsert the snapshot of an instance (replace by instance id).
    fn save(
        &self,
        snapshot: &InstanceSnapshot,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<InstanceSnapshot>, RepositoryError>>
    + Send;

    /// Delete a snapshot. Returns `true` if it existed.
    fn delete(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Snapshots whose last recorded status is `status`, oldest first.
    fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> impl std::future::Future<Output = Result<Vec<InstanceSnapshot>, RepositoryError>> + Send;
}

/// Process-local [`InstanceStore`].
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    snapshots: DashMap<Uuid, InstanceSnapshot>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl InstanceStore for InMemoryInstanceStore {
    async fn save(&self, snapshot: &InstanceSnapshot) -> Result<(), RepositoryError> {
        self.snapshots
            .insert(snapshot.instance_id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, instance_id: &Uuid) -> Result<Option<InstanceSnapshot>, RepositoryError> {
        Ok(self.snapshots.get(instance_id).map(|s| s.value().clone()))
    }

    async fn delete(&self, instance_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.snapshots.remove(instance_id).is_some())
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<InstanceSnapshot>, RepositoryError> {
        let mut matching: Vec<InstanceSnapshot> = self
            .snapshots
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by_key(|s| s.saved_at);
        Ok(matching)
    }
}
