//! In-memory registry for tests.
//!
//! Behaves like a real catalog (duplicate and dangling-reference checks) and
//! adds controllable failure injection plus call counting so tests can assert
//! that an operation performed no registry writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    Datum, DatumId, RegistryError, RegistryResult, Resource, ResourceId, ResourceRegistry,
};

#[derive(Default)]
struct Tables {
    resources: HashMap<ResourceId, Resource>,
    datums: HashMap<DatumId, Datum>,
    datum_order: Vec<DatumId>,
}

/// Thread-safe in-memory catalog.
///
/// # Example
///
/// ```
/// use daq_filestore::registry::InMemoryRegistry;
///
/// let registry = InMemoryRegistry::new();
/// registry.reject_next_resource();
/// assert_eq!(registry.resource_inserts(), 0);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    tables: Arc<RwLock<Tables>>,
    reject_next_resource: Arc<AtomicBool>,
    reject_next_datum: Arc<AtomicBool>,
    assign_ids: Arc<AtomicBool>,
    resource_calls: Arc<AtomicUsize>,
    datum_calls: Arc<AtomicUsize>,
}

impl InMemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `insert_resource` call.
    pub fn reject_next_resource(&self) {
        self.reject_next_resource.store(true, Ordering::SeqCst);
    }

    /// Reject the next `insert_datum` call.
    pub fn reject_next_datum(&self) {
        self.reject_next_datum.store(true, Ordering::SeqCst);
    }

    /// Store resources under ids minted here instead of the caller's.
    pub fn assign_resource_ids(&self) {
        self.assign_ids.store(true, Ordering::SeqCst);
    }

    /// Number of `insert_resource` calls, successful or not.
    pub fn resource_inserts(&self) -> usize {
        self.resource_calls.load(Ordering::SeqCst)
    }

    /// Number of `insert_datum` calls, successful or not.
    pub fn datum_inserts(&self) -> usize {
        self.datum_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored resource.
    pub fn resources(&self) -> Vec<Resource> {
        self.tables.read().resources.values().cloned().collect()
    }

    /// Snapshot of every stored datum in insertion order.
    pub fn datums(&self) -> Vec<Datum> {
        let tables = self.tables.read();
        tables
            .datum_order
            .iter()
            .filter_map(|id| tables.datums.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl ResourceRegistry for InMemoryRegistry {
    async fn insert_resource(&self, mut resource: Resource) -> RegistryResult<ResourceId> {
        self.resource_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_next_resource.swap(false, Ordering::SeqCst) {
            return Err(RegistryError::Rejected("injected resource failure".into()));
        }
        if self.assign_ids.load(Ordering::SeqCst) {
            resource.id = ResourceId::new();
        }

        let mut tables = self.tables.write();
        if tables.resources.contains_key(&resource.id) {
            return Err(RegistryError::DuplicateResource(resource.id));
        }
        let id = resource.id.clone();
        tables.resources.insert(id.clone(), resource);
        Ok(id)
    }

    async fn insert_datum(&self, datum: Datum) -> RegistryResult<()> {
        self.datum_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_next_datum.swap(false, Ordering::SeqCst) {
            return Err(RegistryError::Rejected("injected datum failure".into()));
        }

        let mut tables = self.tables.write();
        if !tables.resources.contains_key(&datum.resource) {
            return Err(RegistryError::UnknownResource(datum.resource));
        }
        if tables.datums.contains_key(&datum.id) {
            return Err(RegistryError::DuplicateDatum(datum.id));
        }
        tables.datum_order.push(datum.id.clone());
        tables.datums.insert(datum.id.clone(), datum);
        Ok(())
    }

    async fn resource(&self, id: &ResourceId) -> RegistryResult<Option<Resource>> {
        Ok(self.tables.read().resources.get(id).cloned())
    }

    async fn datum(&self, id: &DatumId) -> RegistryResult<Option<Datum>> {
        Ok(self.tables.read().datums.get(id).cloned())
    }

    async fn datums_for(&self, resource: &ResourceId) -> RegistryResult<Vec<Datum>> {
        Ok(self
            .datums()
            .into_iter()
            .filter(|d| &d.resource == resource)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SPEC_AD_EIGER2;
    use tokio_test::assert_ok;

    fn resource() -> Resource {
        Resource::new(SPEC_AD_EIGER2, "/d/", "/d/run")
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let registry = InMemoryRegistry::new();
        let res = assert_ok!(registry.insert_resource(resource()).await);
        let datum = Datum::new(&res).with_param("seq_id", 1u64);
        let datum_id = datum.id.clone();
        assert_ok!(registry.insert_datum(datum).await);

        let found = registry.datum(&datum_id).await.unwrap().unwrap();
        assert_eq!(found.resource, res);
        assert_eq!(registry.datums_for(&res).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_resource_rejected() {
        let registry = InMemoryRegistry::new();
        let res = resource();
        registry.insert_resource(res.clone()).await.unwrap();
        let err = registry.insert_resource(res).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateResource(_)));
    }

    #[tokio::test]
    async fn test_dangling_datum_rejected() {
        let registry = InMemoryRegistry::new();
        let err = registry
            .insert_datum(Datum::new(&ResourceId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownResource(_)));
    }

    #[tokio::test]
    async fn test_assigned_resource_id_is_returned() {
        let registry = InMemoryRegistry::new();
        registry.assign_resource_ids();
        let res = resource();
        let local = res.id.clone();
        let id = registry.insert_resource(res).await.unwrap();
        assert_ne!(id, local);
        assert!(registry.resource(&id).await.unwrap().is_some());
        assert!(registry.resource(&local).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures_are_one_shot() {
        let registry = InMemoryRegistry::new();
        registry.reject_next_resource();
        assert!(registry.insert_resource(resource()).await.is_err());
        assert!(registry.insert_resource(resource()).await.is_ok());
        assert_eq!(registry.resource_inserts(), 2);
        assert_eq!(registry.resources().len(), 1);
    }
}
