//! Resource Registry boundary.
//!
//! The registry is the external catalog that makes frames on disk addressable:
//! a **Resource** names one storage location for a staged run, a **Datum**
//! names one frame (or point) inside it. The acquisition layer only ever
//! inserts; lookups exist for downstream consumers and for [`resolve`].
//!
//! ```text
//! Resource (1 per stage)
//!    │
//!    └── Datum (N, one per acquisition step)
//! ```
//!
//! The registry is injected as `Arc<dyn ResourceRegistry>` so tests can swap in
//! [`InMemoryRegistry`].

pub mod jsonl;
pub mod memory;
pub mod resolve;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub use jsonl::JsonlRegistry;
pub use memory::InMemoryRegistry;
pub use resolve::resolve_datum;

/// Handler spec for Eiger HDF5 series addressed by sequence id.
pub const SPEC_AD_EIGER2: &str = "AD_EIGER2";

/// Handler spec for per-point TIFF files.
pub const SPEC_AD_TIFF: &str = "AD_TIFF";

/// Errors raised by registry backends.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A resource with this id already exists.
    #[error("Resource '{0}' already registered")]
    DuplicateResource(ResourceId),

    /// A datum with this id already exists.
    #[error("Datum '{0}' already registered")]
    DuplicateDatum(DatumId),

    /// Datum refers to a resource the registry does not know.
    #[error("Unknown resource '{0}'")]
    UnknownResource(ResourceId),

    /// No datum with this id.
    #[error("Unknown datum '{0}'")]
    UnknownDatum(DatumId),

    /// Backend refused the write for its own reasons.
    #[error("Registry rejected write: {0}")]
    Rejected(String),

    /// Backend storage failure.
    #[error("Registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded.
    #[error("Registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for registry results.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Opaque identifier of a registered resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Mint a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of a registered datum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatumId(String);

impl DatumId {
    /// Mint a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DatumId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for DatumId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for DatumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short run identifier used in on-disk file names.
///
/// A v4 UUID with its final group dropped (`8-4-4-4`, 23 characters).
pub fn new_short_uid() -> String {
    let uid = Uuid::new_v4().to_string();
    match uid.rfind('-') {
        Some(idx) => uid[..idx].to_string(),
        None => uid,
    }
}

/// Catalog entry for one staged write destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique resource id
    pub id: ResourceId,
    /// Handler kind, e.g. [`SPEC_AD_EIGER2`]
    pub spec: String,
    /// Directory rendered from the path template at staging time
    pub root: PathBuf,
    /// Location handed to the handler (directory or file prefix)
    pub resource_path: PathBuf,
    /// Naming pattern configured on the hardware writer
    pub name_pattern: String,
    /// Static parameters, e.g. `images_per_file`
    pub params: Map<String, Value>,
    /// Staging timestamp (seconds since the Unix epoch)
    pub time: f64,
}

impl Resource {
    /// Build a resource with a fresh id.
    pub fn new(spec: &str, root: impl Into<PathBuf>, resource_path: impl Into<PathBuf>) -> Self {
        Self {
            id: ResourceId::new(),
            spec: spec.to_string(),
            root: root.into(),
            resource_path: resource_path.into(),
            name_pattern: String::new(),
            params: Map::new(),
            time: 0.0,
        }
    }

    /// Set the hardware naming pattern.
    pub fn with_name_pattern(mut self, pattern: &str) -> Self {
        self.name_pattern = pattern.to_string();
        self
    }

    /// Add a static parameter.
    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Set the staging timestamp.
    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    /// Storage directory of this resource.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Catalog entry for one frame or point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    /// Unique datum id
    pub id: DatumId,
    /// Owning resource (back-reference)
    pub resource: ResourceId,
    /// Per-datum parameters, e.g. `seq_id`
    pub params: Map<String, Value>,
}

impl Datum {
    /// Build a datum with a fresh id.
    pub fn new(resource: &ResourceId) -> Self {
        Self {
            id: DatumId::new(),
            resource: resource.clone(),
            params: Map::new(),
        }
    }

    /// Add a per-datum parameter.
    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Integer parameter lookup.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }
}

/// The external catalog of resources and datums.
///
/// Inserts are synchronous from the caller's point of view and durable on
/// return; callers perform no buffering or retry.
#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    /// Register a resource and return its id.
    async fn insert_resource(&self, resource: Resource) -> RegistryResult<ResourceId>;

    /// Register a datum against an existing resource.
    async fn insert_datum(&self, datum: Datum) -> RegistryResult<()>;

    /// Look up a resource.
    async fn resource(&self, id: &ResourceId) -> RegistryResult<Option<Resource>>;

    /// Look up a datum.
    async fn datum(&self, id: &DatumId) -> RegistryResult<Option<Datum>>;

    /// All datums registered against a resource, in insertion order.
    async fn datums_for(&self, resource: &ResourceId) -> RegistryResult<Vec<Datum>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uid_drops_last_group() {
        let uid = new_short_uid();
        assert_eq!(uid.len(), 23);
        assert_eq!(uid.split('-').count(), 4);
        assert_ne!(uid, new_short_uid());
    }

    #[test]
    fn test_resource_builder() {
        let res = Resource::new(SPEC_AD_EIGER2, "/data/2024/03/05/", "/data/2024/03/05/abc")
            .with_name_pattern("abc_$id")
            .with_param("images_per_file", 100);
        assert_eq!(res.spec, "AD_EIGER2");
        assert_eq!(res.params.get("images_per_file"), Some(&Value::from(100)));
        assert_eq!(res.root(), Path::new("/data/2024/03/05/"));
    }

    #[test]
    fn test_datum_param_lookup() {
        let res = ResourceId::new();
        let datum = Datum::new(&res).with_param("seq_id", 3u64);
        assert_eq!(datum.param_u64("seq_id"), Some(3));
        assert_eq!(datum.resource, res);
        assert_eq!(datum.param_u64("point_number"), None);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = DatumId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
