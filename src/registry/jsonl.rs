//! Append-only JSON-lines registry.
//!
//! Stores resources in `resources.jsonl` and datums in `datums.jsonl` under a
//! root directory. Each insert appends one line and syncs the file before
//! returning, so a registered datum survives a crash of the acquisition
//! process. Existing files are replayed on [`JsonlRegistry::open`].
//!
//! A crash in the middle of an append leaves a torn final line. `open` drops
//! it with a warning and truncates the file back to the last complete record.
//! An unparsable line anywhere else is an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    Datum, DatumId, RegistryError, RegistryResult, Resource, ResourceId, ResourceRegistry,
};

const RESOURCES_FILE: &str = "resources.jsonl";
const DATUMS_FILE: &str = "datums.jsonl";

#[derive(Default)]
struct Index {
    resources: HashMap<ResourceId, Resource>,
    datums: HashMap<DatumId, Datum>,
    datum_order: Vec<DatumId>,
}

/// File-backed catalog.
pub struct JsonlRegistry {
    root: PathBuf,
    index: Mutex<Index>,
}

impl JsonlRegistry {
    /// Open (or create) a registry rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> RegistryResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let mut index = Index::default();
        for resource in read_lines::<Resource>(&root.join(RESOURCES_FILE)).await? {
            index.resources.insert(resource.id.clone(), resource);
        }
        for datum in read_lines::<Datum>(&root.join(DATUMS_FILE)).await? {
            index.datum_order.push(datum.id.clone());
            index.datums.insert(datum.id.clone(), datum);
        }
        debug!(
            root = %root.display(),
            resources = index.resources.len(),
            datums = index.datums.len(),
            "Opened JSONL registry"
        );

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    /// Directory holding the registry files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn append<T: Serialize>(&self, file: &str, record: &T) -> RegistryResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(file))
            .await?;
        handle.write_all(&line).await?;
        handle.sync_all().await?;
        Ok(())
    }
}

async fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> RegistryResult<Vec<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut offset = 0;
    let mut lines = Vec::new();
    for line in bytes.split_inclusive(|b| *b == b'\n') {
        if !line.trim_ascii().is_empty() {
            lines.push((offset, line));
        }
        offset += line.len();
    }

    let mut records = Vec::with_capacity(lines.len());
    let last = lines.len().saturating_sub(1);
    for (i, &(start, line)) in lines.iter().enumerate() {
        match serde_json::from_slice(line) {
            Ok(record) => records.push(record),
            Err(e) if i == last => {
                warn!(
                    file = %path.display(),
                    offset = start,
                    error = %e,
                    "Dropping torn trailing record"
                );
                truncate(path, start as u64).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(records)
}

async fn truncate(path: &Path, len: u64) -> RegistryResult<()> {
    let handle = OpenOptions::new().write(true).open(path).await?;
    handle.set_len(len).await?;
    handle.sync_all().await?;
    Ok(())
}

#[async_trait]
impl ResourceRegistry for JsonlRegistry {
    async fn insert_resource(&self, resource: Resource) -> RegistryResult<ResourceId> {
        let mut index = self.index.lock().await;
        if index.resources.contains_key(&resource.id) {
            return Err(RegistryError::DuplicateResource(resource.id));
        }
        self.append(RESOURCES_FILE, &resource).await?;
        let id = resource.id.clone();
        index.resources.insert(id.clone(), resource);
        Ok(id)
    }

    async fn insert_datum(&self, datum: Datum) -> RegistryResult<()> {
        let mut index = self.index.lock().await;
        if !index.resources.contains_key(&datum.resource) {
            return Err(RegistryError::UnknownResource(datum.resource));
        }
        if index.datums.contains_key(&datum.id) {
            return Err(RegistryError::DuplicateDatum(datum.id));
        }
        self.append(DATUMS_FILE, &datum).await?;
        index.datum_order.push(datum.id.clone());
        index.datums.insert(datum.id.clone(), datum);
        Ok(())
    }

    async fn resource(&self, id: &ResourceId) -> RegistryResult<Option<Resource>> {
        Ok(self.index.lock().await.resources.get(id).cloned())
    }

    async fn datum(&self, id: &DatumId) -> RegistryResult<Option<Datum>> {
        Ok(self.index.lock().await.datums.get(id).cloned())
    }

    async fn datums_for(&self, resource: &ResourceId) -> RegistryResult<Vec<Datum>> {
        let index = self.index.lock().await;
        Ok(index
            .datum_order
            .iter()
            .filter_map(|id| index.datums.get(id))
            .filter(|d| &d.resource == resource)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SPEC_AD_EIGER2;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let (res_id, datum_id) = {
            let registry = JsonlRegistry::open(dir.path()).await.unwrap();
            let res = Resource::new(SPEC_AD_EIGER2, "/d/2024/", "/d/2024/abc")
                .with_param("images_per_file", 10);
            let res_id = registry.insert_resource(res).await.unwrap();
            let datum = Datum::new(&res_id).with_param("seq_id", 1u64);
            let datum_id = datum.id.clone();
            registry.insert_datum(datum).await.unwrap();
            (res_id, datum_id)
        };

        let reopened = JsonlRegistry::open(dir.path()).await.unwrap();
        let res = reopened.resource(&res_id).await.unwrap().unwrap();
        assert_eq!(res.resource_path, PathBuf::from("/d/2024/abc"));
        let datum = reopened.datum(&datum_id).await.unwrap().unwrap();
        assert_eq!(datum.param_u64("seq_id"), Some(1));
    }

    #[tokio::test]
    async fn test_torn_trailing_record_is_dropped() {
        let dir = tempdir().unwrap();
        let res_id = {
            let registry = JsonlRegistry::open(dir.path()).await.unwrap();
            let res = Resource::new(SPEC_AD_EIGER2, "/d/2024/", "/d/2024/abc");
            registry.insert_resource(res).await.unwrap()
        };
        let path = dir.path().join(RESOURCES_FILE);
        let intact = std::fs::read_to_string(&path).unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, br#"{"id":"abc","spec":"AD_EI"#).unwrap();
        drop(file);

        let reopened = JsonlRegistry::open(dir.path()).await.unwrap();
        assert!(reopened.resource(&res_id).await.unwrap().is_some());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), intact);

        // Appends after recovery stay readable.
        let second = reopened
            .insert_resource(Resource::new(SPEC_AD_EIGER2, "/d/", "/d/def"))
            .await
            .unwrap();
        let again = JsonlRegistry::open(dir.path()).await.unwrap();
        assert!(again.resource(&res_id).await.unwrap().is_some());
        assert!(again.resource(&second).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_interior_record_fails_open() {
        let dir = tempdir().unwrap();
        {
            let registry = JsonlRegistry::open(dir.path()).await.unwrap();
            let res = Resource::new(SPEC_AD_EIGER2, "/d/2024/", "/d/2024/abc");
            registry.insert_resource(res).await.unwrap();
        }
        let path = dir.path().join(RESOURCES_FILE);
        let intact = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, format!("not json\n{intact}")).unwrap();

        assert!(matches!(
            JsonlRegistry::open(dir.path()).await,
            Err(RegistryError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_datum_is_not_written() {
        let dir = tempdir().unwrap();
        let registry = JsonlRegistry::open(dir.path()).await.unwrap();
        let err = registry
            .insert_datum(Datum::new(&ResourceId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownResource(_)));
        assert!(!dir.path().join(DATUMS_FILE).exists());
    }
}
