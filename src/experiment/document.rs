//! Document model for structured run data
//!
//! Runs are described by a stream of documents. Bulk detector data never
//! travels in events: an event carries a datum id and the file location is
//! found through the Resource and Datum documents.
//!
//! - **StartDoc**: run intent and metadata
//! - **DescriptorDoc**: schema and configuration of a data stream
//! - **ResourceDoc**: one file (or file series) written during the run
//! - **DatumDoc**: one addressable slice of a resource
//! - **EventDoc**: readings at one step, datum ids for external data
//! - **StopDoc**: completion status
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── ResourceDoc (one per file-writing detector)
//!    ├── DescriptorDoc (1)
//!    │       │
//!    │       ├── DatumDoc (one per file-writing detector per step)
//!    │       └── EventDoc (N)
//!    │
//! StopDoc (1)
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::control::SignalValue;
use crate::detector::Reading;
use crate::registry::{Datum, Resource};

/// `external` marker of data keys whose values are datum ids
pub const FILESTORE_EXTERNAL: &str = "FILESTORE:";

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    u64::try_from(Utc::now().timestamp_nanos_opt().unwrap_or_default()).unwrap_or_default()
}

/// Document types for run data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    Start(StartDoc),
    Descriptor(DescriptorDoc),
    Resource(ResourceDoc),
    Datum(DatumDoc),
    Event(EventDoc),
    Stop(StopDoc),
}

impl Document {
    /// Get the document UID
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Resource(d) => &d.uid,
            Document::Datum(d) => &d.datum_id,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Get the run UID this document belongs to
    ///
    /// Datum documents only link to their resource and return `None`.
    pub fn run_uid(&self) -> Option<&str> {
        match self {
            Document::Start(d) => Some(&d.uid), // Start doc UID is the run UID
            Document::Descriptor(d) => Some(&d.run_uid),
            Document::Resource(d) => Some(&d.run_uid),
            Document::Datum(_) => None,
            Document::Event(d) => Some(&d.run_uid),
            Document::Stop(d) => Some(&d.run_uid),
        }
    }

    /// Short name of the document kind
    pub fn kind(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Resource(_) => "resource",
            Document::Datum(_) => "datum",
            Document::Event(_) => "event",
            Document::Stop(_) => "stop",
        }
    }
}

/// Start document - emitted at the beginning of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Plan type that generated this run
    pub plan_type: String,
    /// User-friendly plan name
    pub plan_name: String,
    /// Plan arguments/configuration
    pub plan_args: HashMap<String, String>,
    /// Names of the detectors in the run
    pub detectors: Vec<String>,
    /// User-provided metadata
    pub metadata: HashMap<String, String>,
    /// Timestamp when run started
    pub time_ns: u64,
}

impl StartDoc {
    pub fn new(plan_type: &str, plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            plan_type: plan_type.to_string(),
            plan_name: plan_name.to_string(),
            plan_args: HashMap::new(),
            detectors: Vec::new(),
            metadata: HashMap::new(),
            time_ns: now_ns(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: &str) -> Self {
        self.plan_args.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_detector(mut self, name: &str) -> Self {
        self.detectors.push(name.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Descriptor document - defines schema for event data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Stream name (e.g., "primary")
    pub name: String,
    /// Schema for data fields
    pub data_keys: HashMap<String, DataKey>,
    /// Device configuration read once at descriptor creation
    pub configuration: HashMap<String, SignalValue>,
    /// Timestamp
    pub time_ns: u64,
}

impl DescriptorDoc {
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            data_keys: HashMap::new(),
            configuration: HashMap::new(),
            time_ns: now_ns(),
        }
    }

    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }

    pub fn with_config(mut self, key: &str, value: SignalValue) -> Self {
        self.configuration.insert(key.to_string(), value);
        self
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type: "number", "integer", "string", "array"
    pub dtype: String,
    /// Shape for arrays (empty for scalars)
    pub shape: Vec<i32>,
    /// Source PV or device
    pub source: String,
    /// Physical units
    pub units: String,
    /// Set when event values are datum ids for data stored elsewhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
}

impl DataKey {
    /// Create a scalar number data key
    pub fn scalar(source: &str, units: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            shape: vec![],
            source: source.to_string(),
            units: units.to_string(),
            external: None,
        }
    }

    /// Create a data key for an image stored by a file writer
    pub fn external(source: &str) -> Self {
        Self {
            dtype: "array".to_string(),
            shape: vec![],
            source: source.to_string(),
            units: String::new(),
            external: Some(FILESTORE_EXTERNAL.to_string()),
        }
    }
}

/// Resource document - a file series registered at stage time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDoc {
    /// Resource id as registered
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Handler spec (`AD_EIGER2`, `AD_TIFF`)
    pub spec: String,
    /// Root directory
    pub root: PathBuf,
    /// Path of the file series
    pub resource_path: PathBuf,
    /// Handler parameters
    pub resource_kwargs: Map<String, Value>,
    /// Always "posix"
    pub path_semantics: String,
}

impl ResourceDoc {
    pub fn from_resource(run_uid: &str, resource: &Resource) -> Self {
        Self {
            uid: resource.id.to_string(),
            run_uid: run_uid.to_string(),
            spec: resource.spec.clone(),
            root: resource.root.clone(),
            resource_path: resource.resource_path.clone(),
            resource_kwargs: resource.params.clone(),
            path_semantics: "posix".to_string(),
        }
    }
}

/// Datum document - one frame (or point) within a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatumDoc {
    /// Datum id, as placed in events
    pub datum_id: String,
    /// Resource this datum belongs to
    pub resource: String,
    /// Location parameters (`seq_id`, `point_number`)
    pub datum_kwargs: Map<String, Value>,
}

impl From<&Datum> for DatumDoc {
    fn from(datum: &Datum) -> Self {
        Self {
            datum_id: datum.id.to_string(),
            resource: datum.resource.to_string(),
            datum_kwargs: datum.params.clone(),
        }
    }
}

/// Event document - readings at one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID
    pub uid: String,
    /// Links to StartDoc (for quick run lookup)
    pub run_uid: String,
    /// Links to DescriptorDoc that defines schema
    pub descriptor_uid: String,
    /// Event sequence number within this descriptor stream, from 1
    pub seq_num: u32,
    /// Timestamp
    pub time_ns: u64,
    /// Values (field name -> value); datum ids for external keys
    pub data: HashMap<String, SignalValue>,
    /// Per-field timestamps in seconds since the epoch
    pub timestamps: HashMap<String, f64>,
    /// Fields whose values are datum ids not yet resolved to data
    pub filled: HashMap<String, bool>,
}

impl EventDoc {
    pub fn new(run_uid: &str, descriptor_uid: &str, seq_num: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time_ns: now_ns(),
            data: HashMap::new(),
            timestamps: HashMap::new(),
            filled: HashMap::new(),
        }
    }

    pub fn with_reading(mut self, field: &str, reading: Reading) -> Self {
        self.data.insert(field.to_string(), reading.value);
        self.timestamps.insert(field.to_string(), reading.timestamp);
        self
    }

    /// Mark `field` as an external reference.
    pub fn unfilled(mut self, field: &str) -> Self {
        self.filled.insert(field.to_string(), false);
        self
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Exit status: "success", "abort", "fail"
    pub exit_status: String,
    /// Reason for abort/failure
    pub reason: String,
    /// Timestamp when run ended
    pub time_ns: u64,
    /// Total events emitted
    pub num_events: u32,
}

impl StopDoc {
    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "success", "", num_events)
    }

    pub fn abort(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "abort", reason, num_events)
    }

    pub fn fail(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "fail", reason, num_events)
    }

    fn with_status(run_uid: &str, status: &str, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: status.to_string(),
            reason: reason.to_string(),
            time_ns: now_ns(),
            num_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ResourceId, SPEC_AD_EIGER2};

    #[test]
    fn test_start_doc_builder() {
        let doc = StartDoc::new("count", "count")
            .with_arg("num", "3")
            .with_detector("eiger4m")
            .with_metadata("operator", "Alice");

        assert_eq!(doc.plan_type, "count");
        assert_eq!(doc.plan_args.get("num"), Some(&"3".to_string()));
        assert_eq!(doc.detectors, vec!["eiger4m".to_string()]);
        assert_eq!(doc.metadata.get("operator"), Some(&"Alice".to_string()));
    }

    #[test]
    fn test_external_data_key_serialization() {
        let key = serde_json::to_value(DataKey::external("eiger4m")).unwrap();
        assert_eq!(key["external"], "FILESTORE:");
        let key = serde_json::to_value(DataKey::scalar("XF:Stats1:Total_RBV", "")).unwrap();
        assert!(key.get("external").is_none());
    }

    #[test]
    fn test_resource_and_datum_docs() {
        let resource = Resource::new(SPEC_AD_EIGER2, "/d/2024/", "/d/2024/abc")
            .with_param("images_per_file", 100);
        let doc = ResourceDoc::from_resource("run-1", &resource);
        assert_eq!(doc.spec, "AD_EIGER2");
        assert_eq!(doc.resource_kwargs["images_per_file"], 100);

        let datum = Datum::new(&ResourceId::from("res-1")).with_param("seq_id", 7);
        let doc = Document::Datum(DatumDoc::from(&datum));
        assert_eq!(doc.kind(), "datum");
        assert!(doc.run_uid().is_none());
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["type"], "datum");
        assert_eq!(json["datum_kwargs"]["seq_id"], 7);
    }

    #[test]
    fn test_event_doc() {
        let event = EventDoc::new("run-1", "desc-1", 1)
            .with_reading(
                "eiger4m_image",
                Reading {
                    value: SignalValue::from("datum-1"),
                    timestamp: 10.5,
                },
            )
            .unfilled("eiger4m_image");

        assert_eq!(event.seq_num, 1);
        assert_eq!(event.data["eiger4m_image"], SignalValue::from("datum-1"));
        assert_eq!(event.timestamps["eiger4m_image"], 10.5);
        assert_eq!(event.filled.get("eiger4m_image"), Some(&false));
    }

    #[test]
    fn test_stop_statuses() {
        assert_eq!(StopDoc::success("r", 3).exit_status, "success");
        let fail = StopDoc::fail("r", "boom", 1);
        assert_eq!((fail.exit_status.as_str(), fail.reason.as_str()), ("fail", "boom"));
    }
}
