//! Sequence-correlated file writer (Eiger-style).
//!
//! The detector writes HDF5 series itself and labels them with an internal
//! sequence counter. The writer stages a unique file name pattern, registers
//! one `AD_EIGER2` resource, and stamps each datum with the sequence number
//! of the frame in flight (`counter + 1`).
//!
//! # Example
//!
//! ```rust,ignore
//! let mut writer = SequenceFileWriter::new("eiger4m_file", "/data/%Y/%m/%d/", signals, registry);
//! let resource = writer.stage(Local::now()).await?;
//! let datum = writer.generate_datum("eiger4m_image", 0.0).await?; // seq_id = counter + 1
//! writer.unstage().await?;
//! ```

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use super::file_writer::{epoch_seconds, render_path_template, FileWriter};
use super::sequence::{CollisionPolicy, SequenceOracle};
use super::Timing;
use crate::control::{set_and_wait_with_poll, Signal};
use crate::error::{DaqError, DaqResult};
use crate::registry::{
    new_short_uid, Datum, DatumId, Resource, ResourceId, ResourceRegistry, SPEC_AD_EIGER2,
};

/// PV handles the sequence writer needs.
#[derive(Debug, Clone)]
pub struct SequenceWriterSignals {
    /// Output directory (`FilePath`, with readback)
    pub file_path: Arc<dyn Signal>,
    /// File name pattern (`FWNamePattern`, with readback)
    pub name_pattern: Arc<dyn Signal>,
    /// Images per HDF5 data file (`FWNImagesPerFile`, with readback)
    pub images_per_file: Arc<dyn Signal>,
    /// Frames completed (`SequenceId`, read-only)
    pub sequence_id: Arc<dyn Signal>,
}

/// Staging controller and datum correlator for sequence-numbered detectors.
pub struct SequenceFileWriter {
    name: String,
    write_path_template: String,
    signals: SequenceWriterSignals,
    oracle: SequenceOracle,
    registry: Arc<dyn ResourceRegistry>,
    timing: Timing,
    collision_policy: CollisionPolicy,
    active: Option<Resource>,
    last_seq_id: Option<u64>,
    last_datum: Option<Datum>,
}

impl SequenceFileWriter {
    /// Create an unstaged writer.
    pub fn new(
        name: impl Into<String>,
        write_path_template: impl Into<String>,
        signals: SequenceWriterSignals,
        registry: Arc<dyn ResourceRegistry>,
    ) -> Self {
        let oracle = SequenceOracle::new(Arc::clone(&signals.sequence_id));
        Self {
            name: name.into(),
            write_path_template: write_path_template.into(),
            signals,
            oracle,
            registry,
            timing: Timing::default(),
            collision_policy: CollisionPolicy::default(),
            active: None,
            last_seq_id: None,
            last_datum: None,
        }
    }

    /// Override acknowledgement timeout and poll interval.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Choose how repeated counter values are handled.
    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision_policy = policy;
        self
    }

    /// Path template rendered at each stage.
    pub fn write_path_template(&self) -> &str {
        &self.write_path_template
    }

    /// Change the template; takes effect at the next stage.
    pub fn set_write_path_template(&mut self, template: impl Into<String>) {
        self.write_path_template = template.into();
    }

    /// Last `seq_id` registered in the current run.
    pub fn last_seq_id(&self) -> Option<u64> {
        self.last_seq_id
    }

    async fn confirm(&self, signal: &Arc<dyn Signal>, value: String) -> DaqResult<()> {
        set_and_wait_with_poll(
            signal.as_ref(),
            value.into(),
            self.timing.ack_timeout,
            self.timing.poll_interval,
        )
        .await
        .map_err(|e| DaqError::staging(&self.name, e))
    }
}

#[async_trait]
impl FileWriter for SequenceFileWriter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stage(&mut self, now: DateTime<Local>) -> DaqResult<ResourceId> {
        if self.active.is_some() {
            return Err(DaqError::InvalidTransition {
                device: self.name.clone(),
                action: "stage",
                state: "staged".to_string(),
            });
        }

        let write_path = render_path_template(&self.write_path_template, &now)?;
        let uid = new_short_uid();
        let pattern = format!("{uid}_$id");
        debug!(writer = %self.name, %write_path, %pattern, "Configuring hardware writer");

        self.confirm(&self.signals.file_path, write_path).await?;
        self.confirm(&self.signals.name_pattern, pattern.clone())
            .await?;

        let root = self
            .signals
            .file_path
            .get()
            .await
            .map_err(|e| DaqError::staging(&self.name, e))?
            .as_str();
        let images_per_file = self
            .signals
            .images_per_file
            .get()
            .await
            .map_err(|e| DaqError::staging(&self.name, e))?
            .as_i64()
            .ok_or_else(|| DaqError::staging(&self.name, "images per file is not an integer"))?;

        let resource_path = Path::new(&root).join(&uid);
        let mut resource = Resource::new(SPEC_AD_EIGER2, &root, resource_path)
            .with_name_pattern(&pattern)
            .with_param("images_per_file", images_per_file)
            .with_time(epoch_seconds(&now));

        let id = self
            .registry
            .insert_resource(resource.clone())
            .await
            .map_err(|e| DaqError::staging(&self.name, e))?;
        resource.id = id.clone();

        info!(
            writer = %self.name,
            resource = %id,
            path = %resource.resource_path.display(),
            images_per_file,
            "Staged resource"
        );
        self.active = Some(resource);
        self.last_seq_id = None;
        self.last_datum = None;
        Ok(id)
    }

    async fn generate_datum(&mut self, key: &str, timestamp: f64) -> DaqResult<DatumId> {
        let resource = self
            .active
            .as_ref()
            .ok_or_else(|| DaqError::NoActiveResource(self.name.clone()))?;

        let completed = self.oracle.completed().await?;
        let seq_id = completed + 1;

        if let Some(last) = self.last_seq_id {
            if seq_id <= last {
                match self.collision_policy {
                    CollisionPolicy::Warn => warn!(
                        writer = %self.name,
                        seq_id,
                        last,
                        "Sequence counter did not advance since the previous datum"
                    ),
                    CollisionPolicy::Reject => {
                        return Err(DaqError::SequenceCollision {
                            device: self.name.clone(),
                            observed: completed,
                            last,
                        })
                    }
                }
            }
        }

        let datum = Datum::new(&resource.id).with_param("seq_id", seq_id);
        let id = datum.id.clone();
        self.registry.insert_datum(datum.clone()).await?;
        self.last_seq_id = Some(seq_id);
        self.last_datum = Some(datum);

        debug!(writer = %self.name, key, timestamp, seq_id, datum = %id, "Registered datum");
        Ok(id)
    }

    async fn unstage(&mut self) -> DaqResult<()> {
        if let Some(resource) = self.active.take() {
            info!(
                writer = %self.name,
                resource = %resource.id,
                last_seq_id = ?self.last_seq_id,
                "Released resource"
            );
        }
        self.last_seq_id = None;
        self.last_datum = None;
        Ok(())
    }

    fn active_resource(&self) -> Option<&Resource> {
        self.active.as_ref()
    }

    fn last_datum(&self) -> Option<&Datum> {
        self.last_datum.as_ref()
    }
}
