//! Iterative TIFF file writer.
//!
//! For cameras whose TIFF plugin writes one file per point. Staging points the
//! plugin at a fresh directory and file name, resets its file number and
//! registers one `AD_TIFF` resource; each datum carries the point number,
//! counted locally from 0. The file number on disk advances with the same
//! count because the plugin auto-increments.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tracing::{debug, info};

use super::file_writer::{epoch_seconds, render_path_template, FileWriter};
use super::stage_settings::StageSettings;
use super::Timing;
use crate::control::{set_and_wait_with_poll, Signal, SignalValue};
use crate::error::{DaqError, DaqResult};
use crate::registry::{
    new_short_uid, Datum, DatumId, Resource, ResourceId, ResourceRegistry, SPEC_AD_TIFF,
};

/// areaDetector template producing `<dir><name>_000042.tiff`.
pub const TIFF_FILE_TEMPLATE: &str = "%s%s_%6.6d.tiff";

/// PV handles of a TIFF plugin.
#[derive(Debug, Clone)]
pub struct TiffPluginSignals {
    /// `FilePath`
    pub file_path: Arc<dyn Signal>,
    /// `FileName`
    pub file_name: Arc<dyn Signal>,
    /// `FileTemplate`
    pub file_template: Arc<dyn Signal>,
    /// `FileNumber`
    pub file_number: Arc<dyn Signal>,
    /// `EnableCallbacks`
    pub enable: Arc<dyn Signal>,
    /// `AutoIncrement`
    pub auto_increment: Arc<dyn Signal>,
    /// `AutoSave`
    pub auto_save: Arc<dyn Signal>,
    /// `FileWriteMode`
    pub file_write_mode: Arc<dyn Signal>,
    /// Camera `NumImages` (frames per point)
    pub num_images: Arc<dyn Signal>,
}

/// File writer for per-point TIFF output.
pub struct IterativeTiffWriter {
    name: String,
    write_path_template: String,
    signals: TiffPluginSignals,
    plugin_settings: StageSettings,
    registry: Arc<dyn ResourceRegistry>,
    timing: Timing,
    active: Option<Resource>,
    point_counter: u64,
    last_datum: Option<Datum>,
}

impl IterativeTiffWriter {
    /// Create an unstaged writer.
    pub fn new(
        name: impl Into<String>,
        write_path_template: impl Into<String>,
        signals: TiffPluginSignals,
        registry: Arc<dyn ResourceRegistry>,
    ) -> Self {
        let plugin_settings = StageSettings::new()
            .with(Arc::clone(&signals.enable), 1)
            .with(Arc::clone(&signals.auto_increment), 1)
            .with(Arc::clone(&signals.auto_save), 1)
            .with(Arc::clone(&signals.file_write_mode), 0);
        Self {
            name: name.into(),
            write_path_template: write_path_template.into(),
            signals,
            plugin_settings,
            registry,
            timing: Timing::default(),
            active: None,
            point_counter: 0,
            last_datum: None,
        }
    }

    /// Override acknowledgement timeout and poll interval.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Points registered in the current run.
    pub fn points(&self) -> u64 {
        self.point_counter
    }

    async fn confirm(&self, signal: &Arc<dyn Signal>, value: SignalValue) -> DaqResult<()> {
        set_and_wait_with_poll(
            signal.as_ref(),
            value,
            self.timing.ack_timeout,
            self.timing.poll_interval,
        )
        .await
        .map_err(|e| DaqError::staging(&self.name, e))
    }

    async fn read_for_staging(&self, signal: &Arc<dyn Signal>) -> DaqResult<SignalValue> {
        signal
            .get()
            .await
            .map_err(|e| DaqError::staging(&self.name, e))
    }
}

#[async_trait]
impl FileWriter for IterativeTiffWriter {
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

        self.confirm(&self.signals.file_path, write_path.into()).await?;
        self.confirm(&self.signals.file_name, uid.clone().into())
            .await?;
        self.confirm(&self.signals.file_template, TIFF_FILE_TEMPLATE.into())
            .await?;
        self.confirm(&self.signals.file_number, SignalValue::Int(0))
            .await?;
        self.plugin_settings
            .apply(self.timing.ack_timeout, self.timing.poll_interval)
            .await
            .map_err(|e| DaqError::staging(&self.name, e))?;

        let root = self.read_for_staging(&self.signals.file_path).await?.as_str();
        let template = self
            .read_for_staging(&self.signals.file_template)
            .await?
            .as_str();
        let filename = self.read_for_staging(&self.signals.file_name).await?.as_str();
        let frames_per_point = self
            .read_for_staging(&self.signals.num_images)
            .await?
            .as_i64()
            .unwrap_or(1)
            .max(1);

        let mut resource = Resource::new(SPEC_AD_TIFF, &root, &root)
            .with_param("template", template)
            .with_param("filename", filename)
            .with_param("frame_per_point", frames_per_point)
            .with_time(epoch_seconds(&now));

        let id = self
            .registry
            .insert_resource(resource.clone())
            .await
            .map_err(|e| DaqError::staging(&self.name, e))?;
        resource.id = id.clone();

        info!(writer = %self.name, resource = %id, %root, "Staged TIFF resource");
        self.active = Some(resource);
        self.point_counter = 0;
        self.last_datum = None;
        Ok(id)
    }

    async fn generate_datum(&mut self, key: &str, timestamp: f64) -> DaqResult<DatumId> {
        let resource = self
            .active
            .as_ref()
            .ok_or_else(|| DaqError::NoActiveResource(self.name.clone()))?;

        let point_number = self.point_counter;
        let datum = Datum::new(&resource.id).with_param("point_number", point_number);
        let id = datum.id.clone();
        self.registry.insert_datum(datum.clone()).await?;
        self.point_counter += 1;
        self.last_datum = Some(datum);

        debug!(writer = %self.name, key, timestamp, point_number, datum = %id, "Registered datum");
        Ok(id)
    }

    async fn unstage(&mut self) -> DaqResult<()> {
        let restored = self
            .plugin_settings
            .restore(self.timing.ack_timeout, self.timing.poll_interval)
            .await;
        if let Some(resource) = self.active.take() {
            info!(
                writer = %self.name,
                resource = %resource.id,
                points = self.point_counter,
                "Released TIFF resource"
            );
        }
        self.point_counter = 0;
        self.last_datum = None;
        restored
    }

    fn active_resource(&self) -> Option<&Resource> {
        self.active.as_ref()
    }

    fn last_datum(&self) -> Option<&Datum> {
        self.last_datum.as_ref()
    }
}
