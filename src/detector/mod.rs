//! Detector composition and acquisition lifecycle.
//!
//! A [`Detector`] is assembled from parts instead of inherited behaviour:
//!
//! - a [`TriggerStrategy`] (how to take one frame)
//! - an optional [`FileWriter`] (where frames go and how they are catalogued)
//! - ordered [`StageSettings`] (what must hold while staged)
//! - named read and configuration signals (what goes into events)
//!
//! All operations on one detector are serialized through an async mutex, and
//! the [`Lifecycle`] guard rejects out-of-order calls:
//!
//! ```text
//! stage → (trigger → generate_datum → read)* → unstage
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let det = factory::build_detector(&definition, &control_system, registry)?;
//! det.stage(Local::now()).await?;
//! det.trigger().await?;
//! let datum = det.generate_datum(&det.image_key(), now).await?;
//! det.unstage().await?;
//! ```

pub mod eiger;
pub mod factory;
pub mod file_writer;
pub mod lifecycle;
pub mod sequence;
pub mod stage_settings;
pub mod tiff;
pub mod trigger;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::control::{Signal, SignalValue, DEFAULT_POLL_INTERVAL};
use crate::error::{DaqError, DaqResult};
use crate::experiment::document::DataKey;
use crate::registry::{Datum, DatumId, Resource, ResourceId};

pub use eiger::{SequenceFileWriter, SequenceWriterSignals};
pub use file_writer::{render_path_template, FileWriter};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use sequence::{CollisionPolicy, SequenceOracle};
pub use stage_settings::StageSettings;
pub use tiff::{IterativeTiffWriter, TiffPluginSignals};
pub use trigger::{FastShutterTrigger, SingleTrigger, TriggerStrategy};

/// Bounds on the blocking waits a detector performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    /// Bound on each set-and-confirm while staging
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Bound on one acquisition
    #[serde(with = "humantime_serde")]
    pub trigger_timeout: Duration,
    /// Readback poll interval
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            trigger_timeout: Duration::from_secs(30),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// One value read from a device, with its read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Value
    pub value: SignalValue,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

struct DetectorInner {
    lifecycle: Lifecycle,
    trigger: Box<dyn TriggerStrategy>,
    file_writer: Option<Box<dyn FileWriter>>,
    stage_settings: StageSettings,
    last_datum: Option<DatumId>,
}

/// A detector assembled from a trigger strategy, a file writer and signals.
pub struct Detector {
    name: String,
    timing: Timing,
    read_signals: Vec<(String, Arc<dyn Signal>)>,
    configuration_signals: Vec<(String, Arc<dyn Signal>)>,
    inner: Mutex<DetectorInner>,
}

impl Detector {
    /// Start building a detector around a trigger strategy.
    pub fn builder(name: impl Into<String>, trigger: Box<dyn TriggerStrategy>) -> DetectorBuilder {
        let stage_settings = trigger.stage_settings();
        DetectorBuilder {
            name: name.into(),
            trigger,
            file_writer: None,
            stage_settings,
            read_signals: Vec::new(),
            configuration_signals: Vec::new(),
            timing: Timing::default(),
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event key under which the datum id of each frame is read.
    pub fn image_key(&self) -> String {
        format!("{}_image", self.name)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.lifecycle.state()
    }

    /// Resource of the current run, if the detector writes files and is staged.
    pub async fn active_resource(&self) -> Option<Resource> {
        let inner = self.inner.lock().await;
        inner
            .file_writer
            .as_ref()
            .and_then(|w| w.active_resource().cloned())
    }

    /// Datum registered by the last step of the current run.
    pub async fn last_datum(&self) -> Option<Datum> {
        let inner = self.inner.lock().await;
        inner
            .file_writer
            .as_ref()
            .and_then(|w| w.last_datum().cloned())
    }

    /// Apply stage settings and stage the file writer.
    ///
    /// Returns the resource id when the detector writes files. Any failure
    /// leaves the detector `Faulted` until [`Detector::unstage`].
    pub async fn stage(&self, now: DateTime<Local>) -> DaqResult<Option<ResourceId>> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.lifecycle.check_stage()?;

        if let Err(e) = inner
            .stage_settings
            .apply(self.timing.ack_timeout, self.timing.poll_interval)
            .await
        {
            inner.lifecycle.fault();
            return Err(DaqError::staging(&self.name, e));
        }

        let resource = match inner.file_writer.as_mut() {
            Some(writer) => match writer.stage(now).await {
                Ok(id) => Some(id),
                Err(e) => {
                    inner.lifecycle.fault();
                    return Err(e);
                }
            },
            None => None,
        };

        inner.lifecycle.staged();
        info!(
            device = %self.name,
            trigger = inner.trigger.kind(),
            settings = inner.stage_settings.len(),
            resource = ?resource.as_ref().map(ResourceId::as_str),
            "Staged detector"
        );
        Ok(resource)
    }

    /// Fire one acquisition. Exactly one [`Detector::generate_datum`] must
    /// follow before the next trigger.
    pub async fn trigger(&self) -> DaqResult<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.lifecycle.begin_trigger()?;
        if let Err(e) = inner.trigger.trigger(&self.timing).await {
            inner.lifecycle.trigger_failed();
            return Err(e);
        }
        Ok(())
    }

    /// Register the datum for the frame just triggered.
    ///
    /// Returns `None` for detectors without a file writer. Registry failures
    /// fault the detector; a failed sequence read only abandons the step.
    pub async fn generate_datum(&self, key: &str, timestamp: f64) -> DaqResult<Option<DatumId>> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.lifecycle.check_datum()?;

        let Some(writer) = inner.file_writer.as_mut() else {
            inner.lifecycle.datum_done();
            return Ok(None);
        };

        let result = writer.generate_datum(key, timestamp).await;
        inner.lifecycle.record(&result);
        inner.lifecycle.datum_done();
        let id = result?;
        inner.last_datum = Some(id.clone());
        Ok(Some(id))
    }

    /// Read every read signal, plus the last datum id under
    /// [`Detector::image_key`].
    pub async fn read(&self) -> DaqResult<BTreeMap<String, Reading>> {
        let mut out = read_all(&self.name, &self.read_signals).await?;
        if let Some(datum) = self.inner.lock().await.last_datum.clone() {
            out.insert(
                self.image_key(),
                Reading {
                    value: SignalValue::Str(datum.to_string()),
                    timestamp: now_seconds(),
                },
            );
        }
        Ok(out)
    }

    /// Read every configuration signal.
    pub async fn read_configuration(&self) -> DaqResult<BTreeMap<String, Reading>> {
        read_all(&self.name, &self.configuration_signals).await
    }

    /// Schema of [`Detector::read`] for descriptor documents.
    pub async fn describe(&self) -> BTreeMap<String, DataKey> {
        let mut keys: BTreeMap<String, DataKey> = self
            .read_signals
            .iter()
            .map(|(field, signal)| {
                (
                    format!("{}_{}", self.name, field),
                    DataKey::scalar(signal.name(), ""),
                )
            })
            .collect();
        if self.inner.lock().await.file_writer.is_some() {
            keys.insert(self.image_key(), DataKey::external(&self.name));
        }
        keys
    }

    /// Release the resource and restore stage settings.
    ///
    /// Safe in every state, including `Faulted`; a no-op when idle.
    pub async fn unstage(&self) -> DaqResult<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.lifecycle.state() == LifecycleState::Idle {
            return Ok(());
        }

        let writer_result = match inner.file_writer.as_mut() {
            Some(writer) => writer.unstage().await,
            None => Ok(()),
        };
        let settings_result = inner
            .stage_settings
            .restore(self.timing.ack_timeout, self.timing.poll_interval)
            .await;

        inner.lifecycle.unstaged();
        inner.last_datum = None;
        info!(device = %self.name, "Unstaged detector");

        if let Err(e) = &writer_result {
            warn!(device = %self.name, error = %e, "File writer unstage failed");
        }
        writer_result.and(settings_result)
    }
}

/// Builder for [`Detector`].
pub struct DetectorBuilder {
    name: String,
    trigger: Box<dyn TriggerStrategy>,
    file_writer: Option<Box<dyn FileWriter>>,
    stage_settings: StageSettings,
    read_signals: Vec<(String, Arc<dyn Signal>)>,
    configuration_signals: Vec<(String, Arc<dyn Signal>)>,
    timing: Timing,
}

impl DetectorBuilder {
    /// Attach a file writer.
    pub fn file_writer(mut self, writer: Box<dyn FileWriter>) -> Self {
        self.file_writer = Some(writer);
        self
    }

    /// Add (or override) a stage-only setting.
    pub fn stage_setting(mut self, signal: Arc<dyn Signal>, value: impl Into<SignalValue>) -> Self {
        self.stage_settings.set(signal, value);
        self
    }

    /// Add a signal read at every step.
    pub fn read_signal(mut self, field: &str, signal: Arc<dyn Signal>) -> Self {
        self.read_signals.push((field.to_string(), signal));
        self
    }

    /// Add a signal read once per run.
    pub fn configuration_signal(mut self, field: &str, signal: Arc<dyn Signal>) -> Self {
        self.configuration_signals.push((field.to_string(), signal));
        self
    }

    /// Override timing bounds.
    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Finish building.
    pub fn build(self) -> Detector {
        Detector {
            inner: Mutex::new(DetectorInner {
                lifecycle: Lifecycle::new(self.name.clone()),
                trigger: self.trigger,
                file_writer: self.file_writer,
                stage_settings: self.stage_settings,
                last_datum: None,
            }),
            name: self.name,
            timing: self.timing,
            read_signals: self.read_signals,
            configuration_signals: self.configuration_signals,
        }
    }
}

fn now_seconds() -> f64 {
    file_writer::epoch_seconds(&Local::now())
}

async fn read_all(
    device: &str,
    signals: &[(String, Arc<dyn Signal>)],
) -> DaqResult<BTreeMap<String, Reading>> {
    let mut out = BTreeMap::new();
    for (field, signal) in signals {
        let value = signal.get().await?;
        out.insert(
            format!("{device}_{field}"),
            Reading {
                value,
                timestamp: now_seconds(),
            },
        );
    }
    Ok(out)
}
