//! Build detectors and registries from configuration.
//!
//! PV layout follows the areaDetector conventions used at the beamline:
//!
//! ```text
//! {prefix}cam1:        camera driver (Acquire, ImageMode, TriggerMode, ...)
//! {prefix}cam1:        Eiger file writer (FilePath, FWNamePattern, SequenceId)
//! {prefix}StatsN:      statistics plugins, N = 1..=5
//! {prefix}TIFF1:       TIFF plugin (prosilica)
//! {trigger_prefix}     fast-shutter trigger box (Mode-Cmd, Acquire-Cmd, ...)
//! ```

use std::sync::Arc;

use tracing::info;

use super::eiger::{SequenceFileWriter, SequenceWriterSignals};
use super::tiff::{IterativeTiffWriter, TiffPluginSignals};
use super::trigger::{FastShutterSignals, FastShutterTrigger, SingleTrigger, TriggerStrategy};
use super::Detector;
use crate::config::{
    ConfigError, DetectorDefinition, DetectorKind, RegistryBackend, RegistryConfig, Settings,
    TriggerKind,
};
use crate::control::ControlSystem;
use crate::error::DaqResult;
use crate::registry::{InMemoryRegistry, JsonlRegistry, ResourceRegistry};

const STATS_PLUGINS: u8 = 5;

const EIGER_CONFIGURATION: [(&str, &str); 9] = [
    ("beam_center_x", "cam1:BeamX"),
    ("beam_center_y", "cam1:BeamY"),
    ("wavelength", "cam1:Wavelength"),
    ("det_distance", "cam1:DetDist"),
    ("threshold_energy", "cam1:ThresholdEnergy"),
    ("photon_energy", "cam1:PhotonEnergy"),
    ("cam_acquire_time", "cam1:AcquireTime"),
    ("cam_acquire_period", "cam1:AcquirePeriod"),
    ("cam_num_images", "cam1:NumImages"),
];

/// Open the registry backend named in configuration.
pub async fn open_registry(config: &RegistryConfig) -> DaqResult<Arc<dyn ResourceRegistry>> {
    match config.backend {
        RegistryBackend::Memory => Ok(Arc::new(InMemoryRegistry::new())),
        RegistryBackend::Jsonl => {
            let root = config.root.as_ref().ok_or_else(|| {
                ConfigError::ValidationError("The jsonl registry backend requires 'root'".into())
            })?;
            let registry = JsonlRegistry::open(root).await?;
            Ok(Arc::new(registry))
        }
    }
}

/// Build every configured detector against one control system and registry.
pub fn build_detectors(
    settings: &Settings,
    cs: &dyn ControlSystem,
    registry: &Arc<dyn ResourceRegistry>,
) -> DaqResult<Vec<Arc<Detector>>> {
    settings
        .detectors
        .iter()
        .map(|def| build_detector(def, cs, Arc::clone(registry)).map(Arc::new))
        .collect()
}

/// Build one detector from its definition.
pub fn build_detector(
    def: &DetectorDefinition,
    cs: &dyn ControlSystem,
    registry: Arc<dyn ResourceRegistry>,
) -> DaqResult<Detector> {
    let detector = match def.kind {
        DetectorKind::Eiger => build_eiger(def, cs, registry)?,
        DetectorKind::Prosilica => build_prosilica(def, cs, registry),
    };
    info!(
        device = %def.name,
        prefix = %def.prefix,
        kind = ?def.kind,
        trigger = ?def.trigger,
        "Built detector"
    );
    Ok(detector)
}

/// Trigger box handles for a fast-triggered detector.
///
/// The returned trigger shares signals with the one inside the detector, so
/// it can program exposure and period before a run.
pub fn fast_shutter_trigger(
    def: &DetectorDefinition,
    cs: &dyn ControlSystem,
) -> DaqResult<FastShutterTrigger> {
    let tp = def
        .trigger_prefix
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "Detector '{}': fast triggering requires 'trigger_prefix'",
                def.name
            ))
        })?;
    Ok(FastShutterTrigger::new(FastShutterSignals {
        auto_shutter_mode: cs.signal_pair(&format!("{tp}Mode-Sts"), &format!("{tp}Mode-Cmd")),
        num_images: cs.signal(&format!("{tp}NumImages-SP")),
        exposure_time: cs.signal(&format!("{tp}ExposureTime-SP")),
        acquire_period: cs.signal(&format!("{tp}AcquirePeriod-SP")),
        acquire: cs.signal(&format!("{tp}Acquire-Cmd")),
    }))
}

fn single_trigger(prefix: &str, cs: &dyn ControlSystem) -> SingleTrigger {
    SingleTrigger::new(
        cs.signal_with_rbv(&format!("{prefix}cam1:Acquire")),
        cs.signal_with_rbv(&format!("{prefix}cam1:ImageMode")),
    )
}

fn build_eiger(
    def: &DetectorDefinition,
    cs: &dyn ControlSystem,
    registry: Arc<dyn ResourceRegistry>,
) -> DaqResult<Detector> {
    let p = &def.prefix;
    let timing = def.timing();

    let trigger: Box<dyn TriggerStrategy> = match def.trigger {
        TriggerKind::Single => Box::new(single_trigger(p, cs)),
        TriggerKind::Fast => Box::new(fast_shutter_trigger(def, cs)?),
    };

    let writer = SequenceFileWriter::new(
        format!("{}_file", def.name),
        def.write_path_template.clone(),
        SequenceWriterSignals {
            file_path: cs.signal_with_rbv(&format!("{p}cam1:FilePath")),
            name_pattern: cs.signal_with_rbv(&format!("{p}cam1:FWNamePattern")),
            images_per_file: cs.signal_with_rbv(&format!("{p}cam1:FWNImagesPerFile")),
            sequence_id: cs.signal(&format!("{p}cam1:SequenceId")),
        },
        registry,
    )
    .with_timing(timing)
    .with_collision_policy(def.collision_policy);

    let trigger_mode = cs.signal_with_rbv(&format!("{p}cam1:TriggerMode"));
    let shutter_mode = cs.signal_with_rbv(&format!("{p}cam1:ShutterMode"));

    let mut builder = Detector::builder(&def.name, trigger)
        .file_writer(Box::new(writer))
        .timing(timing);
    builder = match def.trigger {
        // Internal trigger, shutter driven from the EPICS PV
        TriggerKind::Single => builder
            .stage_setting(trigger_mode, 0)
            .stage_setting(shutter_mode, 1)
            .stage_setting(cs.signal_with_rbv(&format!("{p}cam1:NumTriggers")), 1),
        // External enable
        TriggerKind::Fast => builder
            .stage_setting(trigger_mode, 3)
            .stage_setting(shutter_mode, 0),
    };

    builder = with_stats_totals(builder, p, cs);
    for (field, suffix) in EIGER_CONFIGURATION {
        builder = builder.configuration_signal(field, cs.signal_with_rbv(&format!("{p}{suffix}")));
    }
    Ok(builder.build())
}

fn build_prosilica(
    def: &DetectorDefinition,
    cs: &dyn ControlSystem,
    registry: Arc<dyn ResourceRegistry>,
) -> Detector {
    let p = &def.prefix;
    let timing = def.timing();
    let tiff = format!("{p}TIFF1:");

    let mut builder = Detector::builder(&def.name, Box::new(single_trigger(p, cs))).timing(timing);
    for n in 1..=STATS_PLUGINS {
        builder = builder.stage_setting(
            cs.signal_with_rbv(&format!("{p}Stats{n}:BlockingCallbacks")),
            1,
        );
    }
    builder = builder
        .stage_setting(cs.signal_with_rbv(&format!("{p}ROI1:BlockingCallbacks")), 1)
        .stage_setting(cs.signal_with_rbv(&format!("{p}Trans1:BlockingCallbacks")), 1)
        .stage_setting(cs.signal_with_rbv(&format!("{p}cam1:TriggerMode")), "Fixed Rate");

    builder = if def.tiff {
        let writer = IterativeTiffWriter::new(
            format!("{}_tiff", def.name),
            def.write_path_template.clone(),
            TiffPluginSignals {
                file_path: cs.signal_with_rbv(&format!("{tiff}FilePath")),
                file_name: cs.signal_with_rbv(&format!("{tiff}FileName")),
                file_template: cs.signal_with_rbv(&format!("{tiff}FileTemplate")),
                file_number: cs.signal_with_rbv(&format!("{tiff}FileNumber")),
                enable: cs.signal_with_rbv(&format!("{tiff}EnableCallbacks")),
                auto_increment: cs.signal_with_rbv(&format!("{tiff}AutoIncrement")),
                auto_save: cs.signal_with_rbv(&format!("{tiff}AutoSave")),
                file_write_mode: cs.signal_with_rbv(&format!("{tiff}FileWriteMode")),
                num_images: cs.signal_with_rbv(&format!("{p}cam1:NumImages")),
            },
            registry,
        )
        .with_timing(timing);
        builder.file_writer(Box::new(writer))
    } else {
        // "No": keep the plugin from writing files nobody registers
        builder.stage_setting(cs.signal_with_rbv(&format!("{tiff}AutoSave")), 0)
    };

    with_stats_totals(builder, p, cs).build()
}

fn with_stats_totals(
    mut builder: super::DetectorBuilder,
    prefix: &str,
    cs: &dyn ControlSystem,
) -> super::DetectorBuilder {
    for n in 1..=STATS_PLUGINS {
        builder = builder.read_signal(
            &format!("stats{n}_total"),
            cs.signal(&format!("{prefix}Stats{n}:Total_RBV")),
        );
    }
    builder
}
