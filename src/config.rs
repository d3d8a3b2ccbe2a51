//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DAQFS_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DAQFS_APPLICATION__LOG_LEVEL=debug
//! DAQFS_REGISTRY__BACKEND=jsonl
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "CHX"
//! log_level = "info"
//!
//! [registry]
//! backend = "jsonl"
//! root = "/var/lib/daqfs/registry"
//!
//! [[detectors]]
//! name = "eiger4m"
//! prefix = "XF:11IDB-ES{Det:Eig4M}"
//! kind = "eiger"
//! trigger = "fast"
//! trigger_prefix = "XF:11IDB-ES{Trigger:Eig4M}"
//! write_path_template = "/XF11ID/data/%Y/%m/%d/"
//! ack_timeout = "5s"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detector::{render_path_template, CollisionPolicy, Timing};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Resource registry backend
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Detector definitions
    #[serde(default)]
    pub detectors: Vec<DetectorDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq-filestore".to_string(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// Registry backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackend {
    /// Process-local tables
    #[default]
    Memory,
    /// Append-only JSON-lines files
    Jsonl,
}

/// Resource registry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    /// Backend
    #[serde(default)]
    pub backend: RegistryBackend,
    /// Directory of the JSONL files (required for `jsonl`)
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Detector family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Sequence-numbered HDF5 writer
    Eiger,
    /// GigE camera with optional TIFF plugin
    Prosilica,
}

/// Trigger mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Internal trigger through `cam1:Acquire`
    #[default]
    Single,
    /// External enable through a fast-shutter trigger box
    Fast,
}

/// One detector in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorDefinition {
    /// Device name, prefix of every event key
    pub name: String,
    /// PV prefix, e.g. `XF:11IDB-ES{Det:Eig4M}`
    pub prefix: String,
    /// Detector family
    pub kind: DetectorKind,
    /// Trigger mode
    #[serde(default)]
    pub trigger: TriggerKind,
    /// PV prefix of the trigger box (required for `fast`)
    #[serde(default)]
    pub trigger_prefix: Option<String>,
    /// strftime template of the write directory
    #[serde(default = "default_write_path_template")]
    pub write_path_template: String,
    /// Bound on each set-and-confirm during staging
    #[serde(default = "default_ack_timeout", with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Bound on one acquisition
    #[serde(default = "default_trigger_timeout", with = "humantime_serde")]
    pub trigger_timeout: Duration,
    /// Readback poll interval
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Handling of a sequence counter that did not advance
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
    /// Enable the TIFF file writer (prosilica only)
    #[serde(default)]
    pub tiff: bool,
}

impl DetectorDefinition {
    /// Timing bounds for this detector.
    pub fn timing(&self) -> Timing {
        Timing {
            ack_timeout: self.ack_timeout,
            trigger_timeout: self.trigger_timeout,
            poll_interval: self.poll_interval,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_write_path_template() -> String {
    "/data/%Y/%m/%d/".to_string()
}

fn default_ack_timeout() -> Duration {
    Timing::default().ack_timeout
}

fn default_trigger_timeout() -> Duration {
    Timing::default().trigger_timeout
}

fn default_poll_interval() -> Duration {
    Timing::default().poll_interval
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from a TOML file and `DAQFS_` environment variables.
    ///
    /// Environment variables take precedence. The result is validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("DAQFS_").split("__")),
        )
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment.extract().map_err(ConfigError::LoadError)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid
    /// - The JSONL backend has a root directory
    /// - Detector names are unique
    /// - Fast triggering names a trigger box, TIFF writing is prosilica-only
    /// - Write path templates render
    /// - The ack timeout is nonzero and the poll interval shorter than it
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.registry.backend == RegistryBackend::Jsonl && self.registry.root.is_none() {
            return Err(ConfigError::ValidationError(
                "The jsonl registry backend requires 'root'".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for det in &self.detectors {
            if !names.insert(det.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate detector name: '{}'",
                    det.name
                )));
            }
            validate_detector(det)?;
        }

        Ok(())
    }

    /// Look up a detector definition by name.
    pub fn detector(&self, name: &str) -> Option<&DetectorDefinition> {
        self.detectors.iter().find(|d| d.name == name)
    }
}

fn validate_detector(det: &DetectorDefinition) -> Result<(), ConfigError> {
    if det.name.is_empty() || det.prefix.is_empty() {
        return Err(ConfigError::ValidationError(
            "Detector 'name' and 'prefix' cannot be empty".to_string(),
        ));
    }
    if det.trigger == TriggerKind::Fast {
        if det.kind != DetectorKind::Eiger {
            return Err(ConfigError::ValidationError(format!(
                "Detector '{}': fast triggering is only supported for eiger",
                det.name
            )));
        }
        if det.trigger_prefix.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::ValidationError(format!(
                "Detector '{}': fast triggering requires 'trigger_prefix'",
                det.name
            )));
        }
    }
    if render_path_template(&det.write_path_template, &Local::now()).is_err() {
        return Err(ConfigError::ValidationError(format!(
            "Detector '{}': invalid write_path_template '{}'",
            det.name, det.write_path_template
        )));
    }
    if det.tiff && det.kind != DetectorKind::Prosilica {
        return Err(ConfigError::ValidationError(format!(
            "Detector '{}': 'tiff' is only supported for prosilica",
            det.name
        )));
    }
    if det.ack_timeout.is_zero() || det.poll_interval >= det.ack_timeout {
        return Err(ConfigError::ValidationError(format!(
            "Detector '{}': poll_interval must be shorter than a nonzero ack_timeout",
            det.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHX: &str = r#"
        [application]
        name = "CHX"
        log_level = "debug"

        [registry]
        backend = "jsonl"
        root = "/tmp/registry"

        [[detectors]]
        name = "eiger4m"
        prefix = "XF:11IDB-ES{Det:Eig4M}"
        kind = "eiger"
        trigger = "fast"
        trigger_prefix = "XF:11IDB-ES{Trigger:Eig4M}"
        ack_timeout = "2s"
        collision_policy = "reject"

        [[detectors]]
        name = "xray_cam"
        prefix = "XF:11IDA-BI{Bpm:1-Cam:1}"
        kind = "prosilica"
        tiff = true
    "#;

    #[test]
    fn test_parse_full_config() {
        let settings = Settings::from_toml_str(CHX).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.registry.backend, RegistryBackend::Jsonl);

        let eiger = settings.detector("eiger4m").unwrap();
        assert_eq!(eiger.trigger, TriggerKind::Fast);
        assert_eq!(eiger.ack_timeout, Duration::from_secs(2));
        assert_eq!(eiger.trigger_timeout, Duration::from_secs(30));
        assert_eq!(eiger.collision_policy, CollisionPolicy::Reject);
        assert_eq!(eiger.write_path_template, "/data/%Y/%m/%d/");

        let cam = settings.detector("xray_cam").unwrap();
        assert!(cam.tiff);
        assert_eq!(cam.trigger, TriggerKind::Single);
        assert_eq!(cam.timing().poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.registry.backend, RegistryBackend::Memory);
        assert!(settings.detectors.is_empty());
    }

    #[test]
    fn test_invalid_log_level() {
        let err = Settings::from_toml_str("[application]\nname = \"x\"\nlog_level = \"loud\"")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_jsonl_requires_root() {
        let err = Settings::from_toml_str("[registry]\nbackend = \"jsonl\"").unwrap_err();
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn test_fast_trigger_requires_box_prefix() {
        let toml = r#"
            [[detectors]]
            name = "eiger1m"
            prefix = "XF:11IDB-ES{Det:Eig1M}"
            kind = "eiger"
            trigger = "fast"
        "#;
        let err = Settings::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("trigger_prefix"));
    }

    #[test]
    fn test_bad_path_template_rejected_at_load() {
        let toml = r#"
            [[detectors]]
            name = "cam"
            prefix = "A:"
            kind = "prosilica"
            write_path_template = "/data/%Q/"
        "#;
        let err = Settings::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("write_path_template"));
    }

    #[test]
    fn test_duplicate_detector_names() {
        let toml = r#"
            [[detectors]]
            name = "cam"
            prefix = "A:"
            kind = "prosilica"

            [[detectors]]
            name = "cam"
            prefix = "B:"
            kind = "prosilica"
        "#;
        assert!(Settings::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_unknown_kind_is_load_error() {
        let toml = "[[detectors]]\nname = \"x\"\nprefix = \"X:\"\nkind = \"pilatus\"";
        assert!(matches!(
            Settings::from_toml_str(toml),
            Err(ConfigError::LoadError(_))
        ));
    }
}
