//! Custom error types for the acquisition layer.
//!
//! `DaqError` is the single error type surfaced by detectors, file writers and
//! the lifecycle guard. It is built with `thiserror` so that lower-level errors
//! (registry, configuration, I/O) convert with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Staging`**: the hardware did not acknowledge the write target, or the
//!   registry refused the resource. Fatal to the run.
//! - **`NoActiveResource`**: a datum was requested while idle or faulted.
//!   This is an ordering bug in the caller and is never swallowed.
//! - **`SequenceRead`**: the frame counter could not be read (disconnected,
//!   stale, or nonsensical value). Fatal for that datum only.
//! - **`Registry`**: the catalog rejected a datum. Fatal to the run because the
//!   frame is written whether or not it stays addressable.
//! - **`SequenceCollision`**: the frame counter did not advance between two
//!   datums and the detector is configured to reject that.
//! - **`InvalidTransition`** / **`Faulted`**: lifecycle ordering violations.
//!
//! No error in this crate is retried internally; retry policy belongs to the
//! caller.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::registry::RegistryError;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for staging, triggering and datum correlation.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Write target could not be staged.
    #[error("Staging failed for '{device}': {reason}")]
    Staging {
        /// Device (or file writer) name.
        device: String,
        /// Human-readable cause.
        reason: String,
    },

    /// `generate_datum` called outside `Staged`/`Acquiring`.
    #[error("No active resource on '{0}': stage the device before generating datums")]
    NoActiveResource(String),

    /// Hardware sequence counter could not be read.
    #[error("Sequence read failed on '{signal}': {reason}")]
    SequenceRead {
        /// PV of the sequence counter.
        signal: String,
        /// Human-readable cause.
        reason: String,
    },

    /// Resource registry rejected a write.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Sequence counter did not advance since the previous datum.
    #[error("Sequence collision on '{device}': counter reported {observed}, last registered seq_id was {last}")]
    SequenceCollision {
        /// Device name.
        device: String,
        /// Raw counter value just read.
        observed: u64,
        /// Last `seq_id` registered in this run.
        last: u64,
    },

    /// Operation is not legal in the current lifecycle state.
    #[error("Cannot {action} '{device}' while {state}")]
    InvalidTransition {
        /// Device name.
        device: String,
        /// Attempted operation.
        action: &'static str,
        /// Lifecycle state at the time of the attempt.
        state: String,
    },

    /// Device is faulted; only `unstage` is accepted.
    #[error("Device '{0}' is faulted; unstage and re-stage to recover")]
    Faulted(String),

    /// A set-and-confirm did not see the expected readback in time.
    #[error("Signal '{signal}' did not confirm {expected} within {timeout:?}")]
    SignalTimeout {
        /// PV that was written.
        signal: String,
        /// Value we waited for.
        expected: String,
        /// Bound on the wait.
        timeout: Duration,
    },

    /// Generic signal access failure (disconnected PV, type mismatch).
    #[error("Signal error on '{signal}': {reason}")]
    Signal {
        /// PV name.
        signal: String,
        /// Human-readable cause.
        reason: String,
    },

    /// Path template could not be rendered.
    #[error("Invalid path template '{0}'")]
    InvalidTemplate(String),

    /// Configuration loading or validation failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Wrap any error raised while staging into a [`DaqError::Staging`].
    pub fn staging(device: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        DaqError::Staging {
            device: device.into(),
            reason: cause.to_string(),
        }
    }

    /// Whether the lifecycle must enter `Faulted` after this error.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, DaqError::Staging { .. } | DaqError::Registry(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::NoActiveResource("eiger4m".to_string());
        assert_eq!(
            err.to_string(),
            "No active resource on 'eiger4m': stage the device before generating datums"
        );
    }

    #[test]
    fn test_staging_wraps_cause() {
        let err = DaqError::staging(
            "eiger4m_file",
            DaqError::SignalTimeout {
                signal: "XF:11IDB-ES{Det:Eig4M}cam1:FilePath".into(),
                expected: "\"/data/\"".into(),
                timeout: Duration::from_secs(1),
            },
        );
        assert!(err.to_string().contains("did not confirm"));
        assert!(err.is_fatal_to_run());
    }

    #[test]
    fn test_sequence_read_is_not_fatal() {
        let err = DaqError::SequenceRead {
            signal: "cam1:SequenceId".into(),
            reason: "disconnected".into(),
        };
        assert!(!err.is_fatal_to_run());
    }
}
