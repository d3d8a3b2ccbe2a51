//! Detector staging and resource/datum correlation for area-detector
//! data acquisition.
//!
//! A staged detector registers one [`registry::Resource`] describing where
//! its files will be written, then one [`registry::Datum`] per acquisition
//! step naming the exact frame inside that resource. Events carry only the
//! datum id; [`registry::resolve_datum`] turns it back into a file path.
//!
//! # Modules
//!
//! - [`control`]: signals, set-and-confirm, simulated control system
//! - [`detector`]: lifecycle, file writers, triggers, composition, factory
//! - [`registry`]: the resource/datum catalog and its backends
//! - [`experiment`]: run documents and the `count` plan
//! - [`config`]: Figment configuration
//! - [`logging`]: tracing subscriber setup

pub mod config;
pub mod control;
pub mod detector;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod registry;

pub use error::{DaqError, DaqResult};
