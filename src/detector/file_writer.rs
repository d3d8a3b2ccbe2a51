//! File-writer strategies.
//!
//! A file writer is the part of a detector that owns the write destination:
//! it stages the hardware writer and registers a [`Resource`] once per run,
//! then registers one [`crate::registry::Datum`] per acquisition step.
//!
//! Two strategies exist:
//! - [`super::eiger::SequenceFileWriter`]: datums carry the hardware frame
//!   sequence number (`seq_id`).
//! - [`super::tiff::IterativeTiffWriter`]: datums carry a local point counter
//!   (`point_number`).
//!
//! Writers take `&mut self` for every lifecycle operation, so concurrent datum
//! generation on one staged run is ruled out by ownership.

use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};

use crate::error::{DaqError, DaqResult};
use crate::registry::{Datum, DatumId, Resource, ResourceId};

/// Stage/datum/unstage contract shared by all writer strategies.
#[async_trait]
pub trait FileWriter: Send + Sync {
    /// Writer name (used in errors and logs).
    fn name(&self) -> &str;

    /// Point the hardware at a fresh destination and register a resource.
    async fn stage(&mut self, now: DateTime<Local>) -> DaqResult<ResourceId>;

    /// Register the datum for the frame being acquired now.
    async fn generate_datum(&mut self, key: &str, timestamp: f64) -> DaqResult<DatumId>;

    /// Release the destination. No-op when nothing is staged.
    async fn unstage(&mut self) -> DaqResult<()>;

    /// Resource registered by the last successful `stage`, while staged.
    fn active_resource(&self) -> Option<&Resource>;

    /// Datum registered by the last successful `generate_datum` of this run.
    fn last_datum(&self) -> Option<&Datum>;
}

/// Render a strftime path template (`/data/%Y/%m/%d/`) at `now`.
///
/// Templates with unknown `%` specifiers are rejected instead of rendered.
pub fn render_path_template(template: &str, now: &DateTime<Local>) -> DaqResult<String> {
    let items: Vec<Item<'_>> = StrftimeItems::new(template).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(DaqError::InvalidTemplate(template.to_string()));
    }
    let mut out = String::with_capacity(template.len() + 8);
    write!(out, "{}", now.format_with_items(items.iter()))
        .map_err(|_| DaqError::InvalidTemplate(template.to_string()))?;
    Ok(out)
}

/// Seconds since the Unix epoch, as carried in documents.
pub fn epoch_seconds(now: &DateTime<Local>) -> f64 {
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) * 1e-6
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_render_daily_directory() {
        assert_eq!(
            render_path_template("/data/%Y/%m/%d/", &at(2024, 3, 5)).unwrap(),
            "/data/2024/03/05/"
        );
        assert_eq!(
            render_path_template("/d/%Y/", &at(2024, 1, 1)).unwrap(),
            "/d/2024/"
        );
    }

    #[test]
    fn test_template_without_placeholders_is_literal() {
        assert_eq!(
            render_path_template("/fixed/dir/", &at(2024, 1, 1)).unwrap(),
            "/fixed/dir/"
        );
    }

    #[test]
    fn test_invalid_template_rejected() {
        assert!(matches!(
            render_path_template("/data/%Q/", &at(2024, 1, 1)),
            Err(DaqError::InvalidTemplate(_))
        ));
    }
}
