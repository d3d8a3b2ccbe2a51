//! Run documents and the `count` plan.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_filestore::experiment::{count, Document};
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let run_uid = count(&detectors, 10, &tx).await?;
//! while let Ok(doc) = rx.try_recv() {
//!     if let Document::Datum(datum) = doc {
//!         println!("{} -> {:?}", datum.datum_id, datum.datum_kwargs);
//!     }
//! }
//! ```

pub mod document;
pub mod plan;

pub use document::{
    DataKey, DatumDoc, DescriptorDoc, Document, EventDoc, ResourceDoc, StartDoc, StopDoc,
};
pub use plan::count;
