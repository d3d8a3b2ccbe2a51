//! Minimal orchestration: the `count` plan.
//!
//! `count` drives detectors through one run and emits the run's documents to
//! a channel. Detectors are unstaged whether the run succeeds or fails.

use std::sync::Arc;

use chrono::Local;
use futures::future::try_join_all;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use super::document::{
    DatumDoc, DescriptorDoc, Document, EventDoc, ResourceDoc, StartDoc, StopDoc,
};
use crate::detector::file_writer::epoch_seconds;
use crate::detector::Detector;
use crate::error::DaqResult;

/// Stream name of the events emitted by [`count`].
pub const PRIMARY_STREAM: &str = "primary";

/// Take `num` readings from every detector.
///
/// Returns the run uid. Every step triggers all detectors concurrently, then
/// registers one datum per file-writing detector and emits one event.
#[instrument(skip_all, fields(detectors = detectors.len(), num = num))]
pub async fn count(
    detectors: &[Arc<Detector>],
    num: u32,
    sink: &mpsc::UnboundedSender<Document>,
) -> DaqResult<String> {
    let mut start = StartDoc::new("count", "count").with_arg("num", &num.to_string());
    for det in detectors {
        start = start.with_detector(det.name());
    }
    let run_uid = start.uid.clone();
    emit(sink, Document::Start(start));

    let mut num_events = 0;
    let outcome = run(detectors, num, &run_uid, sink, &mut num_events).await;
    let unstaged = unstage_all(detectors).await;

    let stop = match (&outcome, &unstaged) {
        (Ok(()), Ok(())) => StopDoc::success(&run_uid, num_events),
        (Err(e), _) | (Ok(()), Err(e)) => StopDoc::fail(&run_uid, &e.to_string(), num_events),
    };
    info!(run_uid = %run_uid, status = %stop.exit_status, num_events, "Run finished");
    emit(sink, Document::Stop(stop));

    outcome.and(unstaged).map(|()| run_uid)
}

async fn run(
    detectors: &[Arc<Detector>],
    num: u32,
    run_uid: &str,
    sink: &mpsc::UnboundedSender<Document>,
    num_events: &mut u32,
) -> DaqResult<()> {
    let now = Local::now();
    for det in detectors {
        det.stage(now).await?;
        if let Some(resource) = det.active_resource().await {
            emit(
                sink,
                Document::Resource(ResourceDoc::from_resource(run_uid, &resource)),
            );
        }
    }

    let mut descriptor = DescriptorDoc::new(run_uid, PRIMARY_STREAM);
    for det in detectors {
        for (field, key) in det.describe().await {
            descriptor = descriptor.with_data_key(&field, key);
        }
        for (field, reading) in det.read_configuration().await? {
            descriptor = descriptor.with_config(&field, reading.value);
        }
    }
    let descriptor_uid = descriptor.uid.clone();
    emit(sink, Document::Descriptor(descriptor));

    for step in 1..=num {
        try_join_all(detectors.iter().map(|det| det.trigger())).await?;

        let mut event = EventDoc::new(run_uid, &descriptor_uid, step);
        for det in detectors {
            let key = det.image_key();
            if det
                .generate_datum(&key, epoch_seconds(&Local::now()))
                .await?
                .is_some()
            {
                if let Some(datum) = det.last_datum().await {
                    emit(sink, Document::Datum(DatumDoc::from(&datum)));
                }
                event = event.unfilled(&key);
            }
            for (field, reading) in det.read().await? {
                event = event.with_reading(&field, reading);
            }
        }
        emit(sink, Document::Event(event));
        *num_events = step;
    }
    Ok(())
}

/// Unstage every detector, returning the first failure after trying all.
async fn unstage_all(detectors: &[Arc<Detector>]) -> DaqResult<()> {
    let mut first_err = None;
    for det in detectors {
        if let Err(e) = det.unstage().await {
            warn!(device = det.name(), error = %e, "Unstage failed");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn emit(sink: &mpsc::UnboundedSender<Document>, doc: Document) {
    // A closed sink only means nobody is listening.
    let _ = sink.send(doc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlSystem, SimControlSystem};
    use crate::detector::{LifecycleState, SingleTrigger};

    #[tokio::test]
    async fn test_count_without_file_writer_emits_events() {
        let cs = SimControlSystem::new();
        cs.set_pv("CAM:Stats1:Total_RBV", 42);
        cs.attach_frame_writer(
            "CAM:cam1:Acquire",
            "CAM:cam1:Acquire_RBV",
            "CAM:cam1:ArrayCounter",
            std::time::Duration::from_millis(5),
            std::time::Duration::from_millis(1),
        );
        let det = Detector::builder(
            "cam",
            Box::new(SingleTrigger::new(
                cs.signal_with_rbv("CAM:cam1:Acquire"),
                cs.signal_with_rbv("CAM:cam1:ImageMode"),
            )),
        )
        .read_signal("stats1_total", cs.signal("CAM:Stats1:Total_RBV"))
        .build();
        let detectors = vec![Arc::new(det)];

        let (tx, mut rx) = mpsc::unbounded_channel();
        count(&detectors, 2, &tx).await.unwrap();
        drop(tx);

        let mut kinds = Vec::new();
        while let Some(doc) = rx.recv().await {
            if let Document::Event(event) = &doc {
                assert!(event.filled.is_empty());
                assert!(event.data.contains_key("cam_stats1_total"));
            }
            kinds.push(doc.kind());
        }
        assert_eq!(kinds, ["start", "descriptor", "event", "event", "stop"]);
        assert_eq!(detectors[0].state().await, LifecycleState::Idle);
    }
}
