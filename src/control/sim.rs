//! Simulated control system.
//!
//! Provides an in-process PV store for testing detectors without an IOC. It
//! provides:
//! - Setpoint/readback mirroring (`PV` → `PV_RBV`)
//! - Frozen readbacks to exercise set-and-confirm timeouts
//! - Disconnected PVs to exercise read failures
//! - A frame-writer simulation that clears the acquire PV after the exposure
//!   and advances a sequence counter after a write lag
//! - A put log for test verification
//!
//! PVs that were never written read as `0`, like a freshly booted IOC record.
//!
//! All timing uses `tokio::time::sleep`, so tests can run on a paused clock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::sleep;

use super::{ControlSystem, Signal, SignalValue};
use crate::error::{DaqError, DaqResult};

/// Timing of a simulated acquisition.
#[derive(Debug, Clone)]
struct FrameWriterSim {
    read_pv: String,
    counter_pv: String,
    exposure: Duration,
    write_lag: Duration,
}

#[derive(Default)]
struct SimState {
    pvs: RwLock<HashMap<String, SignalValue>>,
    frozen: RwLock<HashSet<String>>,
    disconnected: RwLock<HashSet<String>>,
    frame_writers: RwLock<HashMap<String, FrameWriterSim>>,
    put_log: Mutex<Vec<(String, SignalValue)>>,
}

impl SimState {
    fn read(&self, pv: &str) -> DaqResult<SignalValue> {
        if self.disconnected.read().contains(pv) {
            return Err(DaqError::Signal {
                signal: pv.to_string(),
                reason: "PV disconnected".to_string(),
            });
        }
        Ok(self
            .pvs
            .read()
            .get(pv)
            .cloned()
            .unwrap_or(SignalValue::Int(0)))
    }

    fn store(&self, pv: &str, value: SignalValue) {
        self.pvs.write().insert(pv.to_string(), value);
    }
}

/// In-memory control system for tests and demos.
///
/// # Example
///
/// ```
/// use daq_filestore::control::{ControlSystem, SimControlSystem};
///
/// let cs = SimControlSystem::new();
/// cs.set_pv("DET:cam1:SequenceId", 4);
/// assert_eq!(cs.pv("DET:cam1:SequenceId"), Some(4.into()));
/// ```
#[derive(Clone, Default)]
pub struct SimControlSystem {
    state: Arc<SimState>,
}

impl SimControlSystem {
    /// Create an empty control system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a PV directly, bypassing put hooks.
    pub fn set_pv(&self, pv: &str, value: impl Into<SignalValue>) {
        self.state.store(pv, value.into());
    }

    /// Current value of a PV, if it was ever written.
    pub fn pv(&self, pv: &str) -> Option<SignalValue> {
        self.state.pvs.read().get(pv).cloned()
    }

    /// Stop mirroring puts on `write_pv` to its readback.
    pub fn freeze_readback(&self, write_pv: &str) {
        self.state.frozen.write().insert(write_pv.to_string());
    }

    /// Resume mirroring puts on `write_pv`.
    pub fn thaw_readback(&self, write_pv: &str) {
        self.state.frozen.write().remove(write_pv);
    }

    /// Make reads and writes of `pv` fail.
    pub fn disconnect(&self, pv: &str) {
        self.state.disconnected.write().insert(pv.to_string());
    }

    /// Undo [`SimControlSystem::disconnect`].
    pub fn reconnect(&self, pv: &str) {
        self.state.disconnected.write().remove(pv);
    }

    /// Simulate a detector behind an acquire PV.
    ///
    /// A nonzero put on `acquire_pv` holds the acquire setpoint and `read_pv`
    /// high for `exposure`, clears both, then advances `counter_pv` by one
    /// after a further `write_lag`.
    pub fn attach_frame_writer(
        &self,
        acquire_pv: &str,
        read_pv: &str,
        counter_pv: &str,
        exposure: Duration,
        write_lag: Duration,
    ) {
        self.state.frame_writers.write().insert(
            acquire_pv.to_string(),
            FrameWriterSim {
                read_pv: read_pv.to_string(),
                counter_pv: counter_pv.to_string(),
                exposure,
                write_lag,
            },
        );
    }

    /// Every put issued so far, in order.
    pub fn puts(&self) -> Vec<(String, SignalValue)> {
        self.state.put_log.lock().clone()
    }

    /// Number of puts issued on `pv`.
    pub fn put_count(&self, pv: &str) -> usize {
        self.state
            .put_log
            .lock()
            .iter()
            .filter(|(name, _)| name == pv)
            .count()
    }

    /// Clear the put log.
    pub fn clear_log(&self) {
        self.state.put_log.lock().clear();
    }
}

impl ControlSystem for SimControlSystem {
    fn signal(&self, pv: &str) -> Arc<dyn Signal> {
        self.signal_pair(pv, pv)
    }

    fn signal_with_rbv(&self, pv: &str) -> Arc<dyn Signal> {
        self.signal_pair(&format!("{pv}_RBV"), pv)
    }

    fn signal_pair(&self, read_pv: &str, write_pv: &str) -> Arc<dyn Signal> {
        Arc::new(SimSignal {
            read_pv: read_pv.to_string(),
            write_pv: write_pv.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

struct SimSignal {
    read_pv: String,
    write_pv: String,
    state: Arc<SimState>,
}

impl std::fmt::Debug for SimSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimSignal")
            .field("read_pv", &self.read_pv)
            .field("write_pv", &self.write_pv)
            .finish()
    }
}

#[async_trait]
impl Signal for SimSignal {
    fn name(&self) -> &str {
        &self.read_pv
    }

    async fn get(&self) -> DaqResult<SignalValue> {
        self.state.read(&self.read_pv)
    }

    async fn put(&self, value: SignalValue) -> DaqResult<()> {
        if self.state.disconnected.read().contains(&self.write_pv) {
            return Err(DaqError::Signal {
                signal: self.write_pv.clone(),
                reason: "PV disconnected".to_string(),
            });
        }
        self.state
            .put_log
            .lock()
            .push((self.write_pv.clone(), value.clone()));

        self.state.store(&self.write_pv, value.clone());
        let frozen = self.state.frozen.read().contains(&self.write_pv);
        if self.read_pv != self.write_pv && !frozen {
            self.state.store(&self.read_pv, value.clone());
        }

        let writer = self.state.frame_writers.read().get(&self.write_pv).cloned();
        if let Some(writer) = writer {
            if value.as_i64().unwrap_or(0) != 0 {
                let state = Arc::clone(&self.state);
                let write_pv = self.write_pv.clone();
                tokio::spawn(async move {
                    sleep(writer.exposure).await;
                    state.store(&write_pv, SignalValue::Int(0));
                    state.store(&writer.read_pv, SignalValue::Int(0));
                    sleep(writer.write_lag).await;
                    let next = state
                        .read(&writer.counter_pv)
                        .ok()
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0)
                        + 1;
                    state.store(&writer.counter_pv, SignalValue::Int(next));
                });
            }
        }
        Ok(())
    }
}
