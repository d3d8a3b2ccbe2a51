//! Control-system boundary.
//!
//! The facility control system exposes named process variables (PVs). This
//! module only models what the acquisition layer needs from it: reading a
//! value, writing a value, and the blocking set-and-confirm primitive used
//! while staging. The wire protocol is owned by whatever implements
//! [`ControlSystem`].
//!
//! # Example
//!
//! ```rust,ignore
//! let cs = SimControlSystem::new();
//! let path = cs.signal_with_rbv("XF:11IDB-ES{Det:Eig4M}cam1:FilePath");
//! set_and_wait(path.as_ref(), "/data/2024/03/05/".into(), Duration::from_secs(2)).await?;
//! ```

pub mod sim;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};

use crate::error::{DaqError, DaqResult};

pub use sim::SimControlSystem;

/// Interval between readback polls in [`set_and_wait`] and trigger waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Absolute tolerance used when comparing floating point readbacks.
const FLOAT_TOLERANCE: f64 = 1e-9;

/// Value carried by a PV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    /// Integer (enum index, counter, flag).
    Int(i64),
    /// Floating point.
    Float(f64),
    /// String (paths, patterns, enum labels).
    Str(String),
}

impl SignalValue {
    /// Integer view; floats with no fractional part are accepted when they
    /// fit in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        // 2^63, exactly representable.
        const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;
        match self {
            SignalValue::Int(v) => Some(*v),
            SignalValue::Float(v) if v.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(v) => {
                Some(*v as i64)
            }
            SignalValue::Str(s) => s.trim().parse().ok(),
            SignalValue::Float(_) => None,
        }
    }

    /// Floating point view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Int(v) => Some(*v as f64),
            SignalValue::Float(v) => Some(*v),
            SignalValue::Str(s) => s.trim().parse().ok(),
        }
    }

    /// String view; numbers are formatted.
    pub fn as_str(&self) -> String {
        match self {
            SignalValue::Str(s) => s.clone(),
            SignalValue::Int(v) => v.to_string(),
            SignalValue::Float(v) => v.to_string(),
        }
    }

    /// Readback comparison used by set-and-confirm.
    ///
    /// Numeric values compare numerically (ints against floats included),
    /// strings compare exactly.
    pub fn matches(&self, other: &SignalValue) -> bool {
        match (self, other) {
            (SignalValue::Str(a), SignalValue::Str(b)) => a == b,
            (SignalValue::Str(_), _) | (_, SignalValue::Str(_)) => false,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => (x - y).abs() <= FLOAT_TOLERANCE,
                _ => false,
            },
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Int(v) => write!(f, "{v}"),
            SignalValue::Float(v) => write!(f, "{v}"),
            SignalValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for SignalValue {
    fn from(v: i64) -> Self {
        SignalValue::Int(v)
    }
}

impl From<i32> for SignalValue {
    fn from(v: i32) -> Self {
        SignalValue::Int(i64::from(v))
    }
}

impl From<f64> for SignalValue {
    fn from(v: f64) -> Self {
        SignalValue::Float(v)
    }
}

impl From<&str> for SignalValue {
    fn from(v: &str) -> Self {
        SignalValue::Str(v.to_string())
    }
}

impl From<String> for SignalValue {
    fn from(v: String) -> Self {
        SignalValue::Str(v)
    }
}

/// Handle to one PV (or a setpoint/readback pair).
#[async_trait]
pub trait Signal: Send + Sync + fmt::Debug {
    /// PV name used for reads.
    fn name(&self) -> &str;

    /// Read the current value.
    async fn get(&self) -> DaqResult<SignalValue>;

    /// Write a value without waiting for confirmation.
    async fn put(&self, value: SignalValue) -> DaqResult<()>;
}

/// Factory for signal handles in the control-system namespace.
pub trait ControlSystem: Send + Sync {
    /// Signal that reads and writes the same PV.
    fn signal(&self, pv: &str) -> Arc<dyn Signal>;

    /// Signal that writes `pv` and reads back `pv_RBV`.
    fn signal_with_rbv(&self, pv: &str) -> Arc<dyn Signal>;

    /// Signal that writes `write_pv` and reads `read_pv`.
    fn signal_pair(&self, read_pv: &str, write_pv: &str) -> Arc<dyn Signal>;
}

/// Write `value` and block until the readback confirms it.
///
/// The wait is bounded by `limit`; exceeding it yields
/// [`DaqError::SignalTimeout`]. Nothing is retried.
pub async fn set_and_wait(
    signal: &dyn Signal,
    value: SignalValue,
    limit: Duration,
) -> DaqResult<()> {
    set_and_wait_with_poll(signal, value, limit, DEFAULT_POLL_INTERVAL).await
}

/// [`set_and_wait`] with an explicit poll interval.
pub async fn set_and_wait_with_poll(
    signal: &dyn Signal,
    value: SignalValue,
    limit: Duration,
    poll: Duration,
) -> DaqResult<()> {
    signal.put(value.clone()).await?;
    wait_for_value(signal, &value, limit, poll).await
}

/// Poll `signal` until it reads `expected` or `limit` elapses.
pub async fn wait_for_value(
    signal: &dyn Signal,
    expected: &SignalValue,
    limit: Duration,
    poll: Duration,
) -> DaqResult<()> {
    let confirmed = timeout(limit, async {
        loop {
            if signal.get().await?.matches(expected) {
                return Ok::<(), DaqError>(());
            }
            sleep(poll).await;
        }
    })
    .await;

    match confirmed {
        Ok(result) => result,
        Err(_) => Err(DaqError::SignalTimeout {
            signal: signal.name().to_string(),
            expected: expected.to_string(),
            timeout: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_matching() {
        assert!(SignalValue::Int(3).matches(&SignalValue::Float(3.0)));
        assert!(!SignalValue::Int(3).matches(&SignalValue::Str("3".into())));
        assert!(SignalValue::from("/data/").matches(&"/data/".into()));
        assert!(!SignalValue::from("/data/").matches(&"/data".into()));
    }

    #[test]
    fn test_value_views() {
        assert_eq!(SignalValue::Float(12.0).as_i64(), Some(12));
        assert_eq!(SignalValue::Float(12.5).as_i64(), None);
        assert_eq!(SignalValue::Float(1e30).as_i64(), None);
        assert_eq!(SignalValue::Float(-1e30).as_i64(), None);
        assert_eq!(SignalValue::Float(f64::INFINITY).as_i64(), None);
        assert_eq!(SignalValue::Str(" 7 ".into()).as_i64(), Some(7));
        assert_eq!(SignalValue::Int(5).as_str(), "5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_and_wait_confirms() {
        let cs = SimControlSystem::new();
        let sig = cs.signal_with_rbv("DET:FilePath");
        set_and_wait(sig.as_ref(), "/d/2024/".into(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(cs.pv("DET:FilePath_RBV"), Some("/d/2024/".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_and_wait_times_out_on_frozen_readback() {
        let cs = SimControlSystem::new();
        cs.freeze_readback("DET:FilePath");
        let sig = cs.signal_with_rbv("DET:FilePath");
        let err = set_and_wait(sig.as_ref(), "/d/".into(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::SignalTimeout { .. }));
    }
}
