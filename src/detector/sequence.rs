//! Hardware sequence counter access.
//!
//! The detector counts frames it has finished writing. A datum request refers
//! to the frame being acquired now, which is not counted yet, so the frame it
//! names is always `counter + 1`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::control::Signal;
use crate::error::{DaqError, DaqResult};

/// What to do when the counter has not advanced since the previous datum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Register anyway and log a warning.
    #[default]
    Warn,
    /// Refuse the datum with [`DaqError::SequenceCollision`].
    Reject,
}

/// Read-only view of the "frames completed" counter.
#[derive(Debug, Clone)]
pub struct SequenceOracle {
    signal: Arc<dyn Signal>,
}

impl SequenceOracle {
    /// Wrap the counter signal.
    pub fn new(signal: Arc<dyn Signal>) -> Self {
        Self { signal }
    }

    /// PV name of the counter.
    pub fn name(&self) -> &str {
        self.signal.name()
    }

    /// Frames completed so far.
    ///
    /// Unreadable, non-integer or negative values are a
    /// [`DaqError::SequenceRead`].
    pub async fn completed(&self) -> DaqResult<u64> {
        let value = self.signal.get().await.map_err(|e| self.read_error(e))?;
        let raw = value
            .as_i64()
            .ok_or_else(|| self.read_error(format!("non-integer value {value}")))?;
        u64::try_from(raw).map_err(|_| self.read_error(format!("negative value {raw}")))
    }

    /// Sequence number of the frame currently being acquired.
    pub async fn next_seq_id(&self) -> DaqResult<u64> {
        Ok(self.completed().await? + 1)
    }

    fn read_error(&self, cause: impl std::fmt::Display) -> DaqError {
        DaqError::SequenceRead {
            signal: self.signal.name().to_string(),
            reason: cause.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlSystem, SimControlSystem};

    #[tokio::test]
    async fn test_next_is_completed_plus_one() {
        let cs = SimControlSystem::new();
        let oracle = SequenceOracle::new(cs.signal("DET:SequenceId"));
        assert_eq!(oracle.next_seq_id().await.unwrap(), 1);
        cs.set_pv("DET:SequenceId", 41);
        assert_eq!(oracle.completed().await.unwrap(), 41);
        assert_eq!(oracle.next_seq_id().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_negative_counter_is_read_error() {
        let cs = SimControlSystem::new();
        cs.set_pv("DET:SequenceId", -1);
        let oracle = SequenceOracle::new(cs.signal("DET:SequenceId"));
        assert!(matches!(
            oracle.completed().await,
            Err(DaqError::SequenceRead { .. })
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_counter_is_read_error() {
        let cs = SimControlSystem::new();
        cs.set_pv("DET:SequenceId", 1e30);
        let oracle = SequenceOracle::new(cs.signal("DET:SequenceId"));
        assert!(matches!(
            oracle.completed().await,
            Err(DaqError::SequenceRead { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnected_counter_is_read_error() {
        let cs = SimControlSystem::new();
        cs.disconnect("DET:SequenceId");
        let oracle = SequenceOracle::new(cs.signal("DET:SequenceId"));
        assert!(matches!(
            oracle.next_seq_id().await,
            Err(DaqError::SequenceRead { .. })
        ));
    }

    #[test]
    fn test_policy_deserializes_snake_case() {
        let p: CollisionPolicy = serde_json::from_str("\"reject\"").unwrap();
        assert_eq!(p, CollisionPolicy::Reject);
        assert_eq!(CollisionPolicy::default(), CollisionPolicy::Warn);
    }
}
