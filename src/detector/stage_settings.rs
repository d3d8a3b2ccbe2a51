//! Settings applied only while a device is staged.
//!
//! An ordered list of `(signal, value)` pairs. `apply` saves each original
//! value before writing the staged one; `restore` writes the originals back in
//! reverse order. The list is plain data owned by the device, so two devices
//! sharing a PV prefix never see each other's settings.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::control::{set_and_wait_with_poll, Signal, SignalValue};
use crate::error::DaqResult;

/// Ordered stage-only settings with their saved originals.
#[derive(Debug, Default)]
pub struct StageSettings {
    entries: Vec<(Arc<dyn Signal>, SignalValue)>,
    saved: Vec<(Arc<dyn Signal>, SignalValue)>,
}

impl StageSettings {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`StageSettings::set`].
    pub fn with(mut self, signal: Arc<dyn Signal>, value: impl Into<SignalValue>) -> Self {
        self.set(signal, value);
        self
    }

    /// Add a setting, replacing the value if the signal is already listed.
    ///
    /// Replacement keeps the original position in the list.
    pub fn set(&mut self, signal: Arc<dyn Signal>, value: impl Into<SignalValue>) {
        let value = value.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(s, _)| s.name() == signal.name())
        {
            entry.1 = value;
        } else {
            self.entries.push((signal, value));
        }
    }

    /// Append every entry of `other`, with [`StageSettings::set`] semantics.
    pub fn extend(&mut self, other: StageSettings) {
        for (signal, value) in other.entries {
            self.set(signal, value);
        }
    }

    /// Number of settings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no settings are listed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Signal names and staged values, in apply order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &SignalValue)> {
        self.entries.iter().map(|(s, v)| (s.name(), v))
    }

    /// Whether originals are currently saved (settings applied).
    pub fn is_applied(&self) -> bool {
        !self.saved.is_empty()
    }

    /// Save originals and write staged values, in order.
    ///
    /// Stops at the first failure; whatever was applied up to that point
    /// stays saved and is undone by [`StageSettings::restore`].
    pub async fn apply(&mut self, ack_timeout: Duration, poll: Duration) -> DaqResult<()> {
        for (signal, value) in &self.entries {
            let original = signal.get().await?;
            self.saved.push((Arc::clone(signal), original.clone()));
            debug!(signal = signal.name(), from = %original, to = %value, "Applying stage setting");
            set_and_wait_with_poll(signal.as_ref(), value.clone(), ack_timeout, poll).await?;
        }
        Ok(())
    }

    /// Write saved originals back in reverse order.
    ///
    /// Every saved value is attempted; the first failure is returned after
    /// the saved list has been cleared, so a second call is a no-op.
    pub async fn restore(&mut self, ack_timeout: Duration, poll: Duration) -> DaqResult<()> {
        let mut first_err = None;
        for (signal, original) in self.saved.drain(..).rev() {
            debug!(signal = signal.name(), to = %original, "Restoring stage setting");
            if let Err(e) = set_and_wait_with_poll(signal.as_ref(), original, ack_timeout, poll).await
            {
                warn!(signal = signal.name(), error = %e, "Failed to restore stage setting");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlSystem, SimControlSystem, DEFAULT_POLL_INTERVAL};

    const ACK: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_apply_then_restore() {
        let cs = SimControlSystem::new();
        cs.set_pv("CAM:TriggerMode_RBV", 1);
        cs.set_pv("CAM:NumTriggers_RBV", 10);

        let mut settings = StageSettings::new()
            .with(cs.signal_with_rbv("CAM:TriggerMode"), 0)
            .with(cs.signal_with_rbv("CAM:NumTriggers"), 1);
        settings.apply(ACK, DEFAULT_POLL_INTERVAL).await.unwrap();
        assert!(settings.is_applied());
        assert_eq!(cs.pv("CAM:TriggerMode_RBV"), Some(SignalValue::Int(0)));
        assert_eq!(cs.pv("CAM:NumTriggers_RBV"), Some(SignalValue::Int(1)));

        settings.restore(ACK, DEFAULT_POLL_INTERVAL).await.unwrap();
        assert_eq!(cs.pv("CAM:TriggerMode_RBV"), Some(SignalValue::Int(1)));
        assert_eq!(cs.pv("CAM:NumTriggers_RBV"), Some(SignalValue::Int(10)));
        assert!(!settings.is_applied());

        // Restore order is the reverse of apply order.
        let puts: Vec<String> = cs.puts().into_iter().map(|(pv, _)| pv).collect();
        assert_eq!(
            puts,
            vec![
                "CAM:TriggerMode",
                "CAM:NumTriggers",
                "CAM:NumTriggers",
                "CAM:TriggerMode"
            ]
        );
    }

    #[tokio::test]
    async fn test_set_replaces_in_place() {
        let cs = SimControlSystem::new();
        let mut settings = StageSettings::new()
            .with(cs.signal_with_rbv("A"), 1)
            .with(cs.signal_with_rbv("B"), 2);
        settings.set(cs.signal_with_rbv("A"), 5);
        let entries: Vec<_> = settings
            .entries()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("A_RBV".to_string(), SignalValue::Int(5)),
                ("B_RBV".to_string(), SignalValue::Int(2))
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_apply_is_restored() {
        let cs = SimControlSystem::new();
        cs.freeze_readback("B");
        let mut settings = StageSettings::new()
            .with(cs.signal_with_rbv("A"), 1)
            .with(cs.signal_with_rbv("B"), 2);
        assert!(settings.apply(ACK, DEFAULT_POLL_INTERVAL).await.is_err());
        assert!(settings.is_applied());

        cs.thaw_readback("B");
        settings.restore(ACK, DEFAULT_POLL_INTERVAL).await.unwrap();
        assert_eq!(cs.pv("A_RBV"), Some(SignalValue::Int(0)));
        // Second restore has nothing left to do.
        cs.clear_log();
        settings.restore(ACK, DEFAULT_POLL_INTERVAL).await.unwrap();
        assert!(cs.puts().is_empty());
    }
}
