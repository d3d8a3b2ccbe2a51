//! Acquisition lifecycle state machine.
//!
//! ```text
//!          stage              trigger
//!   Idle ────────▶ Staged ─────────────▶ Acquiring
//!    ▲               │  ◀───────────────     │
//!    │   unstage     │   generate_datum      │
//!    └───────────────┴───────────────────────┘
//!                   (any state, incl. Faulted)
//! ```
//!
//! `Faulted` is entered when staging or datum registration fails. Only
//! `unstage` leaves it.

use std::fmt;

use crate::error::{DaqError, DaqResult};

/// Lifecycle state of one detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No resource staged.
    Idle,
    /// Resource staged, no trigger outstanding.
    Staged,
    /// Trigger issued, its datum not generated yet.
    Acquiring,
    /// Staging or registration failed; unstage to recover.
    Faulted,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Staged => "staged",
            LifecycleState::Acquiring => "acquiring",
            LifecycleState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Guard enforcing the legal ordering of detector operations.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    device: String,
    state: LifecycleState,
}

impl Lifecycle {
    /// New guard in `Idle`.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            state: LifecycleState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn invalid(&self, action: &'static str) -> DaqError {
        match self.state {
            LifecycleState::Faulted => DaqError::Faulted(self.device.clone()),
            state => DaqError::InvalidTransition {
                device: self.device.clone(),
                action,
                state: state.to_string(),
            },
        }
    }

    /// Check that staging may begin.
    pub fn check_stage(&self) -> DaqResult<()> {
        match self.state {
            LifecycleState::Idle => Ok(()),
            _ => Err(self.invalid("stage")),
        }
    }

    /// Staging completed.
    pub fn staged(&mut self) {
        self.state = LifecycleState::Staged;
    }

    /// `Staged → Acquiring`.
    pub fn begin_trigger(&mut self) -> DaqResult<()> {
        match self.state {
            LifecycleState::Staged => {
                self.state = LifecycleState::Acquiring;
                Ok(())
            }
            _ => Err(self.invalid("trigger")),
        }
    }

    /// Hardware trigger failed; the step is abandoned.
    pub fn trigger_failed(&mut self) {
        if self.state == LifecycleState::Acquiring {
            self.state = LifecycleState::Staged;
        }
    }

    /// Check that a datum may be generated now.
    ///
    /// Outside `Staged` and `Acquiring` there is no usable resource, so
    /// `Idle` and `Faulted` both report [`DaqError::NoActiveResource`].
    pub fn check_datum(&self) -> DaqResult<()> {
        match self.state {
            LifecycleState::Acquiring => Ok(()),
            LifecycleState::Idle | LifecycleState::Faulted => {
                Err(DaqError::NoActiveResource(self.device.clone()))
            }
            LifecycleState::Staged => Err(self.invalid("generate a datum for")),
        }
    }

    /// Datum generated (or the attempt failed without faulting).
    pub fn datum_done(&mut self) {
        if self.state == LifecycleState::Acquiring {
            self.state = LifecycleState::Staged;
        }
    }

    /// Enter `Faulted`.
    pub fn fault(&mut self) {
        self.state = LifecycleState::Faulted;
    }

    /// Record the outcome of an operation: fatal errors fault the run.
    pub fn record<T>(&mut self, result: &DaqResult<T>) {
        if let Err(e) = result {
            if e.is_fatal_to_run() {
                self.fault();
            }
        }
    }

    /// Any state → `Idle`. Returns whether anything was staged.
    pub fn unstaged(&mut self) -> bool {
        let was_active = self.state != LifecycleState::Idle;
        self.state = LifecycleState::Idle;
        was_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut lc = Lifecycle::new("eiger4m");
        lc.check_stage().unwrap();
        lc.staged();
        for _ in 0..3 {
            lc.begin_trigger().unwrap();
            lc.check_datum().unwrap();
            lc.datum_done();
        }
        assert!(lc.unstaged());
        assert_eq!(lc.state(), LifecycleState::Idle);
    }

    #[test]
    fn test_datum_in_idle_is_no_active_resource() {
        let lc = Lifecycle::new("eiger4m");
        assert!(matches!(
            lc.check_datum(),
            Err(DaqError::NoActiveResource(_))
        ));
    }

    #[test]
    fn test_one_datum_per_trigger() {
        let mut lc = Lifecycle::new("eiger4m");
        lc.staged();
        assert!(lc.check_datum().is_err());
        lc.begin_trigger().unwrap();
        assert!(lc.begin_trigger().is_err());
    }

    #[test]
    fn test_redundant_stage_rejected() {
        let mut lc = Lifecycle::new("eiger4m");
        lc.staged();
        assert!(matches!(
            lc.check_stage(),
            Err(DaqError::InvalidTransition { action: "stage", .. })
        ));
    }

    #[test]
    fn test_faulted_requires_unstage() {
        let mut lc = Lifecycle::new("eiger4m");
        lc.staged();
        lc.fault();
        assert!(matches!(lc.begin_trigger(), Err(DaqError::Faulted(_))));
        assert!(matches!(lc.check_stage(), Err(DaqError::Faulted(_))));
        assert!(matches!(
            lc.check_datum(),
            Err(DaqError::NoActiveResource(_))
        ));
        assert!(lc.unstaged());
        lc.check_stage().unwrap();
    }

    #[test]
    fn test_unstage_idempotent() {
        let mut lc = Lifecycle::new("eiger4m");
        assert!(!lc.unstaged());
        assert!(!lc.unstaged());
    }
}
