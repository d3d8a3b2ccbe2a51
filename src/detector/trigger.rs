//! Trigger strategies.
//!
//! A strategy knows which PV starts an acquisition, how to tell that it has
//! finished, and which settings must hold while the detector is staged.
//!
//! - [`SingleTrigger`]: internal triggering through the camera `Acquire` PV.
//! - [`FastShutterTrigger`]: external-enable triggering through a separate
//!   fast-shutter trigger box.
//!
//! Both fire by writing `1` and complete when the acquire readback has gone
//! high and come back to `0`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing::debug;

use super::stage_settings::StageSettings;
use super::Timing;
use crate::config::ConfigError;
use crate::control::{set_and_wait_with_poll, Signal, SignalValue};
use crate::error::{DaqError, DaqResult};

/// How a detector is told to take one frame.
#[async_trait]
pub trait TriggerStrategy: Send + Sync {
    /// Strategy label used in logs.
    fn kind(&self) -> &'static str;

    /// Settings that must hold while staged.
    fn stage_settings(&self) -> StageSettings;

    /// Fire one acquisition and wait for it to complete.
    async fn trigger(&self, timing: &Timing) -> DaqResult<()>;
}

/// Write `1` to `acquire` and wait for its readback to cycle `1 → 0`.
async fn fire_and_wait(acquire: &dyn Signal, limit: Duration, poll: Duration) -> DaqResult<()> {
    acquire.put(SignalValue::Int(1)).await?;
    let cycled = timeout(limit, async {
        let mut saw_high = false;
        loop {
            let busy = acquire.get().await?.as_i64().unwrap_or(0) != 0;
            if busy {
                saw_high = true;
            } else if saw_high {
                return Ok::<(), DaqError>(());
            }
            sleep(poll).await;
        }
    })
    .await;
    match cycled {
        Ok(result) => result,
        Err(_) => Err(DaqError::SignalTimeout {
            signal: acquire.name().to_string(),
            expected: "acquisition complete".to_string(),
            timeout: limit,
        }),
    }
}

/// Internal trigger via the camera's own `Acquire` PV.
#[derive(Debug, Clone)]
pub struct SingleTrigger {
    acquire: Arc<dyn Signal>,
    image_mode: Arc<dyn Signal>,
}

impl SingleTrigger {
    /// `acquire` is `cam1:Acquire` (with readback), `image_mode` is
    /// `cam1:ImageMode`.
    pub fn new(acquire: Arc<dyn Signal>, image_mode: Arc<dyn Signal>) -> Self {
        Self {
            acquire,
            image_mode,
        }
    }
}

#[async_trait]
impl TriggerStrategy for SingleTrigger {
    fn kind(&self) -> &'static str {
        "single"
    }

    fn stage_settings(&self) -> StageSettings {
        // Stop any free-running acquisition, then switch to "Multiple".
        StageSettings::new()
            .with(Arc::clone(&self.acquire), 0)
            .with(Arc::clone(&self.image_mode), 1)
    }

    async fn trigger(&self, timing: &Timing) -> DaqResult<()> {
        debug!(signal = self.acquire.name(), "Single trigger");
        fire_and_wait(
            self.acquire.as_ref(),
            timing.trigger_timeout,
            timing.poll_interval,
        )
        .await
    }
}

/// Signals of the fast-shutter trigger box.
#[derive(Debug, Clone)]
pub struct FastShutterSignals {
    /// `Mode-Sts` / `Mode-Cmd`
    pub auto_shutter_mode: Arc<dyn Signal>,
    /// `NumImages-SP`
    pub num_images: Arc<dyn Signal>,
    /// `ExposureTime-SP`
    pub exposure_time: Arc<dyn Signal>,
    /// `AcquirePeriod-SP`
    pub acquire_period: Arc<dyn Signal>,
    /// `Acquire-Cmd`
    pub acquire: Arc<dyn Signal>,
}

/// External-enable trigger through the fast-shutter trigger box.
#[derive(Debug, Clone)]
pub struct FastShutterTrigger {
    signals: FastShutterSignals,
}

impl FastShutterTrigger {
    /// Wrap the trigger box signals.
    pub fn new(signals: FastShutterSignals) -> Self {
        Self { signals }
    }

    /// Program exposure, period and images per trigger.
    ///
    /// The box misbehaves when exposure equals the period, so the exposure
    /// must be strictly shorter.
    pub async fn configure(
        &self,
        exposure: Duration,
        period: Duration,
        num_images: u32,
        timing: &Timing,
    ) -> DaqResult<()> {
        if exposure >= period {
            return Err(ConfigError::ValidationError(format!(
                "exposure {exposure:?} must be shorter than acquire period {period:?}"
            ))
            .into());
        }
        let s = &self.signals;
        for (signal, value) in [
            (&s.exposure_time, SignalValue::Float(exposure.as_secs_f64())),
            (&s.acquire_period, SignalValue::Float(period.as_secs_f64())),
            (&s.num_images, SignalValue::Int(i64::from(num_images))),
        ] {
            set_and_wait_with_poll(
                signal.as_ref(),
                value,
                timing.ack_timeout,
                timing.poll_interval,
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TriggerStrategy for FastShutterTrigger {
    fn kind(&self) -> &'static str {
        "fast_shutter"
    }

    fn stage_settings(&self) -> StageSettings {
        StageSettings::new().with(Arc::clone(&self.signals.auto_shutter_mode), 1)
    }

    async fn trigger(&self, timing: &Timing) -> DaqResult<()> {
        debug!(signal = self.signals.acquire.name(), "Fast shutter trigger");
        fire_and_wait(
            self.signals.acquire.as_ref(),
            timing.trigger_timeout,
            timing.poll_interval,
        )
        .await
    }
}
