//! Temperature / magnetic-field stabilization before a sweep.
//!
//! Each target is either inactive (treated as stable, reads the `-1`
//! sentinel, no setpoint write) or active. Active targets get their setpoint
//! written once on entry and are polled until the controller status code
//! falls in the settled band `[100, 200)`. A target that has settled stays
//! settled for the rest of the run.
//!
//! The abort signal is checked before every poll cycle and once more after
//! the loop. After a successful stabilization the controller dwells for the
//! longest settle delay among the active targets.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::abort::AbortSignal;
use crate::error::AppResult;
use crate::hardware::capabilities::{ControlledQuantity, FeedbackController};

/// Controller status codes meaning "settled".
pub const SETTLED_STATUS: Range<i64> = 100..200;

/// Reading reported for a quantity whose control is disabled.
pub const INACTIVE_READING: f64 = -1.0;

/// True when a controller status code is in the settled band.
pub fn is_settled_status(code: i64) -> bool {
    SETTLED_STATUS.contains(&code)
}

/// One controlled quantity and its goal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilizationTarget {
    /// Quantity being regulated.
    pub quantity: ControlledQuantity,
    /// Whether control is enabled for this run.
    pub active: bool,
    /// Target value.
    pub setpoint: f64,
    /// Extra wait after everything settled.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
}

impl StabilizationTarget {
    /// Active target.
    pub fn active(quantity: ControlledQuantity, setpoint: f64, settle_delay: Duration) -> Self {
        Self {
            quantity,
            active: true,
            setpoint,
            settle_delay,
        }
    }

    /// Disabled target; always stable.
    pub fn inactive(quantity: ControlledQuantity) -> Self {
        Self {
            quantity,
            active: false,
            setpoint: 0.0,
            settle_delay: Duration::ZERO,
        }
    }
}

/// Per-target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetState {
    /// Control disabled.
    Inactive,
    /// Status outside the settled band.
    Unstable,
    /// Status inside the settled band.
    Stable,
}

impl TargetState {
    /// Inactive and stable targets both let the run proceed.
    pub fn is_settled(&self) -> bool {
        !matches!(self, TargetState::Unstable)
    }
}

/// Result of [`StabilizationController::stabilize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StabilizationOutcome {
    /// Everything settled and the dwell elapsed.
    Proceed,
    /// The abort signal was raised.
    Stopped,
}

/// Drives targets to their setpoints through a [`FeedbackController`].
pub struct StabilizationController {
    controller: Arc<dyn FeedbackController>,
    poll_interval: Duration,
}

impl StabilizationController {
    /// Poll every second.
    pub fn new(controller: Arc<dyn FeedbackController>) -> Self {
        Self {
            controller,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Override the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Current value, or [`INACTIVE_READING`] when control is disabled.
    pub async fn read_value(&self, target: &StabilizationTarget) -> AppResult<f64> {
        if !target.active {
            return Ok(INACTIVE_READING);
        }
        Ok(self.controller.read_value(target.quantity).await?)
    }

    /// Poll the controller status for a target.
    pub async fn target_state(&self, target: &StabilizationTarget) -> AppResult<TargetState> {
        if !target.active {
            return Ok(TargetState::Inactive);
        }
        let code = self.controller.read_status(target.quantity).await?;
        Ok(if is_settled_status(code) {
            TargetState::Stable
        } else {
            TargetState::Unstable
        })
    }

    /// Write the setpoint of every active target.
    pub async fn apply_setpoints(&self, targets: &[StabilizationTarget]) -> AppResult<()> {
        for target in targets {
            if target.active {
                self.controller
                    .write_setpoint(target.quantity, target.setpoint)
                    .await?;
                info!(quantity = %target.quantity, setpoint = target.setpoint, "Setpoint written");
            } else {
                info!(quantity = %target.quantity, "Control disabled, skipping setpoint");
            }
        }
        Ok(())
    }

    /// Dwell after settling: the longest settle delay among active targets.
    pub fn dwell(targets: &[StabilizationTarget]) -> Duration {
        targets
            .iter()
            .filter(|t| t.active)
            .map(|t| t.settle_delay)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Bring every target to its setpoint, honouring `abort`.
    pub async fn stabilize(
        &self,
        targets: &[StabilizationTarget],
        abort: &AbortSignal,
    ) -> AppResult<StabilizationOutcome> {
        self.apply_setpoints(targets).await?;

        let mut states: Vec<TargetState> = targets
            .iter()
            .map(|t| {
                if t.active {
                    TargetState::Unstable
                } else {
                    TargetState::Inactive
                }
            })
            .collect();

        while !states.iter().all(TargetState::is_settled) {
            if abort.is_set() {
                warn!("Stop requested while stabilizing");
                return Ok(StabilizationOutcome::Stopped);
            }
            sleep(self.poll_interval).await;

            for (target, state) in targets.iter().zip(states.iter_mut()) {
                if state.is_settled() {
                    continue;
                }
                *state = self.target_state(target).await?;
                let value = self.read_value(target).await?;
                if state.is_settled() {
                    info!(quantity = %target.quantity, setpoint = target.setpoint, value, "Stabilized");
                } else {
                    info!(quantity = %target.quantity, setpoint = target.setpoint, value, "Waiting to stabilize");
                }
            }
        }

        if abort.is_set() {
            warn!("Stop requested after stabilizing");
            return Ok(StabilizationOutcome::Stopped);
        }

        let dwell = Self::dwell(targets);
        if !dwell.is_zero() {
            info!(dwell_s = dwell.as_secs_f64(), "Waiting for settle delay");
            sleep(dwell).await;
        }
        Ok(StabilizationOutcome::Proceed)
    }
}
