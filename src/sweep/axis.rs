//! Sweep-axis construction from start / stop / step.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Relative tolerance when deciding whether the last step lands on `stop`.
const STEP_TOLERANCE: f64 = 1e-9;

/// Most setpoints one sweep may hold: the reading-buffer capacity of a
/// 2600-series channel.
pub const MAX_SWEEP_POINTS: usize = 100_000;

/// Raw axis parameters as entered by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    /// First value.
    pub start: f64,
    /// Value the sweep must reach.
    pub stop: f64,
    /// Step magnitude; its sign is ignored.
    pub step: f64,
}

impl AxisSpec {
    /// Convenience constructor.
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// Forward values: `start, start+s, ...` with `s = sign(stop-start)*|step|`,
    /// ending on the first value at or beyond `stop`.
    pub fn forward_values(&self) -> AppResult<Vec<f64>> {
        let AxisSpec { start, stop, step } = *self;
        if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
            return Err(DaqError::configuration(format!(
                "Sweep axis must be finite, got start={start} stop={stop} step={step}"
            )));
        }
        if start == stop {
            return Ok(vec![start]);
        }
        if step == 0.0 {
            return Err(DaqError::configuration(format!(
                "Sweep step is zero for axis {start} -> {stop}"
            )));
        }

        let signed_step = (stop - start).signum() * step.abs();
        let steps = ((stop - start) / signed_step - STEP_TOLERANCE).ceil();
        if !steps.is_finite() || steps + 1.0 > MAX_SWEEP_POINTS as f64 {
            return Err(DaqError::configuration(format!(
                "Sweep axis {start} -> {stop} in steps of {step} exceeds \
                 {MAX_SWEEP_POINTS} points"
            )));
        }
        let steps = steps as usize;
        Ok((0..=steps)
            .map(|i| start + i as f64 * signed_step)
            .collect())
    }
}

/// Direction of travel of one axis point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepDirection {
    /// Outbound half.
    Forward,
    /// Return half.
    Reverse,
}

impl SweepDirection {
    /// `1` for forward, `0` for reverse.
    pub fn flag(&self) -> u8 {
        match self {
            SweepDirection::Forward => 1,
            SweepDirection::Reverse => 0,
        }
    }

    /// True on the outbound half.
    pub fn is_forward(&self) -> bool {
        matches!(self, SweepDirection::Forward)
    }
}

/// Concrete list of setpoints with a direction per point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepAxis {
    values: Vec<f64>,
    directions: Vec<SweepDirection>,
}

impl SweepAxis {
    /// Single-direction axis.
    pub fn forward(spec: &AxisSpec) -> AppResult<Self> {
        let values = spec.forward_values()?;
        let directions = vec![SweepDirection::Forward; values.len()];
        Ok(Self { values, directions })
    }

    /// Forward values followed by their exact mirror.
    pub fn there_and_back(spec: &AxisSpec) -> AppResult<Self> {
        let forward = spec.forward_values()?;
        let n = forward.len();
        if 2 * n > MAX_SWEEP_POINTS {
            return Err(DaqError::configuration(format!(
                "There-and-back sweep of {n} points per direction exceeds \
                 {MAX_SWEEP_POINTS} points"
            )));
        }
        let mut values = forward.clone();
        values.extend(forward.into_iter().rev());
        let directions = std::iter::repeat(SweepDirection::Forward)
            .take(n)
            .chain(std::iter::repeat(SweepDirection::Reverse).take(n))
            .collect();
        Ok(Self { values, directions })
    }

    /// Setpoints in sweep order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Direction of each setpoint.
    pub fn directions(&self) -> &[SweepDirection] {
        &self.directions
    }

    /// Direction flags (`1` forward, `0` reverse) per setpoint.
    pub fn direction_flags(&self) -> Vec<u8> {
        self.directions.iter().map(SweepDirection::flag).collect()
    }

    /// Number of setpoints.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for an axis without points.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
