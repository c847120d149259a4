//! Curve recording: one dual-channel sweep per outer bias value.
//!
//! The drain channel always leads the trigger sequence. Which physical
//! channel plays gate or drain comes from [`ChannelRoles`], so the recorder
//! never assumes an orientation; derived quantities such as resistance are
//! left to the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{SmuChannel, SourceFunction};
use crate::sweep::axis::{AxisSpec, SweepAxis};
use crate::sweep::{ChannelSweep, DualSweepResult, SourceMeter, SweepSettings};

/// Duration of the abort beep.
pub const ABORT_BEEP: Duration = Duration::from_millis(300);
/// Pitch of the abort beep in Hz.
pub const ABORT_BEEP_HZ: f64 = 2400.0;

/// Per-batch callback: `(outer value, rows just appended)`.
pub type BatchCallback<'a> = dyn FnMut(f64, &[CurvePoint]) + Send + 'a;

// =============================================================================
// Shapes
// =============================================================================

/// Fixed drain bias for a transfer curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DrainBias {
    /// Drain sources these currents (A).
    Current(Vec<f64>),
    /// Drain sources these voltages (V).
    Voltage(Vec<f64>),
}

/// What to sweep and what to hold fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum CurveShape {
    /// Gate voltage there-and-back at each fixed drain current.
    TransferByCurrent {
        /// Gate voltage axis.
        gate: AxisSpec,
        /// Outer list of drain currents.
        drain_currents: Vec<f64>,
    },
    /// Gate voltage there-and-back at each fixed drain voltage.
    TransferByVoltage {
        /// Gate voltage axis.
        gate: AxisSpec,
        /// Outer list of drain voltages.
        drain_voltages: Vec<f64>,
    },
    /// Drain voltage, single direction, at each fixed gate voltage.
    IvByVoltage {
        /// Drain voltage axis.
        drain: AxisSpec,
        /// Outer list of gate voltages.
        gate_voltages: Vec<f64>,
    },
}

/// Tag of a [`CurveShape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveKind {
    /// See [`CurveShape::TransferByCurrent`].
    TransferByCurrent,
    /// See [`CurveShape::TransferByVoltage`].
    TransferByVoltage,
    /// See [`CurveShape::IvByVoltage`].
    IvByVoltage,
}

impl fmt::Display for CurveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CurveKind::TransferByCurrent => "transfer_by_current",
            CurveKind::TransferByVoltage => "transfer_by_voltage",
            CurveKind::IvByVoltage => "iv_by_voltage",
        };
        f.write_str(name)
    }
}

impl CurveShape {
    /// Transfer curve with the given drain bias.
    pub fn transfer(gate: AxisSpec, bias: DrainBias) -> Self {
        match bias {
            DrainBias::Current(drain_currents) => CurveShape::TransferByCurrent {
                gate,
                drain_currents,
            },
            DrainBias::Voltage(drain_voltages) => CurveShape::TransferByVoltage {
                gate,
                drain_voltages,
            },
        }
    }

    /// Variant tag.
    pub fn kind(&self) -> CurveKind {
        match self {
            CurveShape::TransferByCurrent { .. } => CurveKind::TransferByCurrent,
            CurveShape::TransferByVoltage { .. } => CurveKind::TransferByVoltage,
            CurveShape::IvByVoltage { .. } => CurveKind::IvByVoltage,
        }
    }

    /// Outer list, iterated in order.
    pub fn outer_values(&self) -> &[f64] {
        match self {
            CurveShape::TransferByCurrent { drain_currents, .. } => drain_currents,
            CurveShape::TransferByVoltage { drain_voltages, .. } => drain_voltages,
            CurveShape::IvByVoltage { gate_voltages, .. } => gate_voltages,
        }
    }

    /// Swept axis: there-and-back for transfer curves, single direction for IV.
    pub fn axis(&self) -> AppResult<SweepAxis> {
        match self {
            CurveShape::TransferByCurrent { gate, .. }
            | CurveShape::TransferByVoltage { gate, .. } => SweepAxis::there_and_back(gate),
            CurveShape::IvByVoltage { drain, .. } => SweepAxis::forward(drain),
        }
    }

    fn drain_function(&self) -> SourceFunction {
        match self {
            CurveShape::TransferByCurrent { .. } => SourceFunction::Current,
            _ => SourceFunction::Voltage,
        }
    }

    fn tracks_direction(&self) -> bool {
        !matches!(self, CurveShape::IvByVoltage { .. })
    }

    /// `(drain list, gate list)` for one outer value.
    fn sweep_lists(&self, axis: &SweepAxis, outer: f64) -> (Vec<f64>, Vec<f64>) {
        let constant = vec![outer; axis.len()];
        match self {
            CurveShape::IvByVoltage { .. } => (axis.values().to_vec(), constant),
            _ => (constant, axis.values().to_vec()),
        }
    }
}

// =============================================================================
// Roles and results
// =============================================================================

/// Assignment of physical channels to gate and drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRoles {
    /// Channel wired to the gate.
    pub gate: String,
    /// Channel wired to the drain; leads the trigger sequence.
    pub drain: String,
}

impl ChannelRoles {
    /// Explicit assignment.
    pub fn new(gate: impl Into<String>, drain: impl Into<String>) -> Self {
        Self {
            gate: gate.into(),
            drain: drain.into(),
        }
    }
}

/// One measured point of a curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    /// Outer-loop value this point belongs to.
    pub outer_value: f64,
    /// Gate setpoint (V).
    pub gate_setpoint: f64,
    /// Drain setpoint (A or V depending on the shape).
    pub drain_setpoint: f64,
    /// Gate sweep direction; `None` when the gate is not swept.
    pub gate_forward: Option<bool>,
    /// Measured gate voltage.
    pub gate_voltage: f64,
    /// Measured gate current.
    pub gate_current: f64,
    /// Measured drain voltage.
    pub drain_voltage: f64,
    /// Measured drain current.
    pub drain_current: f64,
}

/// Rows of a recorded curve in outer-loop order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveTable {
    /// Shape that produced the table.
    pub kind: CurveKind,
    /// All rows.
    pub points: Vec<CurvePoint>,
    /// True when the recording stopped on an abort.
    pub aborted: bool,
}

impl CurveTable {
    /// Empty table.
    pub fn new(kind: CurveKind) -> Self {
        Self {
            kind,
            points: Vec::new(),
            aborted: false,
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True without rows.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Distinct outer values in recording order.
    pub fn outer_values(&self) -> Vec<f64> {
        let mut values: Vec<f64> = Vec::new();
        for point in &self.points {
            if values.last() != Some(&point.outer_value) {
                values.push(point.outer_value);
            }
        }
        values
    }
}

fn assemble_batch(
    outer: f64,
    drain_values: &[f64],
    gate_values: &[f64],
    axis: &SweepAxis,
    track_direction: bool,
    result: &DualSweepResult,
) -> Vec<CurvePoint> {
    let n = [
        drain_values.len(),
        result.lead.len(),
        result.follower.len(),
    ]
    .into_iter()
    .min()
    .unwrap_or(0);

    (0..n)
        .map(|i| CurvePoint {
            outer_value: outer,
            gate_setpoint: gate_values[i],
            drain_setpoint: drain_values[i],
            gate_forward: track_direction.then(|| axis.directions()[i].is_forward()),
            gate_voltage: result.follower.voltage[i],
            gate_current: result.follower.current[i],
            drain_voltage: result.lead.voltage[i],
            drain_current: result.lead.current[i],
        })
        .collect()
}

// =============================================================================
// Recorder
// =============================================================================

/// Records curves through one [`SourceMeter`].
pub struct CurveRecorder<'a> {
    meter: &'a SourceMeter,
    roles: ChannelRoles,
    settings: SweepSettings,
}

impl<'a> CurveRecorder<'a> {
    /// Recorder for a meter, role assignment and sweep settings.
    pub fn new(meter: &'a SourceMeter, roles: ChannelRoles, settings: SweepSettings) -> Self {
        Self {
            meter,
            roles,
            settings,
        }
    }

    fn channels(&self) -> AppResult<(Arc<dyn SmuChannel>, Arc<dyn SmuChannel>)> {
        if self.roles.gate == self.roles.drain {
            return Err(DaqError::configuration(format!(
                "Gate and drain are both assigned to channel '{}'",
                self.roles.gate
            )));
        }
        Ok((
            self.meter.channel(&self.roles.gate)?,
            self.meter.channel(&self.roles.drain)?,
        ))
    }

    /// Run one sweep per outer value and collect the rows.
    ///
    /// Clears the abort signal on entry. An abort seen before an outer value
    /// resets the instrument, beeps and returns the rows gathered so far.
    /// The instrument is reset to idle when the recording ends.
    pub async fn record(
        &self,
        shape: &CurveShape,
        mut on_batch: Option<&mut BatchCallback<'_>>,
    ) -> AppResult<CurveTable> {
        let abort = self.meter.abort_signal();
        abort.clear();

        let axis = shape.axis()?;
        let (gate, drain) = self.channels()?;
        let instrument = self.meter.instrument();
        let mut table = CurveTable::new(shape.kind());

        info!(
            kind = %shape.kind(),
            gate = %self.roles.gate,
            drain = %self.roles.drain,
            axis_points = axis.len(),
            outer_points = shape.outer_values().len(),
            "Recording curve"
        );

        let session = self.meter.session().await;
        for &outer in shape.outer_values() {
            if abort.is_set() {
                warn!(
                    reason = %abort.reason().unwrap_or_default(),
                    rows = table.len(),
                    "Curve recording aborted"
                );
                instrument.reset().await?;
                instrument.beep(ABORT_BEEP, ABORT_BEEP_HZ).await?;
                table.aborted = true;
                return Ok(table);
            }

            let (drain_values, gate_values) = shape.sweep_lists(&axis, outer);
            let lead = ChannelSweep {
                channel: Arc::clone(&drain),
                function: shape.drain_function(),
                values: drain_values,
            };
            let follower = ChannelSweep {
                channel: Arc::clone(&gate),
                function: SourceFunction::Voltage,
                values: gate_values,
            };

            let result = session.dual_sweep(&lead, &follower, &self.settings).await?;
            if abort.is_set() {
                debug!(outer, "Abort raised during sweep, discarding batch");
                continue;
            }

            let batch = assemble_batch(
                outer,
                &lead.values,
                &follower.values,
                &axis,
                shape.tracks_direction(),
                &result,
            );
            let first_new = table.points.len();
            table.points.extend(batch);
            debug!(outer, rows = table.len() - first_new, "Curve batch recorded");

            if let Some(callback) = on_batch.as_deref_mut() {
                callback(outer, &table.points[first_new..]);
            }
        }

        table.aborted = abort.is_set();
        instrument.reset().await?;
        info!(rows = table.len(), aborted = table.aborted, "Curve recording finished");
        Ok(table)
    }
}

/// Gate-voltage transfer curve (there and back) at each drain bias.
pub async fn run_transfer_sweep(
    meter: &SourceMeter,
    roles: ChannelRoles,
    gate: AxisSpec,
    bias: DrainBias,
    settings: SweepSettings,
    on_batch: Option<&mut BatchCallback<'_>>,
) -> AppResult<CurveTable> {
    CurveRecorder::new(meter, roles, settings)
        .record(&CurveShape::transfer(gate, bias), on_batch)
        .await
}

/// Drain-voltage IV curve at each gate voltage.
pub async fn run_iv_sweep(
    meter: &SourceMeter,
    roles: ChannelRoles,
    drain: AxisSpec,
    gate_voltages: Vec<f64>,
    settings: SweepSettings,
    on_batch: Option<&mut BatchCallback<'_>>,
) -> AppResult<CurveTable> {
    let shape = CurveShape::IvByVoltage {
        drain,
        gate_voltages,
    };
    CurveRecorder::new(meter, roles, settings)
        .record(&shape, on_batch)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::ChannelReadings;

    #[test]
    fn sweep_lists_follow_shape_orientation() {
        let transfer = CurveShape::transfer(
            AxisSpec::new(0.0, 1.0, 1.0),
            DrainBias::Current(vec![1e-6]),
        );
        let axis = transfer.axis().unwrap();
        let (drain, gate) = transfer.sweep_lists(&axis, 1e-6);
        assert_eq!(drain, vec![1e-6; 4]);
        assert_eq!(gate, vec![0.0, 1.0, 1.0, 0.0]);
        assert_eq!(transfer.drain_function(), SourceFunction::Current);

        let iv = CurveShape::IvByVoltage {
            drain: AxisSpec::new(0.0, 0.2, 0.1),
            gate_voltages: vec![5.0],
        };
        let axis = iv.axis().unwrap();
        let (drain, gate) = iv.sweep_lists(&axis, 5.0);
        assert_eq!(drain.len(), 3);
        assert_eq!(gate, vec![5.0; 3]);
        assert_eq!(iv.drain_function(), SourceFunction::Voltage);
        assert!(!iv.tracks_direction());
    }

    #[test]
    fn batch_maps_lead_to_drain_and_follower_to_gate() {
        let axis = SweepAxis::there_and_back(&AxisSpec::new(0.0, 1.0, 1.0)).unwrap();
        let result = DualSweepResult {
            lead: ChannelReadings {
                voltage: vec![0.1, 0.2, 0.3, 0.4],
                current: vec![1e-6; 4],
            },
            follower: ChannelReadings {
                voltage: vec![0.0, 1.0, 1.0, 0.0],
                current: vec![1e-12; 4],
            },
        };
        let batch = assemble_batch(1e-6, &[1e-6; 4], axis.values(), &axis, true, &result);

        assert_eq!(batch.len(), 4);
        assert_eq!(batch[1].drain_voltage, 0.2);
        assert_eq!(batch[1].gate_voltage, 1.0);
        assert_eq!(batch[1].gate_forward, Some(true));
        assert_eq!(batch[2].gate_forward, Some(false));
        assert_eq!(batch[3].gate_setpoint, 0.0);
    }

    #[test]
    fn outer_values_are_listed_in_recording_order() {
        let mut table = CurveTable::new(CurveKind::TransferByCurrent);
        for outer in [2.0, 2.0, 1.0] {
            table.points.push(CurvePoint {
                outer_value: outer,
                gate_setpoint: 0.0,
                drain_setpoint: outer,
                gate_forward: None,
                gate_voltage: 0.0,
                gate_current: 0.0,
                drain_voltage: 0.0,
                drain_current: 0.0,
            });
        }
        assert_eq!(table.outer_values(), vec![2.0, 1.0]);
    }

    #[test]
    fn kind_names_are_snake_case() {
        assert_eq!(CurveKind::IvByVoltage.to_string(), "iv_by_voltage");
    }
}
