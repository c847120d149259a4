//! Rows emitted by procedures.

use serde::{Deserialize, Serialize};

use crate::sweep::CurvePoint;

/// Receives rows as a procedure produces them.
pub type RecordSink<'a> = dyn FnMut(TransportRecord) + Send + 'a;

/// Environment readings shared by every row of one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentReading {
    /// Temperature setpoint (K).
    pub temperature_setpoint: f64,
    /// Field setpoint (T).
    pub field_setpoint: f64,
    /// Temperature read after the sweep (`-1` when not controlled).
    pub temperature: f64,
    /// Field read after the sweep (`-1` when not controlled).
    pub field: f64,
}

/// One measured row.
///
/// Gate columns are `None` for drain-only sweeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportRecord {
    /// 0-based row index within the run.
    pub index: usize,
    /// Temperature setpoint (K).
    pub temperature_setpoint: f64,
    /// Field setpoint (T).
    pub field_setpoint: f64,
    /// Gate voltage setpoint (V).
    pub gate_setpoint: Option<f64>,
    /// Drain setpoint (A for current bias, V for voltage bias).
    pub drain_setpoint: f64,
    /// Measured temperature (K).
    pub temperature: f64,
    /// Measured field (T).
    pub field: f64,
    /// Gate sweep direction, `true` on the outbound half.
    pub gate_forward: Option<bool>,
    /// Measured gate voltage (V).
    pub gate_voltage: Option<f64>,
    /// Measured gate leakage current (A).
    pub gate_current: Option<f64>,
    /// Measured drain voltage (V).
    pub drain_voltage: f64,
    /// Measured drain current (A).
    pub drain_current: f64,
    /// Drain-source resistance `vd / id` (Ohm).
    pub rds: f64,
    /// Sample label.
    pub sample: String,
}

impl TransportRecord {
    /// Row from a curve point.
    pub fn from_curve_point(
        index: usize,
        point: &CurvePoint,
        env: &EnvironmentReading,
        sample: &str,
    ) -> Self {
        Self {
            index,
            temperature_setpoint: env.temperature_setpoint,
            field_setpoint: env.field_setpoint,
            gate_setpoint: Some(point.gate_setpoint),
            drain_setpoint: point.drain_setpoint,
            temperature: env.temperature,
            field: env.field,
            gate_forward: point.gate_forward,
            gate_voltage: Some(point.gate_voltage),
            gate_current: Some(point.gate_current),
            drain_voltage: point.drain_voltage,
            drain_current: point.drain_current,
            rds: resistance(point.drain_voltage, point.drain_current),
            sample: sample.to_string(),
        }
    }

    /// Row from a drain-only sweep point.
    pub fn from_drain_reading(
        index: usize,
        drain_setpoint: f64,
        drain_voltage: f64,
        drain_current: f64,
        env: &EnvironmentReading,
        sample: &str,
    ) -> Self {
        Self {
            index,
            temperature_setpoint: env.temperature_setpoint,
            field_setpoint: env.field_setpoint,
            gate_setpoint: None,
            drain_setpoint,
            temperature: env.temperature,
            field: env.field,
            gate_forward: None,
            gate_voltage: None,
            gate_current: None,
            drain_voltage,
            drain_current,
            rds: resistance(drain_voltage, drain_current),
            sample: sample.to_string(),
        }
    }
}

/// `v / i` with IEEE semantics: zero current gives an infinite or NaN resistance.
pub fn resistance(voltage: f64, current: f64) -> f64 {
    voltage / current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> EnvironmentReading {
        EnvironmentReading {
            temperature_setpoint: 4.2,
            field_setpoint: 0.0,
            temperature: 4.19,
            field: -1.0,
        }
    }

    #[test]
    fn curve_rows_carry_gate_columns_and_resistance() {
        let point = CurvePoint {
            outer_value: 1e-6,
            gate_setpoint: 2.0,
            drain_setpoint: 1e-6,
            gate_forward: Some(false),
            gate_voltage: 2.001,
            gate_current: 1e-12,
            drain_voltage: 0.5,
            drain_current: 1e-6,
        };
        let row = TransportRecord::from_curve_point(7, &point, &env(), "TBG");
        assert_eq!(row.index, 7);
        assert_eq!(row.gate_forward, Some(false));
        assert!((row.rds - 5.0e5).abs() < 1e-6);
        assert_eq!(row.field, -1.0);
    }

    #[test]
    fn drain_rows_have_no_gate_columns() {
        let row = TransportRecord::from_drain_reading(0, 5e-6, 0.01, 5e-6, &env(), "blank");
        assert_eq!(row.gate_setpoint, None);
        assert_eq!(row.gate_voltage, None);
        assert!((row.rds - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn zero_current_gives_non_finite_resistance() {
        assert!(resistance(0.1, 0.0).is_infinite());
        assert!(resistance(0.0, 0.0).is_nan());
    }
}
