//! Temperature / field conditions shared by every transport procedure.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CryostatSettings;
use crate::error::AppResult;
use crate::hardware::capabilities::ControlledQuantity;
use crate::procedures::config::ProcedureConfig;
use crate::procedures::record::EnvironmentReading;
use crate::procedures::{ParameterDef, ProcedureContext};
use crate::stabilization::{StabilizationOutcome, StabilizationTarget};

/// Parameter names consumed by [`ExperimentConditions`].
pub const CONDITION_PARAMS: [&str; 5] = [
    "temperature_setpoint",
    "temperature_control",
    "field_setpoint",
    "field_control",
    "sample",
];

/// Where the sample should be before measuring, and what it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConditions {
    /// Temperature setpoint (K).
    pub temperature_setpoint: f64,
    /// Drive the temperature loop.
    pub temperature_control: bool,
    /// Field setpoint (T).
    pub field_setpoint: f64,
    /// Drive the magnet.
    pub field_control: bool,
    /// Sample label copied into every row.
    pub sample: String,
}

impl ExperimentConditions {
    /// Read from procedure parameters. Control defaults to on outside simulation.
    pub fn from_config(config: &ProcedureConfig, in_simulation: bool) -> AppResult<Self> {
        Ok(Self {
            temperature_setpoint: config.f64_or("temperature_setpoint", 300.0)?,
            temperature_control: config.bool_or("temperature_control", !in_simulation)?,
            field_setpoint: config.f64_or("field_setpoint", 0.0)?,
            field_control: config.bool_or("field_control", !in_simulation)?,
            sample: config.str_or("sample", "blank")?.to_string(),
        })
    }

    /// Parameter catalog entries.
    pub fn parameter_defs() -> Vec<ParameterDef> {
        vec![
            ParameterDef::new("temperature_setpoint", "f64", "300", Some("K"), "Temperature setpoint"),
            ParameterDef::new(
                "temperature_control",
                "bool",
                "!in_simulation",
                None,
                "Drive the temperature loop before measuring",
            ),
            ParameterDef::new("field_setpoint", "f64", "0", Some("T"), "Magnetic field setpoint"),
            ParameterDef::new(
                "field_control",
                "bool",
                "!in_simulation",
                None,
                "Drive the magnet before measuring",
            ),
            ParameterDef::new("sample", "string", "blank", None, "Sample label"),
        ]
    }

    /// Stabilization targets: temperature, then field.
    pub fn targets(&self, cryostat: &CryostatSettings) -> [StabilizationTarget; 2] {
        let target = |quantity, active, setpoint, settle_delay| StabilizationTarget {
            quantity,
            active,
            setpoint,
            settle_delay,
        };
        [
            target(
                ControlledQuantity::Temperature,
                self.temperature_control,
                self.temperature_setpoint,
                cryostat.temperature_settle_delay,
            ),
            target(
                ControlledQuantity::MagneticField,
                self.field_control,
                self.field_setpoint,
                cryostat.field_settle_delay,
            ),
        ]
    }

    /// Bring temperature and field to their setpoints.
    pub async fn stabilize(&self, ctx: &ProcedureContext) -> AppResult<StabilizationOutcome> {
        let targets = self.targets(&ctx.settings().cryostat);
        ctx.stabilizer()
            .stabilize(&targets, ctx.abort_signal())
            .await
    }

    /// Setpoints together with current readings.
    pub async fn read_environment(&self, ctx: &ProcedureContext) -> AppResult<EnvironmentReading> {
        let [temperature, field] = self.targets(&ctx.settings().cryostat);
        let reading = EnvironmentReading {
            temperature_setpoint: self.temperature_setpoint,
            field_setpoint: self.field_setpoint,
            temperature: ctx.stabilizer().read_value(&temperature).await?,
            field: ctx.stabilizer().read_value(&field).await?,
        };
        info!(
            temperature = reading.temperature,
            temperature_setpoint = reading.temperature_setpoint,
            field = reading.field,
            field_setpoint = reading.field_setpoint,
            "Environment"
        );
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_follow_simulation_flag() {
        let config = ProcedureConfig::new("curve");
        let sim = ExperimentConditions::from_config(&config, true).unwrap();
        assert!(!sim.temperature_control && !sim.field_control);
        assert_eq!(sim.temperature_setpoint, 300.0);
        assert_eq!(sim.sample, "blank");

        let real = ExperimentConditions::from_config(&config, false).unwrap();
        assert!(real.temperature_control && real.field_control);
    }

    #[test]
    fn targets_take_settle_delays_from_settings() {
        let config = ProcedureConfig::new("curve")
            .with_param("temperature_setpoint", 4.2)
            .with_param("temperature_control", true);
        let conditions = ExperimentConditions::from_config(&config, true).unwrap();
        let cryostat = CryostatSettings {
            temperature_settle_delay: Duration::from_secs(30),
            ..CryostatSettings::default()
        };

        let [t, b] = conditions.targets(&cryostat);
        assert!(t.active);
        assert_eq!(t.setpoint, 4.2);
        assert_eq!(t.settle_delay, Duration::from_secs(30));
        assert!(!b.active);
        assert_eq!(b.quantity, ControlledQuantity::MagneticField);
    }
}
