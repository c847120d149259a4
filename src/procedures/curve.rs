//! Gate transfer and drain IV curves.
//!
//! | `variant`              | swept                     | outer list       |
//! |------------------------|---------------------------|------------------|
//! | `transfer_by_current`  | gate V, there and back    | `drain_currents` |
//! | `transfer_by_voltage`  | gate V, there and back    | `drain_voltages` |
//! | `iv_by_voltage`        | drain V, single direction | `gate_voltages`  |

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::procedures::conditions::{ExperimentConditions, CONDITION_PARAMS};
use crate::procedures::{
    ensure_configured, final_state, ParameterDef, Procedure, ProcedureConfig, ProcedureContext,
    ProcedureResult, ProcedureState, ProcedureTypeInfo, RecordSink, RunStatus, TransportRecord,
};
use crate::stabilization::StabilizationOutcome;
use crate::sweep::{AxisSpec, CurveRecorder, CurveShape};

const TYPE_ID: &str = "curve";

const CURVE_PARAMS: [&str; 12] = [
    "variant",
    "gate_start",
    "gate_stop",
    "gate_step",
    "drain_currents",
    "drain_voltages",
    "drain_start",
    "drain_stop",
    "drain_step",
    "gate_voltages",
    "delay",
    "pulsed",
];

/// Curve measurement at fixed temperature and field.
pub struct CurveProcedure {
    state: ProcedureState,
    conditions: Option<ExperimentConditions>,
    shape: Option<CurveShape>,
    delay_s: f64,
    pulsed: bool,
}

impl Default for CurveProcedure {
    fn default() -> Self {
        Self {
            state: ProcedureState::Idle,
            conditions: None,
            shape: None,
            delay_s: -1.0,
            pulsed: false,
        }
    }
}

impl CurveProcedure {
    /// Configured sweep shape.
    pub fn shape(&self) -> Option<&CurveShape> {
        self.shape.as_ref()
    }

    /// Configured conditions.
    pub fn conditions(&self) -> Option<&ExperimentConditions> {
        self.conditions.as_ref()
    }

    fn shape_from_config(config: &ProcedureConfig) -> AppResult<CurveShape> {
        let gate = || -> AppResult<AxisSpec> {
            Ok(AxisSpec::new(
                config.f64_or("gate_start", 0.0)?,
                config.f64_or("gate_stop", 60.0)?,
                config.f64_or("gate_step", 0.25)?,
            ))
        };
        let shape = match config.str_or("variant", "transfer_by_current")? {
            "transfer_by_current" => CurveShape::TransferByCurrent {
                gate: gate()?,
                drain_currents: config.f64_list_or("drain_currents", &[10e-6])?,
            },
            "transfer_by_voltage" => CurveShape::TransferByVoltage {
                gate: gate()?,
                drain_voltages: config.f64_list_or("drain_voltages", &[0.1])?,
            },
            "iv_by_voltage" => CurveShape::IvByVoltage {
                drain: AxisSpec::new(
                    config.f64_or("drain_start", 0.0)?,
                    config.f64_or("drain_stop", 1.0)?,
                    config.f64_or("drain_step", 0.05)?,
                ),
                gate_voltages: config.f64_list_or("gate_voltages", &[0.0])?,
            },
            other => {
                return Err(DaqError::configuration(format!(
                    "Unknown curve variant '{other}' (expected transfer_by_current, \
                     transfer_by_voltage or iv_by_voltage)"
                )))
            }
        };
        if shape.outer_values().is_empty() {
            return Err(DaqError::configuration(format!(
                "Curve variant {} needs at least one outer value",
                shape.kind()
            )));
        }
        shape.axis()?;
        Ok(shape)
    }

    async fn run(
        &mut self,
        ctx: &ProcedureContext,
        sink: &mut RecordSink<'_>,
    ) -> AppResult<ProcedureResult> {
        let started_at = Utc::now();
        let finish = |status, records| {
            ProcedureResult::finish(TYPE_ID, ctx.execution_id, started_at, status, records)
        };
        let (Some(conditions), Some(shape)) = (self.conditions.clone(), self.shape.clone()) else {
            return Err(DaqError::configuration("Curve procedure is not configured"));
        };
        info!(
            execution_id = %ctx.execution_id,
            kind = %shape.kind(),
            sample = %conditions.sample,
            "Curve procedure started"
        );

        ctx.abort_signal().clear();
        self.state = ProcedureState::Stabilizing;
        if conditions.stabilize(ctx).await? == StabilizationOutcome::Stopped
            || ctx.abort_signal().is_set()
        {
            warn!("Curve procedure stopped before measuring");
            return Ok(finish(RunStatus::StoppedDuringStabilization, 0));
        }

        self.state = ProcedureState::Measuring;
        let settings = ctx.sweep_settings(self.delay_s, self.pulsed)?;
        let table = CurveRecorder::new(ctx.meter(), ctx.roles(), settings)
            .record(&shape, None)
            .await?;

        let env = conditions.read_environment(ctx).await?;
        for (index, point) in table.points.iter().enumerate() {
            let record = TransportRecord::from_curve_point(index, point, &env, &conditions.sample);
            debug!(index, rds = record.rds, "Emitting record");
            sink(record);
        }

        let status = if table.aborted {
            RunStatus::StoppedDuringSweep
        } else {
            RunStatus::Completed
        };
        info!(records = table.len(), ?status, "Curve procedure finished");
        Ok(finish(status, table.len()))
    }
}

#[async_trait]
impl Procedure for CurveProcedure {
    fn type_info() -> ProcedureTypeInfo {
        let mut parameters = vec![
            ParameterDef::new(
                "variant",
                "string",
                "transfer_by_current",
                None,
                "transfer_by_current, transfer_by_voltage or iv_by_voltage",
            ),
            ParameterDef::new("gate_start", "f64", "0", Some("V"), "Gate sweep start"),
            ParameterDef::new("gate_stop", "f64", "60", Some("V"), "Gate sweep stop"),
            ParameterDef::new("gate_step", "f64", "0.25", Some("V"), "Gate sweep step"),
            ParameterDef::new("drain_currents", "[f64]", "[10e-6]", Some("A"), "Fixed drain currents"),
            ParameterDef::new("drain_voltages", "[f64]", "[0.1]", Some("V"), "Fixed drain voltages"),
            ParameterDef::new("drain_start", "f64", "0", Some("V"), "Drain sweep start"),
            ParameterDef::new("drain_stop", "f64", "1", Some("V"), "Drain sweep stop"),
            ParameterDef::new("drain_step", "f64", "0.05", Some("V"), "Drain sweep step"),
            ParameterDef::new("gate_voltages", "[f64]", "[0]", Some("V"), "Fixed gate voltages"),
            ParameterDef::new("delay", "f64", "-1", Some("s"), "Settling delay, -1 = auto"),
            ParameterDef::new("pulsed", "bool", "false", None, "Return to idle between points"),
        ];
        parameters.extend(ExperimentConditions::parameter_defs());
        ProcedureTypeInfo {
            type_id: TYPE_ID.into(),
            name: "Curve".into(),
            description: "Gate transfer or drain IV curve after cryostat stabilization".into(),
            parameters,
        }
    }

    fn type_id(&self) -> &str {
        TYPE_ID
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    fn configure(&mut self, config: &ProcedureConfig, settings: &Settings) -> AppResult<Vec<String>> {
        let known: Vec<&str> = CURVE_PARAMS.iter().chain(CONDITION_PARAMS.iter()).copied().collect();
        let warnings = config
            .unknown_params(&known)
            .into_iter()
            .map(|name| format!("Unknown parameter '{name}' ignored"))
            .collect();

        self.conditions = Some(ExperimentConditions::from_config(
            config,
            settings.application.in_simulation,
        )?);
        self.shape = Some(Self::shape_from_config(config)?);
        self.delay_s = config.f64_or("delay", -1.0)?;
        self.pulsed = config.bool_or("pulsed", false)?;
        self.state = ProcedureState::Configured;
        Ok(warnings)
    }

    async fn execute(
        &mut self,
        ctx: &ProcedureContext,
        sink: &mut RecordSink<'_>,
    ) -> AppResult<ProcedureResult> {
        ensure_configured(self.state, TYPE_ID)?;
        let outcome = self.run(ctx, sink).await;
        self.state = final_state(&outcome);
        outcome
    }
}
