//! Drain IV curve sourced as current on a single channel.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::SourceFunction;
use crate::procedures::conditions::{ExperimentConditions, CONDITION_PARAMS};
use crate::procedures::{
    ensure_configured, final_state, ParameterDef, Procedure, ProcedureConfig, ProcedureContext,
    ProcedureResult, ProcedureState, ProcedureTypeInfo, RecordSink, RunStatus, TransportRecord,
};
use crate::stabilization::StabilizationOutcome;
use crate::sweep::{AxisSpec, SweepAxis};

const TYPE_ID: &str = "current_iv";

const IV_PARAMS: [&str; 5] = ["drain_start", "drain_stop", "drain_step", "delay", "pulsed"];

/// Drain current sweep on the drain channel only; the gate is left untouched.
pub struct CurrentIvProcedure {
    state: ProcedureState,
    conditions: Option<ExperimentConditions>,
    drain: AxisSpec,
    delay_s: f64,
    pulsed: bool,
}

impl Default for CurrentIvProcedure {
    fn default() -> Self {
        Self {
            state: ProcedureState::Idle,
            conditions: None,
            drain: AxisSpec::new(0.0, 100e-6, 5e-6),
            delay_s: -1.0,
            pulsed: false,
        }
    }
}

impl CurrentIvProcedure {
    /// Drain current axis.
    pub fn drain_axis(&self) -> AxisSpec {
        self.drain
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
        let Some(conditions) = self.conditions.clone() else {
            return Err(DaqError::configuration("Current IV procedure is not configured"));
        };
        let setpoints = SweepAxis::forward(&self.drain)?.values().to_vec();
        info!(
            execution_id = %ctx.execution_id,
            points = setpoints.len(),
            sample = %conditions.sample,
            "Current IV procedure started"
        );

        ctx.abort_signal().clear();
        self.state = ProcedureState::Stabilizing;
        if conditions.stabilize(ctx).await? == StabilizationOutcome::Stopped
            || ctx.abort_signal().is_set()
        {
            warn!("Current IV procedure stopped before measuring");
            return Ok(finish(RunStatus::StoppedDuringStabilization, 0));
        }

        self.state = ProcedureState::Measuring;
        let meter = ctx.meter();
        let sweep = meter.channel_sweep(&ctx.roles().drain, SourceFunction::Current, setpoints)?;
        let settings = ctx.sweep_settings(self.delay_s, self.pulsed)?;
        let readings = meter.run_single_sweep(&sweep, &settings).await?;
        meter.instrument().reset().await?;

        let env = conditions.read_environment(ctx).await?;
        let count = readings.len().min(sweep.values.len());
        for index in 0..count {
            sink(TransportRecord::from_drain_reading(
                index,
                sweep.values[index],
                readings.voltage[index],
                readings.current[index],
                &env,
                &conditions.sample,
            ));
        }

        let status = if ctx.abort_signal().is_set() {
            RunStatus::StoppedDuringSweep
        } else {
            RunStatus::Completed
        };
        info!(records = count, ?status, "Current IV procedure finished");
        Ok(finish(status, count))
    }
}

#[async_trait]
impl Procedure for CurrentIvProcedure {
    fn type_info() -> ProcedureTypeInfo {
        let mut parameters = vec![
            ParameterDef::new("drain_start", "f64", "0", Some("A"), "Drain current start"),
            ParameterDef::new("drain_stop", "f64", "100e-6", Some("A"), "Drain current stop"),
            ParameterDef::new("drain_step", "f64", "5e-6", Some("A"), "Drain current step"),
            ParameterDef::new("delay", "f64", "-1", Some("s"), "Settling delay, -1 = auto"),
            ParameterDef::new("pulsed", "bool", "false", None, "Return to idle between points"),
        ];
        parameters.extend(ExperimentConditions::parameter_defs());
        ProcedureTypeInfo {
            type_id: TYPE_ID.into(),
            name: "Current IV".into(),
            description: "Drain IV curve sourced as current on one channel".into(),
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
        let known: Vec<&str> = IV_PARAMS.iter().chain(CONDITION_PARAMS.iter()).copied().collect();
        let warnings = config
            .unknown_params(&known)
            .into_iter()
            .map(|name| format!("Unknown parameter '{name}' ignored"))
            .collect();

        let drain = AxisSpec::new(
            config.f64_or("drain_start", 0.0)?,
            config.f64_or("drain_stop", 100e-6)?,
            config.f64_or("drain_step", 5e-6)?,
        );
        drain.forward_values()?;

        self.conditions = Some(ExperimentConditions::from_config(
            config,
            settings.application.in_simulation,
        )?);
        self.drain = drain;
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
