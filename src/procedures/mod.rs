//! Measurement procedures.
//!
//! A procedure is a parameterized run: bring the cryostat to the requested
//! conditions, sweep the SMU, and hand one [`TransportRecord`] per measured
//! point to a sink.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     ProcedureRegistry                         │
//! │        ┌──────────────────┐   ┌────────────────────┐          │
//! │        │ CurveProcedure   │   │ CurrentIvProcedure │          │
//! │        └──────────────────┘   └────────────────────┘          │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Procedure trait: configure() → execute(ctx, sink) → result   │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ProcedureContext: SourceMeter | StabilizationController      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let config = ProcedureConfig::from_file("procedures/transfer.toml")?;
//! let registry = ProcedureRegistry::new();
//! let mut procedure = registry.create_from_config(&config, &settings)?;
//! let result = procedure
//!     .execute(&ctx, &mut |record| println!("{record:?}"))
//!     .await?;
//! ```

pub mod conditions;
pub mod config;
pub mod current_iv;
pub mod curve;
pub mod record;
pub mod result;

pub use conditions::ExperimentConditions;
pub use config::{ConfigValue, ProcedureConfig};
pub use current_iv::CurrentIvProcedure;
pub use curve::CurveProcedure;
pub use record::{EnvironmentReading, RecordSink, TransportRecord};
pub use result::{ProcedureResult, RunStatus};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::abort::AbortSignal;
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::stabilization::StabilizationController;
use crate::sweep::{ChannelRoles, SourceMeter, SweepSettings};

// =============================================================================
// Procedure Trait
// =============================================================================

/// Static description of a procedure type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureTypeInfo {
    /// Registry id (`curve`, `current_iv`).
    pub type_id: String,
    /// Human-readable name.
    pub name: String,
    /// What the procedure measures.
    pub description: String,
    /// Accepted parameters.
    pub parameters: Vec<ParameterDef>,
}

/// One accepted parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name.
    pub name: String,
    /// Value type (`f64`, `bool`, `string`, `[f64]`).
    pub param_type: String,
    /// Default, as text.
    pub default: String,
    /// Physical unit.
    pub units: Option<String>,
    /// Description.
    pub description: String,
}

impl ParameterDef {
    /// Catalog entry.
    pub fn new(
        name: &str,
        param_type: &str,
        default: &str,
        units: Option<&str>,
        description: &str,
    ) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            default: default.into(),
            units: units.map(Into::into),
            description: description.into(),
        }
    }
}

/// Lifecycle of a procedure instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureState {
    /// Created, not configured.
    Idle,
    /// Parameters accepted.
    Configured,
    /// Waiting for the cryostat.
    Stabilizing,
    /// Sweeping.
    Measuring,
    /// Finished normally.
    Completed,
    /// Stopped by the abort signal.
    Stopped,
    /// Finished with an error.
    Failed,
}

/// A configurable measurement run.
#[async_trait]
pub trait Procedure: Send + Sync + 'static {
    /// Static information about this procedure type.
    fn type_info() -> ProcedureTypeInfo
    where
        Self: Sized;

    /// Registry id of this instance.
    fn type_id(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> ProcedureState;

    /// Accept parameters. Returns warnings (e.g. unknown parameter names).
    fn configure(&mut self, config: &ProcedureConfig, settings: &Settings) -> AppResult<Vec<String>>;

    /// Run once, handing rows to `sink` as they are produced.
    async fn execute(
        &mut self,
        ctx: &ProcedureContext,
        sink: &mut RecordSink<'_>,
    ) -> AppResult<ProcedureResult>;

    /// Ask a running execution to stop at its next abort check.
    fn cancel(&self, ctx: &ProcedureContext) {
        ctx.cancel(format!("{} cancelled", self.type_id()));
    }
}

/// Map an execution outcome to the final lifecycle state.
pub(crate) fn final_state(outcome: &AppResult<ProcedureResult>) -> ProcedureState {
    match outcome {
        Ok(result) if result.status.is_stopped() => ProcedureState::Stopped,
        Ok(_) => ProcedureState::Completed,
        Err(_) => ProcedureState::Failed,
    }
}

/// Reject execution of an unconfigured procedure.
pub(crate) fn ensure_configured(state: ProcedureState, type_id: &str) -> AppResult<()> {
    if state == ProcedureState::Idle {
        return Err(DaqError::configuration(format!(
            "Procedure '{type_id}' executed before configure()"
        )));
    }
    Ok(())
}

// =============================================================================
// Procedure Context
// =============================================================================

/// Hardware and settings a procedure runs against.
#[derive(Clone)]
pub struct ProcedureContext {
    /// Id of the current run.
    pub execution_id: Uuid,
    meter: Arc<SourceMeter>,
    stabilizer: Arc<StabilizationController>,
    settings: Arc<Settings>,
}

impl ProcedureContext {
    /// Context for one run.
    pub fn new(
        meter: Arc<SourceMeter>,
        stabilizer: Arc<StabilizationController>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            meter,
            stabilizer,
            settings,
        }
    }

    /// Same hardware, fresh run id.
    pub fn next_run(&self) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            ..self.clone()
        }
    }

    /// Source-measure unit.
    pub fn meter(&self) -> &SourceMeter {
        &self.meter
    }

    /// Cryostat control loop.
    pub fn stabilizer(&self) -> &StabilizationController {
        &self.stabilizer
    }

    /// Application settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Abort signal shared with the meter.
    pub fn abort_signal(&self) -> &AbortSignal {
        self.meter.abort_signal()
    }

    /// Raise the abort signal.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.abort_signal().set(reason);
    }

    /// Gate / drain assignment from settings.
    pub fn roles(&self) -> ChannelRoles {
        self.settings.instrument.drain_channel.roles()
    }

    /// Sweep settings with the configured integration time.
    pub fn sweep_settings(&self, delay_s: f64, pulsed: bool) -> AppResult<SweepSettings> {
        SweepSettings::new(self.settings.instrument.integration_time, delay_s, pulsed)
    }
}

impl std::fmt::Debug for ProcedureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureContext")
            .field("execution_id", &self.execution_id)
            .field("meter", &self.meter)
            .finish()
    }
}

// =============================================================================
// Procedure Registry
// =============================================================================

/// Creates an unconfigured procedure.
pub type ProcedureFactory = fn() -> Box<dyn Procedure>;

/// Procedure types by id.
pub struct ProcedureRegistry {
    factories: BTreeMap<String, ProcedureFactory>,
    infos: BTreeMap<String, ProcedureTypeInfo>,
}

impl ProcedureRegistry {
    /// Registry with the built-in procedures.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_type::<CurveProcedure>();
        registry.register_type::<CurrentIvProcedure>();
        registry
    }

    /// Registry without any procedure types.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
            infos: BTreeMap::new(),
        }
    }

    /// Register a procedure type.
    pub fn register_type<P: Procedure + Default>(&mut self) {
        let info = P::type_info();
        let type_id = info.type_id.clone();
        self.infos.insert(type_id.clone(), info);
        self.factories
            .insert(type_id, || Box::new(P::default()) as Box<dyn Procedure>);
    }

    /// Registered types, sorted by id.
    pub fn list_types(&self) -> Vec<&ProcedureTypeInfo> {
        self.infos.values().collect()
    }

    /// Info for one type.
    pub fn get_type_info(&self, type_id: &str) -> Option<&ProcedureTypeInfo> {
        self.infos.get(type_id)
    }

    /// Instantiate and configure the procedure a config names.
    pub fn create_from_config(
        &self,
        config: &ProcedureConfig,
        settings: &Settings,
    ) -> AppResult<Box<dyn Procedure>> {
        let factory = self.factories.get(&config.procedure_type).ok_or_else(|| {
            DaqError::configuration(format!(
                "Unknown procedure type '{}' (known: {})",
                config.procedure_type,
                self.factories.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;

        let mut procedure = factory();
        for warning in procedure.configure(config, settings)? {
            warn!(procedure = %config.procedure_type, "{warning}");
        }
        Ok(procedure)
    }
}

impl Default for ProcedureRegistry {
    fn default() -> Self {
        Self::new()
    }
}
