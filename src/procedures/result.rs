//! Procedure run summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Every planned point was measured.
    Completed,
    /// Stopped while waiting for the cryostat; no rows emitted.
    StoppedDuringStabilization,
    /// Stopped while sweeping; rows measured before the stop were emitted.
    StoppedDuringSweep,
}

impl RunStatus {
    /// True for either stopped status.
    pub fn is_stopped(&self) -> bool {
        !matches!(self, RunStatus::Completed)
    }
}

/// Summary of one procedure run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureResult {
    /// Procedure type that ran.
    pub procedure_type: String,
    /// Unique run id.
    pub execution_id: Uuid,
    /// How the run ended.
    pub status: RunStatus,
    /// Rows handed to the sink.
    pub records: usize,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
}

impl ProcedureResult {
    /// Result stamped with the current time as end.
    pub fn finish(
        procedure_type: impl Into<String>,
        execution_id: Uuid,
        started_at: DateTime<Utc>,
        status: RunStatus,
        records: usize,
    ) -> Self {
        Self {
            procedure_type: procedure_type.into(),
            execution_id,
            status,
            records,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Wall-clock duration of the run.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} {}: {:?}, {} records in {:.1} s",
            self.procedure_type,
            self.execution_id,
            self.status,
            self.records,
            self.duration().num_milliseconds() as f64 / 1000.0
        )
    }
}
