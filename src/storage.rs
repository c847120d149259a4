//! JSON-lines data files.
//!
//! Each run writes a header of `# `-prefixed JSON describing the procedure,
//! followed by one [`TransportRecord`] per line.
//!
//! ```text
//! # {
//! #   "execution_id": "6c1e...",
//! #   "procedure": { "type": "curve", "params": { ... } }
//! # }
//! {"index":0,"temperature_setpoint":4.2,...}
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::error::AppResult;
use crate::procedures::{ProcedureConfig, TransportRecord};

/// Data file extension.
pub const EXTENSION: &str = "jsonl";

/// Metadata written at the top of every run.
#[derive(Debug, Clone, Serialize)]
pub struct RunHeader<'a> {
    /// Run id.
    pub execution_id: Uuid,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Whether simulated hardware was used.
    pub in_simulation: bool,
    /// Parameters of the run.
    pub procedure: &'a ProcedureConfig,
}

/// File name prefix naming the procedure, sample and conditions,
/// e.g. `DATA-curve_TBG-3_T=4.2_B=0_`.
pub fn run_prefix(config: &ProcedureConfig) -> AppResult<String> {
    let prefix = format!(
        "DATA-{}_{}_T={}_B={}_",
        config.procedure_type,
        config.str_or("sample", "blank")?,
        config.f64_or("temperature_setpoint", 300.0)?,
        config.f64_or("field_setpoint", 0.0)?,
    );
    Ok(prefix
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '-' } else { c })
        .collect())
}

/// First `<dir>/<prefix><n>.jsonl` that does not exist yet, counting from 1.
pub fn unique_filename(dir: &Path, prefix: &str) -> PathBuf {
    (1u64..)
        .map(|n| dir.join(format!("{prefix}{n}.{EXTENSION}")))
        .find(|path| !path.exists())
        .unwrap_or_else(|| dir.join(format!("{prefix}.{EXTENSION}")))
}

/// Writes headers and records as JSON lines.
pub struct RecordWriter {
    path: Option<PathBuf>,
    out: Box<dyn Write + Send>,
    records: usize,
}

impl RecordWriter {
    /// Create (or truncate) `path`, creating parent directories.
    pub fn create(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        info!(path = %path.display(), "Writing records");
        Ok(Self {
            path: Some(path),
            out: Box::new(BufWriter::new(file)),
            records: 0,
        })
    }

    /// Unique file for a run inside `dir`.
    pub fn for_run(dir: &Path, config: &ProcedureConfig) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        Self::create(unique_filename(dir, &run_prefix(config)?))
    }

    /// Write to standard output.
    pub fn stdout() -> Self {
        Self {
            path: None,
            out: Box::new(std::io::stdout()),
            records: 0,
        }
    }

    /// Destination file; `None` for stdout.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records written so far.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Write a run header as `# `-prefixed pretty JSON.
    pub fn write_header(&mut self, header: &RunHeader<'_>) -> AppResult<()> {
        let json = serde_json::to_string_pretty(header)?;
        for line in json.lines() {
            writeln!(self.out, "# {line}")?;
        }
        Ok(())
    }

    /// Append one record.
    pub fn write(&mut self, record: &TransportRecord) -> AppResult<()> {
        serde_json::to_writer(&mut self.out, record)?;
        writeln!(self.out)?;
        self.records += 1;
        Ok(())
    }

    /// Flush buffered output.
    pub fn flush(&mut self) -> AppResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for RecordWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordWriter")
            .field("path", &self.path)
            .field("records", &self.records)
            .finish()
    }
}
