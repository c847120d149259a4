//! CLI Entry Point for transport_daq
//!
//! Provides command-line interface for:
//! - Running a measurement procedure (or a temperature / field sequence of them)
//! - Checking the layered settings
//! - Listing the available procedure types
//!
//! # Usage
//!
//! Run a transfer curve, overriding one parameter (data lands in `output_dir`):
//! ```bash
//! transport_daq run procedures/transfer.toml --set temperature_setpoint=4.2
//! ```
//!
//! Show the effective settings:
//! ```bash
//! TRANSPORT_DAQ_APPLICATION__IN_SIMULATION=false transport_daq check-config
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use transport_daq::abort::AbortSignal;
use transport_daq::config::{Settings, DEFAULT_SETTINGS_PATH};
use transport_daq::error::DaqError;
use transport_daq::hardware::{
    FeedbackController, InstrumentRegistry, Keithley2600, MockCryostat, MockSmu, SecopController,
    SmuInstrument, TcpTspTransport,
};
use transport_daq::logging;
use transport_daq::procedures::{
    ProcedureConfig, ProcedureContext, ProcedureRegistry, TransportRecord,
};
use transport_daq::stabilization::StabilizationController;
use transport_daq::storage::{RecordWriter, RunHeader};
use transport_daq::sweep::SourceMeter;

#[derive(Parser)]
#[command(name = "transport_daq")]
#[command(about = "Gated transport measurements with a dual-channel SMU and a cryostat", long_about = None)]
struct Cli {
    /// Settings file (TOML); `TRANSPORT_DAQ_*` environment variables override it
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a procedure file once, or once per `[[sequence]]` entry
    Run {
        /// Path to the procedure TOML file
        procedure: PathBuf,

        /// Parameter override, `name=value` (repeatable)
        #[arg(long = "set", value_name = "NAME=VALUE")]
        overrides: Vec<String>,

        /// Write every run into this file instead of one file per run
        #[arg(long, conflicts_with = "stdout")]
        output: Option<PathBuf>,

        /// Write records to stdout instead of one file per run
        #[arg(long)]
        stdout: bool,
    },

    /// Validate and print the effective settings
    CheckConfig,

    /// List procedure types and their parameters
    Procedures,
}

/// Where records of a `run` go.
enum Destination {
    /// `<output_dir>/DATA-<type>_<sample>_T=<T>_B=<B>_<n>.jsonl`, one per run.
    PerRun,
    /// One file for every run.
    File(PathBuf),
    /// Standard output.
    Stdout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.settings)
        .with_context(|| format!("Failed to load settings from {}", cli.settings.display()))?;
    settings.validate()?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Run {
            procedure,
            overrides,
            output,
            stdout,
        } => {
            let destination = match (output, stdout) {
                (Some(path), _) => Destination::File(path),
                (None, true) => Destination::Stdout,
                (None, false) => Destination::PerRun,
            };
            run_procedure(settings, procedure, overrides, destination).await
        }
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Procedures => {
            list_procedures();
            Ok(())
        }
    }
}

async fn run_procedure(
    settings: Settings,
    procedure_path: PathBuf,
    overrides: Vec<String>,
    destination: Destination,
) -> Result<()> {
    let mut config = ProcedureConfig::from_file(&procedure_path)
        .with_context(|| format!("Failed to load procedure {}", procedure_path.display()))?;
    for assignment in &overrides {
        config.apply_override(assignment)?;
    }

    let registry = ProcedureRegistry::new();
    let runs = config.expand_sequence();
    // Configure every run up front so a bad sequence entry fails before any hardware I/O.
    let mut procedures = runs
        .iter()
        .map(|run| registry.create_from_config(run, &settings))
        .collect::<Result<Vec<_>, _>>()?;

    let settings = Arc::new(settings);
    let abort = AbortSignal::new();
    let instruments =
        InstrumentRegistry::new(abort.clone()).with_timing(settings.instrument.timing());
    let (meter, controller) = connect_hardware(&instruments, &settings).await?;
    let stabilizer = Arc::new(
        StabilizationController::new(controller).with_poll_interval(settings.cryostat.poll_interval),
    );
    let mut ctx = ProcedureContext::new(meter, stabilizer, Arc::clone(&settings));

    let ctrl_c_abort = abort.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping at the next abort check");
            ctrl_c_abort.set("Interrupted by operator");
        }
    });

    let mut shared_writer = match &destination {
        Destination::File(path) => Some(RecordWriter::create(path)?),
        Destination::Stdout => Some(RecordWriter::stdout()),
        Destination::PerRun => None,
    };

    let total = procedures.len();
    let outcome = async {
        for (n, (procedure, run)) in procedures.iter_mut().zip(&runs).enumerate() {
            let mut per_run_writer = if shared_writer.is_none() {
                Some(RecordWriter::for_run(&settings.application.output_dir, run)?)
            } else {
                None
            };
            let Some(writer) = per_run_writer.as_mut().or(shared_writer.as_mut()) else {
                break;
            };
            writer.write_header(&RunHeader {
                execution_id: ctx.execution_id,
                started_at: Utc::now(),
                in_simulation: settings.application.in_simulation,
                procedure: run,
            })?;

            info!(run = n + 1, of = total, procedure = procedure.type_id(), "Starting run");
            let mut write_error: Option<DaqError> = None;
            let mut sink = |record: TransportRecord| {
                if write_error.is_none() {
                    write_error = writer.write(&record).err();
                }
            };
            let result = procedure.execute(&ctx, &mut sink).await;
            writer.flush()?;
            if let Some(e) = write_error {
                return Err(anyhow::Error::from(e).context("Failed to write records"));
            }

            let result = result?;
            info!("{}", result.summary());
            if result.status.is_stopped() {
                warn!(remaining = total - n - 1, "Run stopped, skipping remaining runs");
                break;
            }
            ctx = ctx.next_run();
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if let Err(e) = &outcome {
        error!(error = %e, "Run failed");
    }
    if let Err(e) = instruments.disconnect_all().await {
        warn!(error = %e, "Instrument teardown failed");
    }
    outcome
}

/// Meter from the registry and the cryostat controller, simulated or real.
async fn connect_hardware(
    instruments: &InstrumentRegistry,
    settings: &Settings,
) -> Result<(Arc<SourceMeter>, Arc<dyn FeedbackController>)> {
    let address = settings.instrument.address.clone();

    if settings.application.in_simulation {
        info!(%address, "Simulation mode: using mock SMU and cryostat");
        let mock_address = address.clone();
        let meter = instruments
            .get_or_connect(&address, || async move {
                Ok(Arc::new(MockSmu::new(mock_address)) as Arc<dyn SmuInstrument>)
            })
            .await?;
        return Ok((meter, Arc::new(MockCryostat::new())));
    }

    let query_timeout = settings.instrument.query_timeout;
    let resource = address.clone();
    let meter = instruments
        .get_or_connect(&address, || async move {
            let socket = TcpTspTransport::socket_address(&resource)?;
            let transport = TcpTspTransport::connect(&socket)
                .await?
                .with_timeout(query_timeout);
            Ok(Arc::new(Keithley2600::new(resource, Arc::new(transport))) as Arc<dyn SmuInstrument>)
        })
        .await?;

    let cryostat = SecopController::new(
        settings.cryostat.address.clone(),
        settings.cryostat.modules.clone(),
    );
    info!(smu = %address, cryostat = %cryostat.address(), "Hardware connected");
    Ok((meter, Arc::new(cryostat)))
}

fn list_procedures() {
    for info in ProcedureRegistry::new().list_types() {
        println!("{} - {}", info.type_id, info.description);
        for param in &info.parameters {
            let units = param
                .units
                .as_deref()
                .map(|u| format!(" [{u}]"))
                .unwrap_or_default();
            println!(
                "    {:<22} {:<7} default {:<20} {}{}",
                param.name, param.param_type, param.default, param.description, units
            );
        }
        println!();
    }
}
