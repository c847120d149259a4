//! End-to-end procedure runs over simulated hardware, plus checks that the
//! shipped settings and procedure files load.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serial_test::serial;
use tempfile::tempdir;
use uuid::Uuid;

use transport_daq::config::Settings;
use transport_daq::hardware::{MockCryostat, MockSmu};
use transport_daq::procedures::{
    ProcedureConfig, ProcedureContext, ProcedureRegistry, ProcedureState, RunStatus,
    TransportRecord,
};
use transport_daq::stabilization::StabilizationController;
use transport_daq::storage::{RecordWriter, RunHeader};
use transport_daq::sweep::{SourceMeter, SweepTiming};

fn manifest_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(relative)
}

fn simulated_context(smu: Arc<MockSmu>, settings: Settings) -> ProcedureContext {
    let meter = SourceMeter::new(smu).with_timing(SweepTiming {
        poll_interval: Duration::from_millis(1),
        max_wait: Some(Duration::from_secs(5)),
    });
    let stabilizer = StabilizationController::new(Arc::new(MockCryostat::new()))
        .with_poll_interval(Duration::from_millis(1));
    ProcedureContext::new(Arc::new(meter), Arc::new(stabilizer), Arc::new(settings))
}

// =============================================================================
// Shipped files
// =============================================================================

#[test]
#[serial]
fn test_shipped_settings_match_defaults() {
    let settings = Settings::load_from(manifest_path("config/transport.toml")).unwrap();
    settings.validate().unwrap();
    assert_eq!(settings, Settings::default());
}

#[test]
fn test_shipped_procedures_configure() {
    let registry = ProcedureRegistry::new();
    let settings = Settings::default();

    for (file, runs) in [
        ("procedures/transfer.toml", 1),
        ("procedures/transfer_sequence.toml", 3),
        ("procedures/iv.toml", 1),
    ] {
        let config = ProcedureConfig::from_file(manifest_path(file)).unwrap();
        let expanded = config.expand_sequence();
        assert_eq!(expanded.len(), runs, "{file}");
        for run in &expanded {
            let procedure = registry.create_from_config(run, &settings).unwrap();
            assert_eq!(procedure.state(), ProcedureState::Configured, "{file}");
        }
    }
}

#[test]
fn test_sequence_entries_carry_their_own_conditions() {
    let config =
        ProcedureConfig::from_file(manifest_path("procedures/transfer_sequence.toml")).unwrap();
    let fields: Vec<f64> = config
        .expand_sequence()
        .iter()
        .map(|run| run.f64_or("field_setpoint", f64::NAN).unwrap())
        .collect();
    assert_eq!(fields, vec![0.0, 1.0, 0.0]);
}

// =============================================================================
// Runs
// =============================================================================

#[tokio::test]
async fn test_transfer_run_writes_resistance_rows_to_disk() {
    let smu = Arc::new(MockSmu::new("sim").with_resistance("smub", 4.7e3));
    let settings = Settings::default();
    let ctx = simulated_context(smu.clone(), settings.clone());

    let mut config = ProcedureConfig::from_file(manifest_path("procedures/transfer.toml")).unwrap();
    config.apply_override("gate_stop=2").unwrap();
    config.apply_override("gate_step=1").unwrap();
    config.apply_override("sample=flake 7").unwrap();
    let mut procedure = ProcedureRegistry::new()
        .create_from_config(&config, &settings)
        .unwrap();

    let dir = tempdir().unwrap();
    let mut writer = RecordWriter::for_run(dir.path(), &config).unwrap();
    writer
        .write_header(&RunHeader {
            execution_id: ctx.execution_id,
            started_at: Utc::now(),
            in_simulation: true,
            procedure: &config,
        })
        .unwrap();
    let result = procedure
        .execute(&ctx, &mut |row| writer.write(&row).unwrap())
        .await
        .unwrap();
    writer.flush().unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.records, 6);
    assert_eq!(result.execution_id, ctx.execution_id);

    let path = writer.path().unwrap().to_path_buf();
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        "DATA-curve_flake-7_T=300_B=0_1.jsonl"
    );
    let rows: Vec<TransportRecord> = std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 6);
    assert_eq!(
        rows.iter().map(|r| r.gate_setpoint.unwrap()).collect::<Vec<_>>(),
        vec![0.0, 1.0, 2.0, 2.0, 1.0, 0.0]
    );
    assert!(rows.iter().all(|r| (r.rds - 4.7e3).abs() < 1e-6));
    assert!(rows.iter().all(|r| r.sample == "flake 7" && r.temperature == -1.0));
    assert_eq!(smu.resets(), 1);
}

#[tokio::test]
async fn test_cancel_before_run_is_cleared_at_start() {
    let smu = Arc::new(MockSmu::new("sim"));
    let ctx = simulated_context(smu.clone(), Settings::default());
    let mut procedure = ProcedureRegistry::new()
        .create_from_config(
            &ProcedureConfig::new("current_iv").with_param("drain_stop", 10e-6),
            &Settings::default(),
        )
        .unwrap();

    procedure.cancel(&ctx);
    assert!(ctx.abort_signal().is_set());

    let mut rows = Vec::new();
    let result = procedure
        .execute(&ctx, &mut |row| rows.push(row))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(rows.len(), 3);
    assert_eq!(procedure.state(), ProcedureState::Completed);
}

#[tokio::test]
async fn test_next_run_keeps_hardware_and_changes_id() {
    let ctx = simulated_context(Arc::new(MockSmu::new("sim")), Settings::default());
    let next = ctx.next_run();
    assert_ne!(next.execution_id, ctx.execution_id);
    assert_ne!(next.execution_id, Uuid::nil());
    assert!(next.abort_signal().same_as(ctx.abort_signal()));
}
