//! Integration tests for the sweep engine against the simulated SMU.
//!
//! These tests drive `SourceMeter` and `CurveRecorder` end to end and check
//! the observable hardware traffic recorded by `MockSmu`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_err;
use transport_daq::error::DaqError;
use transport_daq::hardware::capabilities::{Buffer, SourceFunction};
use transport_daq::hardware::MockSmu;
use transport_daq::sweep::recorder::BatchCallback;
use transport_daq::sweep::{
    run_transfer_sweep, AxisSpec, ChannelRoles, CurvePoint, CurveRecorder, CurveShape, DrainBias,
    SourceMeter, SweepSettings, SweepTiming,
};

fn fast_meter(smu: &Arc<MockSmu>) -> SourceMeter {
    SourceMeter::new(smu.clone()).with_timing(SweepTiming {
        poll_interval: Duration::from_millis(1),
        max_wait: Some(Duration::from_secs(2)),
    })
}

fn dc() -> SweepSettings {
    SweepSettings::dc(20e-3)
}

// =============================================================================
// Dual / single sweeps
// =============================================================================

#[tokio::test]
async fn test_dual_sweep_measures_both_channels_point_for_point() {
    let smu = Arc::new(
        MockSmu::new("sim")
            .with_resistance("smub", 2.0e3)
            .with_resistance("smua", 1.0e6),
    );
    let meter = fast_meter(&smu);
    let lead = meter
        .channel_sweep("smub", SourceFunction::Current, vec![1e-6; 4])
        .unwrap();
    let follower = meter
        .channel_sweep("smua", SourceFunction::Voltage, vec![0.0, 1.0, 2.0, 3.0])
        .unwrap();

    let result = meter.run_dual_sweep(&lead, &follower, &dc()).await.unwrap();

    assert_eq!(result.lead.len(), 4);
    assert_eq!(result.follower.len(), 4);
    assert!(result.lead.voltage.iter().all(|v| (v - 2.0e-3).abs() < 1e-12));
    assert!((result.follower.current[3] - 3.0e-6).abs() < 1e-15);

    let calls = smu.calls();
    let position = |call: &str| calls.iter().position(|c| c == call).unwrap();
    assert!(position("smub.initiate") < position("send_trigger"));
    assert!(position("smua.initiate") < position("send_trigger"));
    assert!(smu.output_enabled("smua") && smu.output_enabled("smub"));
    assert_eq!(smu.trigger_count("smub"), 4);
}

#[tokio::test]
async fn test_abort_before_sweep_returns_empty_without_hardware_io() {
    let smu = Arc::new(MockSmu::new("sim"));
    let meter = fast_meter(&smu);
    let lead = meter
        .channel_sweep("smub", SourceFunction::Current, vec![1e-6; 3])
        .unwrap();
    let follower = meter
        .channel_sweep("smua", SourceFunction::Voltage, vec![0.0; 3])
        .unwrap();

    meter.abort_signal().set("operator stop");
    let result = meter.run_dual_sweep(&lead, &follower, &dc()).await.unwrap();

    assert!(result.is_empty());
    assert!(smu.calls().is_empty());
}

#[tokio::test]
async fn test_unequal_lists_fail_before_hardware_writes() {
    let smu = Arc::new(MockSmu::new("sim"));
    let meter = fast_meter(&smu);
    let lead = meter
        .channel_sweep("smub", SourceFunction::Current, vec![1e-6; 3])
        .unwrap();
    let follower = meter
        .channel_sweep("smua", SourceFunction::Voltage, vec![0.0; 2])
        .unwrap();

    let err = meter
        .run_dual_sweep(&lead, &follower, &dc())
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert_eq!(smu.call_count("smub.initiate"), 0);
    assert!(smu.calls().is_empty());
}

#[tokio::test]
async fn test_integration_time_out_of_range_is_a_configuration_error() {
    let smu = Arc::new(MockSmu::new("sim").with_line_frequency(60.0));
    let meter = fast_meter(&smu);
    let sweep = meter
        .channel_sweep("smub", SourceFunction::Current, vec![1e-6])
        .unwrap();

    let err = meter
        .run_single_sweep(&sweep, &SweepSettings::dc(0.5))
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert_eq!(smu.call_count("smub.load_sweep_list"), 0);
}

#[tokio::test]
async fn test_consecutive_sweeps_do_not_return_stale_readings() {
    let smu = Arc::new(MockSmu::new("sim"));
    let meter = fast_meter(&smu);
    let sweep = meter
        .channel_sweep("smub", SourceFunction::Current, vec![1e-6, 2e-6, 3e-6])
        .unwrap();

    let first = meter.run_single_sweep(&sweep, &dc()).await.unwrap();
    let second = meter.run_single_sweep(&sweep, &dc()).await.unwrap();

    assert_eq!(first.len(), 3);
    assert_eq!(second, first);
    assert_eq!(smu.buffered("smub", Buffer::Current), 0);
    assert_eq!(smu.buffered("smub", Buffer::Voltage), 0);
}

#[tokio::test]
async fn test_blender_slots_are_released_after_success_and_errors() {
    let smu = Arc::new(MockSmu::new("sim"));
    let meter = fast_meter(&smu);
    let total = meter.slot_pool().available();
    let lead = meter
        .channel_sweep("smub", SourceFunction::Current, vec![1e-6; 2])
        .unwrap();
    let follower = meter
        .channel_sweep("smua", SourceFunction::Voltage, vec![0.0; 2])
        .unwrap();

    meter.run_dual_sweep(&lead, &follower, &dc()).await.unwrap();
    assert_eq!(meter.slot_pool().available(), total);

    smu.fail_on("smua.initiate");
    let err = meter
        .run_dual_sweep(&lead, &follower, &dc())
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Transport(_)));
    assert!(err.to_string().contains("smua.initiate"));
    assert_eq!(meter.slot_pool().available(), total);
}

#[tokio::test]
async fn test_sweep_that_never_finishes_times_out() {
    let smu = Arc::new(MockSmu::new("sim").stuck_sweeping());
    let limit = Duration::from_millis(20);
    let meter = SourceMeter::new(smu.clone()).with_timing(SweepTiming {
        poll_interval: Duration::from_millis(1),
        max_wait: Some(limit),
    });
    let sweep = meter
        .channel_sweep("smub", SourceFunction::Current, vec![1e-6])
        .unwrap();

    let err = assert_err!(meter.run_single_sweep(&sweep, &dc()).await);

    assert!(matches!(err, DaqError::SweepTimeout(d) if d == limit));
    assert_eq!(meter.slot_pool().available(), 6);
}

// =============================================================================
// Curve recording
// =============================================================================

#[tokio::test]
async fn test_transfer_sweep_runs_gate_there_and_back_per_drain_bias() {
    let smu = Arc::new(MockSmu::new("sim").with_resistance("smub", 1.0e3));
    let meter = fast_meter(&smu);
    let mut batches = Vec::new();
    let on_batch: &mut BatchCallback<'_> =
        &mut |outer: f64, rows: &[CurvePoint]| batches.push((outer, rows.len()));

    let table = run_transfer_sweep(
        &meter,
        ChannelRoles::new("smua", "smub"),
        AxisSpec::new(0.0, 1.0, 1.0),
        DrainBias::Voltage(vec![0.1, 0.2]),
        dc(),
        Some(on_batch),
    )
    .await
    .unwrap();

    assert_eq!(batches, vec![(0.1, 4), (0.2, 4)]);
    assert_eq!(table.len(), 8);
    assert!(!table.aborted);
    assert_eq!(smu.sweep_list("smua"), vec![0.0, 1.0, 1.0, 0.0]);
    assert_eq!(smu.sweep_list("smub"), vec![0.2; 4]);
    let directions: Vec<Option<bool>> = table.points[..4].iter().map(|p| p.gate_forward).collect();
    assert_eq!(
        directions,
        vec![Some(true), Some(true), Some(false), Some(false)]
    );
    assert!((table.points[5].drain_current - 2.0e-4).abs() < 1e-12);
    assert_eq!(smu.resets(), 1);
}

#[tokio::test]
async fn test_abort_during_second_sweep_keeps_first_batch_only() {
    let smu = Arc::new(MockSmu::new("sim"));
    let meter = fast_meter(&smu);
    let abort = meter.abort_signal().clone();
    let triggers = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&triggers);
    smu.on_trigger(Box::new(move || {
        if seen.fetch_add(1, Ordering::SeqCst) == 1 {
            abort.set("operator stop");
        }
    }));

    let shape = CurveShape::TransferByCurrent {
        gate: AxisSpec::new(0.0, 2.0, 1.0),
        drain_currents: vec![1e-6, 2e-6, 3e-6],
    };
    let table = CurveRecorder::new(&meter, ChannelRoles::new("smua", "smub"), dc())
        .record(&shape, None)
        .await
        .unwrap();

    assert!(table.aborted);
    assert_eq!(table.len(), 6);
    assert_eq!(table.outer_values(), vec![1e-6]);
    assert_eq!(triggers.load(Ordering::SeqCst), 2);
    assert_eq!(smu.resets(), 1);
    assert_eq!(smu.beeps().len(), 1);
}

#[tokio::test]
async fn test_recorder_rejects_same_channel_for_gate_and_drain() {
    let smu = Arc::new(MockSmu::new("sim"));
    let meter = fast_meter(&smu);
    let shape = CurveShape::IvByVoltage {
        drain: AxisSpec::new(0.0, 1.0, 0.5),
        gate_voltages: vec![0.0],
    };

    let err = CurveRecorder::new(&meter, ChannelRoles::new("smub", "smub"), dc())
        .record(&shape, None)
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert_eq!(smu.call_count("send_trigger"), 0);
}
