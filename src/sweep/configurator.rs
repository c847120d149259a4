//! Programs one channel for a list sweep.
//!
//! Statement order matters on real hardware: the list is loaded and the
//! source action enabled before timing and ranges are set, buffers are
//! cleared before the trigger count is written, and measurements are routed
//! into the buffers last.

use tracing::debug;

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Buffer, MeasureDelay, SmuChannel};
use crate::hardware::trigger::{IdlePhase, SourceIdleAction, TriggerStage};
use crate::sweep::{ChannelSweep, SweepSettings};

/// Shortest integration time accepted by the instrument, in power-line cycles.
pub const MIN_NPLC: f64 = 0.001;
/// Longest integration time accepted by the instrument, in power-line cycles.
pub const MAX_NPLC: f64 = 25.0;

impl MeasureDelay {
    /// `-1` selects auto-settle; any other non-negative value is a fixed wait.
    pub fn from_seconds(seconds: f64) -> AppResult<Self> {
        if seconds == -1.0 {
            Ok(MeasureDelay::Auto)
        } else if seconds.is_finite() && seconds >= 0.0 {
            Ok(MeasureDelay::Fixed(seconds))
        } else {
            Err(DaqError::configuration(format!(
                "Measurement delay must be -1 (auto) or >= 0 s, got {seconds}"
            )))
        }
    }
}

/// Convert an integration time in seconds to power-line cycles.
pub fn integration_nplc(integration_time_s: f64, line_frequency_hz: f64) -> AppResult<f64> {
    let nplc = integration_time_s * line_frequency_hz;
    if !nplc.is_finite() || !(MIN_NPLC..=MAX_NPLC).contains(&nplc) {
        return Err(DaqError::configuration(format!(
            "Integration time {integration_time_s} s is {nplc} PLC at {line_frequency_hz} Hz; \
             must be between {MIN_NPLC} and {MAX_NPLC} PLC"
        )));
    }
    Ok(nplc)
}

/// Clear both reading buffers and their caches.
pub async fn clear_buffers(channel: &dyn SmuChannel) -> AppResult<()> {
    for buffer in Buffer::ALL {
        channel.clear_buffer(buffer).await?;
    }
    for buffer in Buffer::ALL {
        channel.clear_buffer_cache(buffer).await?;
    }
    Ok(())
}

/// Program `sweep.channel` to source `sweep.values` one per trigger and measure after each step.
///
/// Autorange is enabled for the measured quantity unless the channel is in
/// high-capacitance mode.
pub async fn configure_channel(
    sweep: &ChannelSweep,
    nplc: f64,
    settings: &SweepSettings,
) -> AppResult<()> {
    let channel = sweep.channel.as_ref();
    debug!(
        channel = channel.name(),
        function = ?sweep.function,
        points = sweep.values.len(),
        nplc,
        delay = %settings.delay,
        pulsed = settings.pulsed,
        "Configuring channel sweep"
    );

    channel.load_sweep_list(sweep.function, &sweep.values).await?;
    channel.set_trigger_action(TriggerStage::Source, true).await?;
    channel.set_integration_time(nplc).await?;
    channel.set_measure_delay(settings.delay).await?;

    if channel.high_capacitance().await? {
        debug!(channel = channel.name(), "High-capacitance mode, autorange left off");
    } else {
        channel.set_autorange(sweep.function.measured(), true).await?;
    }

    channel.set_source_function(sweep.function).await?;
    clear_buffers(channel).await?;
    channel.set_trigger_count(sweep.values.len()).await?;
    channel.set_trigger_action(TriggerStage::Measure, true).await?;
    channel.measure_into_buffers().await?;

    let action = SourceIdleAction::for_pulsed(settings.pulsed);
    channel.set_idle_action(IdlePhase::EndPulse, action).await?;
    channel.set_idle_action(IdlePhase::EndSweep, action).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::{Quantity, SmuInstrument, SourceFunction};
    use crate::hardware::mock::MockSmu;

    #[test]
    fn nplc_bounds_are_enforced() {
        assert!((integration_nplc(0.02, 50.0).unwrap() - 1.0).abs() < 1e-12);
        assert!((integration_nplc(0.5, 50.0).unwrap() - 25.0).abs() < 1e-12);
        assert!(integration_nplc(0.6, 50.0).unwrap_err().is_configuration());
        assert!(integration_nplc(1e-6, 60.0).is_err());
        assert!(integration_nplc(f64::NAN, 50.0).is_err());
    }

    #[test]
    fn delay_conventions() {
        assert_eq!(MeasureDelay::from_seconds(-1.0).unwrap(), MeasureDelay::Auto);
        assert_eq!(MeasureDelay::from_seconds(0.0).unwrap(), MeasureDelay::Fixed(0.0));
        assert!(MeasureDelay::from_seconds(-0.5).is_err());
        assert!(MeasureDelay::from_seconds(f64::INFINITY).is_err());
    }

    #[tokio::test]
    async fn configures_current_source_channel() {
        let smu = MockSmu::new("sim");
        let sweep = ChannelSweep {
            channel: smu.channel("smub").unwrap(),
            function: SourceFunction::Current,
            values: vec![1e-6, 2e-6, 3e-6],
        };
        let settings = SweepSettings::new(0.02, -1.0, true).unwrap();

        configure_channel(&sweep, 1.0, &settings).await.unwrap();

        assert_eq!(smu.sweep_list("smub"), vec![1e-6, 2e-6, 3e-6]);
        assert_eq!(smu.trigger_count("smub"), 3);
        assert_eq!(smu.nplc("smub"), Some(1.0));
        assert_eq!(smu.measure_delay("smub"), Some(MeasureDelay::Auto));
        assert_eq!(smu.autorange("smub", Quantity::Voltage), Some(true));
        assert_eq!(smu.autorange("smub", Quantity::Current), None);
        assert_eq!(
            smu.idle_action("smub", IdlePhase::EndPulse),
            Some(SourceIdleAction::Idle)
        );
        assert_eq!(
            smu.idle_action("smub", IdlePhase::EndSweep),
            Some(SourceIdleAction::Idle)
        );

        let calls = smu.calls();
        let pos = |name: &str| calls.iter().position(|c| c == name).unwrap();
        assert!(pos("smub.load_sweep_list") < pos("smub.set_integration_time"));
        assert!(pos("smub.clear_buffer") < pos("smub.set_trigger_count"));
        assert!(pos("smub.set_trigger_count") < pos("smub.measure_into_buffers"));
    }

    #[tokio::test]
    async fn high_capacitance_leaves_autorange_off() {
        let smu = MockSmu::new("sim").with_high_capacitance("smua");
        let sweep = ChannelSweep {
            channel: smu.channel("smua").unwrap(),
            function: SourceFunction::Voltage,
            values: vec![0.0, 1.0],
        };
        configure_channel(&sweep, 1.0, &SweepSettings::dc(0.02))
            .await
            .unwrap();

        assert_eq!(smu.autorange("smua", Quantity::Current), None);
        assert_eq!(smu.call_count("smua.set_autorange"), 0);
        assert_eq!(
            smu.idle_action("smua", IdlePhase::EndSweep),
            Some(SourceIdleAction::Hold)
        );
    }
}
