//! Sweep execution under the instrument's measurement lock.
//!
//! Every sweep follows the same sequence:
//!
//! 1. abort check (an aborted sweep returns empty readings, no hardware I/O)
//! 2. request validation (configuration errors, no hardware writes)
//! 3. lease blender slots, configure channels, wire the trigger model
//! 4. outputs on, initiate, global trigger
//! 5. poll sweep status: wait for start, then wait for completion
//! 6. drain buffers, clear buffers

use std::time::Duration;
use tokio::sync::MutexGuard;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Buffer, SmuChannel};
use crate::sweep::configurator::{clear_buffers, configure_channel, integration_nplc};
use crate::sweep::sync::{wire_dual, wire_single, SLOTS_PER_SWEEP};
use crate::sweep::{
    ChannelReadings, ChannelSweep, DualSweepResult, SourceMeter, SweepSettings, SweepTiming,
};

/// Exclusive access to a [`SourceMeter`] for one or more sweeps.
///
/// Obtained from [`SourceMeter::session`]; the measurement lock is released
/// when the session is dropped.
pub struct MeasurementSession<'a> {
    meter: &'a SourceMeter,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> MeasurementSession<'a> {
    pub(crate) fn new(meter: &'a SourceMeter, guard: MutexGuard<'a, ()>) -> Self {
        Self {
            meter,
            _guard: guard,
        }
    }

    /// The meter this session measures through.
    pub fn meter(&self) -> &SourceMeter {
        self.meter
    }

    /// Source `lead.values` and `follower.values` in lockstep and measure both channels.
    ///
    /// The lead channel drives the trigger sequence; both lists must have the
    /// same non-zero length.
    pub async fn dual_sweep(
        &self,
        lead: &ChannelSweep,
        follower: &ChannelSweep,
        settings: &SweepSettings,
    ) -> AppResult<DualSweepResult> {
        if self.meter.abort_signal().is_set() {
            debug!("Abort set, skipping dual sweep");
            return Ok(DualSweepResult::default());
        }

        if lead.values.len() != follower.values.len() {
            return Err(DaqError::configuration(format!(
                "Sweep lists differ in length: {} has {} points, {} has {}",
                lead.channel_name(),
                lead.values.len(),
                follower.channel_name(),
                follower.values.len()
            )));
        }
        if lead.values.is_empty() {
            return Err(DaqError::configuration("Sweep lists are empty"));
        }
        if lead.channel_name() == follower.channel_name() {
            return Err(DaqError::configuration(format!(
                "Lead and follower are both channel '{}'",
                lead.channel_name()
            )));
        }

        let instrument = self.meter.instrument().as_ref();
        let nplc = integration_nplc(settings.integration_time_s, instrument.line_frequency().await?)?;
        let lease = self.meter.slot_pool().lease(SLOTS_PER_SWEEP)?;

        configure_channel(lead, nplc, settings).await?;
        configure_channel(follower, nplc, settings).await?;
        wire_dual(instrument, lead.channel.as_ref(), follower.channel.as_ref(), &lease).await?;

        lead.channel.set_output(true).await?;
        follower.channel.set_output(true).await?;
        lead.channel.initiate().await?;
        follower.channel.initiate().await?;
        instrument.send_trigger().await?;

        info!(
            lead = lead.channel_name(),
            follower = follower.channel_name(),
            points = lead.values.len(),
            "Dual-channel sweep started"
        );
        self.wait_for_sweep().await?;

        let result = DualSweepResult {
            lead: drain(lead.channel.as_ref()).await?,
            follower: drain(follower.channel.as_ref()).await?,
        };
        debug!(
            lead_points = result.lead.len(),
            follower_points = result.follower.len(),
            "Dual-channel sweep complete"
        );
        Ok(result)
    }

    /// Source `sweep.values` on one channel and measure it.
    pub async fn single_sweep(
        &self,
        sweep: &ChannelSweep,
        settings: &SweepSettings,
    ) -> AppResult<ChannelReadings> {
        if self.meter.abort_signal().is_set() {
            debug!("Abort set, skipping single-channel sweep");
            return Ok(ChannelReadings::default());
        }
        if sweep.values.is_empty() {
            return Err(DaqError::configuration("Sweep list is empty"));
        }

        let instrument = self.meter.instrument().as_ref();
        let nplc = integration_nplc(settings.integration_time_s, instrument.line_frequency().await?)?;
        let lease = self.meter.slot_pool().lease(SLOTS_PER_SWEEP)?;

        configure_channel(sweep, nplc, settings).await?;
        wire_single(instrument, sweep.channel.as_ref(), &lease).await?;

        sweep.channel.set_output(true).await?;
        sweep.channel.initiate().await?;
        instrument.send_trigger().await?;

        info!(
            channel = sweep.channel_name(),
            points = sweep.values.len(),
            "Single-channel sweep started"
        );
        self.wait_for_sweep().await?;
        drain(sweep.channel.as_ref()).await
    }

    /// Wait until the sweep starts, then until every channel has stopped sweeping.
    async fn wait_for_sweep(&self) -> AppResult<()> {
        let SweepTiming {
            poll_interval,
            max_wait,
        } = self.meter.timing();
        let instrument = self.meter.instrument();
        let started = Instant::now();
        let check_deadline = |limit: Option<Duration>| match limit {
            Some(limit) if started.elapsed() >= limit => Err(DaqError::SweepTimeout(limit)),
            _ => Ok(()),
        };

        while instrument.sweep_status().await?.is_idle() {
            check_deadline(max_wait)?;
            sleep(poll_interval).await;
        }
        while !instrument.sweep_status().await?.is_idle() {
            check_deadline(max_wait)?;
            sleep(poll_interval).await;
        }
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Sweep finished");
        Ok(())
    }
}

/// Read both buffers of a channel, then clear them.
async fn drain(channel: &dyn SmuChannel) -> AppResult<ChannelReadings> {
    let readings = ChannelReadings {
        current: channel.read_buffer(Buffer::Current).await?,
        voltage: channel.read_buffer(Buffer::Voltage).await?,
    };
    clear_buffers(channel).await?;
    Ok(readings)
}
