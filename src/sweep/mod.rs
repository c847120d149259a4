//! Trigger-synchronized sweep engine.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ CurveRecorder      outer bias list × there-and-back axis     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ MeasurementSession dual_sweep / single_sweep (holds lock)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ configurator       one channel: list, NPLC, delay, ranges    │
//! │ sync               blender wiring, leased blender slots      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ SmuInstrument / SmuChannel capabilities                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`SourceMeter`] wraps one physical instrument. It owns the measurement
//! lock, the blender-slot pool and the abort signal shared by everything
//! that measures through it.

pub mod axis;
pub mod configurator;
pub mod executor;
pub mod recorder;
pub mod sync;

pub use axis::{AxisSpec, SweepAxis, SweepDirection};
pub use executor::MeasurementSession;
pub use recorder::{
    run_iv_sweep, run_transfer_sweep, ChannelRoles, CurveKind, CurvePoint, CurveRecorder,
    CurveShape, CurveTable, DrainBias,
};
pub use sync::{SlotLease, SlotPool};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::abort::AbortSignal;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{MeasureDelay, SmuChannel, SmuInstrument, SourceFunction};

// =============================================================================
// Request / result types
// =============================================================================

/// Polling behaviour while a sweep runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepTiming {
    /// Interval between sweep-status polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Give up after this long. `None` waits indefinitely.
    #[serde(default, with = "humantime_serde")]
    pub max_wait: Option<Duration>,
}

impl Default for SweepTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_wait: None,
        }
    }
}

/// Per-sweep measurement settings shared by both channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSettings {
    /// Integration time per point in seconds.
    pub integration_time_s: f64,
    /// Settling delay before each measurement.
    pub delay: MeasureDelay,
    /// Return to idle between points instead of holding.
    pub pulsed: bool,
}

impl SweepSettings {
    /// Build settings from the raw `delay` convention (`-1` = auto-settle).
    pub fn new(integration_time_s: f64, delay_s: f64, pulsed: bool) -> AppResult<Self> {
        Ok(Self {
            integration_time_s,
            delay: MeasureDelay::from_seconds(delay_s)?,
            pulsed,
        })
    }

    /// DC sweep with auto-settle delay.
    pub fn dc(integration_time_s: f64) -> Self {
        Self {
            integration_time_s,
            delay: MeasureDelay::Auto,
            pulsed: false,
        }
    }
}

/// One channel's part of a sweep.
#[derive(Clone)]
pub struct ChannelSweep {
    /// Channel to program.
    pub channel: Arc<dyn SmuChannel>,
    /// Quantity sourced from `values`.
    pub function: SourceFunction,
    /// One source value per trigger step.
    pub values: Vec<f64>,
}

impl ChannelSweep {
    /// Name of the underlying channel.
    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }
}

impl std::fmt::Debug for ChannelSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSweep")
            .field("channel", &self.channel.name())
            .field("function", &self.function)
            .field("points", &self.values.len())
            .finish()
    }
}

/// Readings drained from one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelReadings {
    /// Measured voltages (secondary buffer).
    pub voltage: Vec<f64>,
    /// Measured currents (primary buffer).
    pub current: Vec<f64>,
}

impl ChannelReadings {
    /// Number of points (the shorter buffer when they disagree).
    pub fn len(&self) -> usize {
        self.voltage.len().min(self.current.len())
    }

    /// True when nothing was measured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a dual-channel sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DualSweepResult {
    /// Readings of the lead channel (drives the trigger sequence).
    pub lead: ChannelReadings,
    /// Readings of the follower channel.
    pub follower: ChannelReadings,
}

impl DualSweepResult {
    /// True when the sweep did not run (aborted before start).
    pub fn is_empty(&self) -> bool {
        self.lead.is_empty() && self.follower.is_empty()
    }
}

// =============================================================================
// SourceMeter
// =============================================================================

/// Shared handle to one physical source-measure instrument.
pub struct SourceMeter {
    instrument: Arc<dyn SmuInstrument>,
    measurement_lock: Mutex<()>,
    slots: SlotPool,
    abort: AbortSignal,
    timing: SweepTiming,
}

impl SourceMeter {
    /// Wrap an instrument with a fresh abort signal and default timing.
    pub fn new(instrument: Arc<dyn SmuInstrument>) -> Self {
        let slots = SlotPool::new(instrument.blender_count());
        Self {
            instrument,
            measurement_lock: Mutex::new(()),
            slots,
            abort: AbortSignal::new(),
            timing: SweepTiming::default(),
        }
    }

    /// Share an externally owned abort signal.
    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Override sweep polling behaviour.
    pub fn with_timing(mut self, timing: SweepTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Connection address of the instrument.
    pub fn address(&self) -> &str {
        self.instrument.address()
    }

    /// Underlying instrument.
    pub fn instrument(&self) -> &Arc<dyn SmuInstrument> {
        &self.instrument
    }

    /// Abort signal polled by every sweep on this instrument.
    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Current polling behaviour.
    pub fn timing(&self) -> SweepTiming {
        self.timing
    }

    /// Blender-slot pool of this instrument.
    pub fn slot_pool(&self) -> &SlotPool {
        &self.slots
    }

    /// Look up a channel by name.
    pub fn channel(&self, name: &str) -> AppResult<Arc<dyn SmuChannel>> {
        self.instrument.channel(name).ok_or_else(|| {
            DaqError::configuration(format!(
                "Instrument {} has no channel '{}' (available: {})",
                self.address(),
                name,
                self.instrument.channel_names().join(", ")
            ))
        })
    }

    /// Build a [`ChannelSweep`] for a named channel.
    pub fn channel_sweep(
        &self,
        name: &str,
        function: SourceFunction,
        values: Vec<f64>,
    ) -> AppResult<ChannelSweep> {
        Ok(ChannelSweep {
            channel: self.channel(name)?,
            function,
            values,
        })
    }

    /// Acquire the measurement lock. Held until the session is dropped.
    pub async fn session(&self) -> MeasurementSession<'_> {
        MeasurementSession::new(self, self.measurement_lock.lock().await)
    }

    /// Run one dual-channel sweep under the measurement lock.
    pub async fn run_dual_sweep(
        &self,
        lead: &ChannelSweep,
        follower: &ChannelSweep,
        settings: &SweepSettings,
    ) -> AppResult<DualSweepResult> {
        self.session().await.dual_sweep(lead, follower, settings).await
    }

    /// Run one single-channel sweep under the measurement lock.
    pub async fn run_single_sweep(
        &self,
        sweep: &ChannelSweep,
        settings: &SweepSettings,
    ) -> AppResult<ChannelReadings> {
        self.session().await.single_sweep(sweep, settings).await
    }
}

impl std::fmt::Debug for SourceMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceMeter")
            .field("address", &self.address())
            .field("timing", &self.timing)
            .field("abort", &self.abort)
            .finish()
    }
}
