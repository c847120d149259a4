//! Hardware Capabilities for Transport Measurements
//!
//! The sweep engine and the stabilization loop never talk to a concrete
//! instrument. They consume three small capability traits:
//!
//! - [`SmuChannel`]: one source-measure channel (sweep list, source mode,
//!   ranges, trigger-model fields, buffers, output)
//! - [`SmuInstrument`]: the instrument-global surface (named channels, event
//!   blenders, global trigger, sweep status, reset, beeper)
//! - [`FeedbackController`]: a temperature / magnetic-field controller
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//!
//! Implementations live in [`crate::hardware::keithley2600`] (TSP command
//! layer) and [`crate::hardware::mock`] (simulation).

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::hardware::trigger::{
    BlendMode, BlenderSlot, IdlePhase, SourceIdleAction, TriggerEvent, TriggerStage,
};

// =============================================================================
// Channel vocabulary
// =============================================================================

/// Quantity a channel sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceFunction {
    /// Source DC current, measure voltage.
    Current,
    /// Source DC voltage, measure current.
    Voltage,
}

impl SourceFunction {
    /// The quantity measured while sourcing this function.
    pub fn measured(&self) -> Quantity {
        match self {
            SourceFunction::Current => Quantity::Voltage,
            SourceFunction::Voltage => Quantity::Current,
        }
    }
}

/// Electrical quantity (used for autorange selection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantity {
    /// Current in amperes.
    Current,
    /// Voltage in volts.
    Voltage,
}

/// Reading buffer of a channel.
///
/// Measurements store current in the primary buffer and voltage in the
/// secondary buffer, independent of the source function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Buffer {
    /// Primary buffer (nvbuffer1).
    Current,
    /// Secondary buffer (nvbuffer2).
    Voltage,
}

impl Buffer {
    /// Both buffers in primary, secondary order.
    pub const ALL: [Buffer; 2] = [Buffer::Current, Buffer::Voltage];
}

/// Settling delay before each measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MeasureDelay {
    /// Start measuring once the reading is stable.
    Auto,
    /// Fixed wait in seconds.
    Fixed(f64),
}

impl fmt::Display for MeasureDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasureDelay::Auto => write!(f, "auto"),
            MeasureDelay::Fixed(s) => write!(f, "{s} s"),
        }
    }
}

/// Bitmask of channels currently sweeping (0 = none).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SweepStatus(pub u32);

impl SweepStatus {
    /// No channel is sweeping.
    pub fn is_idle(&self) -> bool {
        self.0 == 0
    }
}

// =============================================================================
// SmuChannel
// =============================================================================

/// Capability: one source-measure channel.
///
/// # Contract
/// - Methods only write/read trigger-model state; nothing starts a sweep
///   except [`SmuChannel::initiate`] followed by the instrument's global trigger.
/// - Buffers keep their contents until explicitly cleared.
#[async_trait]
pub trait SmuChannel: Send + Sync {
    /// Channel name as known by the instrument (e.g. `"smua"`).
    fn name(&self) -> &str;

    /// Load the per-step source values. Transport-level chunking is the
    /// implementation's concern.
    async fn load_sweep_list(&self, function: SourceFunction, values: &[f64]) -> Result<()>;

    /// Select the sourced quantity.
    async fn set_source_function(&self, function: SourceFunction) -> Result<()>;

    /// Whether the channel is in high-capacitance source mode.
    async fn high_capacitance(&self) -> Result<bool>;

    /// Enable or disable autoranging for a measured quantity.
    async fn set_autorange(&self, quantity: Quantity, enabled: bool) -> Result<()>;

    /// Integration time in power-line cycles.
    async fn set_integration_time(&self, nplc: f64) -> Result<()>;

    /// Settling delay before each measurement.
    async fn set_measure_delay(&self, delay: MeasureDelay) -> Result<()>;

    /// Switch the output relay.
    async fn set_output(&self, enabled: bool) -> Result<()>;

    /// Enable or disable the action of the source or measure stage.
    async fn set_trigger_action(&self, stage: TriggerStage, enabled: bool) -> Result<()>;

    /// Set the stimulus event of a trigger stage.
    async fn set_trigger_stimulus(&self, stage: TriggerStage, event: &TriggerEvent) -> Result<()>;

    /// Number of source/measure steps per sweep.
    async fn set_trigger_count(&self, count: usize) -> Result<()>;

    /// Source behaviour at the end of each pulse or of the sweep.
    async fn set_idle_action(&self, phase: IdlePhase, action: SourceIdleAction) -> Result<()>;

    /// Route measurements into the current and voltage buffers.
    async fn measure_into_buffers(&self) -> Result<()>;

    /// Arm the channel's trigger model so it waits for its arm stimulus.
    async fn initiate(&self) -> Result<()>;

    /// Discard all readings in a buffer.
    async fn clear_buffer(&self, buffer: Buffer) -> Result<()>;

    /// Discard the reading cache of a buffer.
    async fn clear_buffer_cache(&self, buffer: Buffer) -> Result<()>;

    /// Read every value currently held in a buffer.
    async fn read_buffer(&self, buffer: Buffer) -> Result<Vec<f64>>;
}

// =============================================================================
// SmuInstrument
// =============================================================================

/// Capability: instrument-global surface of a multi-channel SMU.
#[async_trait]
pub trait SmuInstrument: Send + Sync {
    /// Connection address; the instrument's identity.
    fn address(&self) -> &str;

    /// Look up a channel by name.
    fn channel(&self, name: &str) -> Option<Arc<dyn SmuChannel>>;

    /// Names of all channels in instrument order.
    fn channel_names(&self) -> Vec<String>;

    /// Number of global event-blender slots.
    fn blender_count(&self) -> u8 {
        6
    }

    /// Mains frequency in Hz, used to convert integration times.
    async fn line_frequency(&self) -> Result<f64>;

    /// Program a blender slot with a combine mode and its stimuli.
    async fn configure_blender(
        &self,
        slot: BlenderSlot,
        mode: BlendMode,
        stimuli: &[TriggerEvent],
    ) -> Result<()>;

    /// Emit the instrument-global trigger event.
    async fn send_trigger(&self) -> Result<()>;

    /// Which channels are currently sweeping.
    async fn sweep_status(&self) -> Result<SweepStatus>;

    /// Return every channel to a safe idle state.
    async fn reset(&self) -> Result<()>;

    /// Audible cue.
    async fn beep(&self, duration: Duration, frequency_hz: f64) -> Result<()>;
}

// =============================================================================
// FeedbackController
// =============================================================================

/// Physical quantity regulated by a feedback controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlledQuantity {
    /// Sample temperature (K).
    Temperature,
    /// Magnetic field (T).
    MagneticField,
}

impl fmt::Display for ControlledQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlledQuantity::Temperature => write!(f, "temperature"),
            ControlledQuantity::MagneticField => write!(f, "magnetic field"),
        }
    }
}

/// Capability: temperature / field controller.
///
/// # Contract
/// - `read_status` returns the controller's raw status code; interpretation
///   belongs to the stabilization loop.
#[async_trait]
pub trait FeedbackController: Send + Sync {
    /// Current value of a quantity.
    async fn read_value(&self, quantity: ControlledQuantity) -> Result<f64>;

    /// Raw status code of a quantity's control loop.
    async fn read_status(&self, quantity: ControlledQuantity) -> Result<i64>;

    /// Write a new target for a quantity.
    async fn write_setpoint(&self, quantity: ControlledQuantity, value: f64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measured_quantity_is_the_complement_of_the_source() {
        assert_eq!(SourceFunction::Current.measured(), Quantity::Voltage);
        assert_eq!(SourceFunction::Voltage.measured(), Quantity::Current);
    }

    #[test]
    fn sweep_status_idle_only_when_zero() {
        assert!(SweepStatus(0).is_idle());
        assert!(!SweepStatus(2).is_idle());
    }
}
