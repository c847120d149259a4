//! Trigger-model vocabulary shared by the capability traits and the sweep engine.
//!
//! The source-measure instrument exposes a per-channel trigger model
//! (arm → source → measure → end-pulse) whose stages are driven by events.
//! Events come from channels, from the instrument-global trigger, or from
//! event blenders that combine several events into one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stage of a channel's trigger model that accepts a stimulus event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerStage {
    /// Arm layer; fires once per sweep.
    Arm,
    /// Source step; applies the next sweep-list value.
    Source,
    /// Measurement step.
    Measure,
    /// End of the current pulse; gates the next source step.
    EndPulse,
}

impl TriggerStage {
    /// Lower-case stage name as used in the instrument's trigger model.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStage::Arm => "arm",
            TriggerStage::Source => "source",
            TriggerStage::Measure => "measure",
            TriggerStage::EndPulse => "endpulse",
        }
    }
}

/// Event that can be used as the stimulus of a trigger stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerEvent {
    /// Instrument-global trigger (the "start" event).
    GlobalTrigger,
    /// The named channel's trigger layer was armed.
    Armed(String),
    /// The named channel finished a source step.
    SourceComplete(String),
    /// The named channel finished a measurement.
    MeasureComplete(String),
    /// The named channel finished a pulse.
    PulseComplete(String),
    /// Output of an event blender.
    Blender(BlenderSlot),
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerEvent::GlobalTrigger => write!(f, "global"),
            TriggerEvent::Armed(ch) => write!(f, "{ch}.armed"),
            TriggerEvent::SourceComplete(ch) => write!(f, "{ch}.source_complete"),
            TriggerEvent::MeasureComplete(ch) => write!(f, "{ch}.measure_complete"),
            TriggerEvent::PulseComplete(ch) => write!(f, "{ch}.pulse_complete"),
            TriggerEvent::Blender(slot) => write!(f, "blender[{}]", slot.number()),
        }
    }
}

/// How a blender combines its stimuli.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlendMode {
    /// Fires when any stimulus fires.
    Or,
    /// Fires once every stimulus has fired.
    And,
}

/// One of the instrument's global event-blender slots (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlenderSlot(u8);

impl BlenderSlot {
    /// Wrap a 1-based slot number.
    pub fn new(number: u8) -> Self {
        Self(number)
    }

    /// 1-based slot number.
    pub fn number(&self) -> u8 {
        self.0
    }
}

/// What the source does once a pulse or the whole sweep ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceIdleAction {
    /// Return the source to its idle level between points.
    Idle,
    /// Hold the output at the last sourced value.
    Hold,
}

impl SourceIdleAction {
    /// Pulsed sweeps idle between points, DC sweeps hold.
    pub fn for_pulsed(pulsed: bool) -> Self {
        if pulsed {
            SourceIdleAction::Idle
        } else {
            SourceIdleAction::Hold
        }
    }
}

/// End-of-pulse or end-of-sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdlePhase {
    /// After every sweep point.
    EndPulse,
    /// After the last sweep point.
    EndSweep,
}
