//! Mock Hardware Implementations
//!
//! Simulated instruments for tests and for `in_simulation` runs.
//!
//! # Available Mocks
//!
//! - `MockSmu` - two-channel source-measure unit with a resistive device model
//! - `MockCryostat` - temperature / field controller with scripted status codes
//!
//! # Behaviour
//!
//! - Every capability call is appended to a call log (`"smua.initiate"`,
//!   `"send_trigger"`, ...) so tests can assert ordering and absence of calls.
//! - On the global trigger, every initiated channel sources its sweep list
//!   into a resistor and appends the readings to its buffers. Buffers are
//!   only emptied by `clear_buffer`, so a missing clear shows up as stale data.
//! - The sweep-status register reports the triggered channels as sweeping for
//!   a configurable number of polls, after an optional number of "not yet
//!   started" polls.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::hardware::capabilities::{
    Buffer, ControlledQuantity, FeedbackController, MeasureDelay, Quantity, SmuChannel,
    SmuInstrument, SourceFunction, SweepStatus,
};
use crate::hardware::trigger::{
    BlendMode, BlenderSlot, IdlePhase, SourceIdleAction, TriggerEvent, TriggerStage,
};

/// Hook invoked when the simulated sweep starts.
pub type TriggerHook = Box<dyn Fn() + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockSmu - Simulated Source-Measure Unit
// =============================================================================

#[derive(Debug, Clone)]
struct ChannelSim {
    index: usize,
    resistance_ohm: f64,
    high_capacitance: bool,
    function: Option<SourceFunction>,
    list: Vec<f64>,
    list_function: Option<SourceFunction>,
    autorange: HashMap<Quantity, bool>,
    nplc: Option<f64>,
    delay: Option<MeasureDelay>,
    output: bool,
    count: usize,
    actions: HashMap<TriggerStage, bool>,
    stimuli: HashMap<TriggerStage, TriggerEvent>,
    idle_actions: HashMap<IdlePhase, SourceIdleAction>,
    routed: bool,
    initiated: bool,
    buffers: HashMap<Buffer, Vec<f64>>,
}

impl ChannelSim {
    fn new(index: usize) -> Self {
        Self {
            index,
            resistance_ohm: 1.0e3,
            high_capacitance: false,
            function: None,
            list: Vec::new(),
            list_function: None,
            autorange: HashMap::new(),
            nplc: None,
            delay: None,
            output: false,
            count: 0,
            actions: HashMap::new(),
            stimuli: HashMap::new(),
            idle_actions: HashMap::new(),
            routed: false,
            initiated: false,
            buffers: HashMap::new(),
        }
    }

    fn status_bit(&self) -> u32 {
        1 << (self.index + 1)
    }

    /// Source the list into the resistor and store the readings.
    fn run_sweep(&mut self) {
        let function = self.list_function.or(self.function);
        let steps = if self.count == 0 {
            self.list.len()
        } else {
            self.count.min(self.list.len())
        };
        let (currents, voltages): (Vec<f64>, Vec<f64>) = self.list[..steps]
            .iter()
            .map(|&value| match function {
                Some(SourceFunction::Current) => (value, value * self.resistance_ohm),
                _ => (value / self.resistance_ohm, value),
            })
            .unzip();
        if self.routed {
            self.buffers.entry(Buffer::Current).or_default().extend(currents);
            self.buffers.entry(Buffer::Voltage).or_default().extend(voltages);
        }
        self.initiated = false;
    }
}

struct SmuSim {
    calls: Vec<String>,
    channels: HashMap<String, ChannelSim>,
    line_frequency: f64,
    blenders: HashMap<BlenderSlot, (BlendMode, Vec<TriggerEvent>)>,
    startup_polls: u32,
    sweep_polls: u32,
    remaining_startup: u32,
    remaining_sweep: u32,
    status_bits: u32,
    stuck: bool,
    fail_on: Option<String>,
    resets: usize,
    beeps: Vec<(Duration, f64)>,
}

impl SmuSim {
    fn record(&mut self, call: String) -> Result<()> {
        if self.fail_on.as_deref() == Some(call.as_str()) {
            return Err(anyhow!("simulated transport failure in {call}"));
        }
        self.calls.push(call);
        Ok(())
    }

    fn channel(&mut self, name: &str) -> Result<&mut ChannelSim> {
        self.channels
            .get_mut(name)
            .ok_or_else(|| anyhow!("unknown channel '{name}'"))
    }
}

/// Simulated two-channel SMU (`smua`, `smub`).
///
/// # Example
///
/// ```rust,ignore
/// let smu = Arc::new(MockSmu::new("TCPIP0::sim::INSTR").with_resistance("smub", 2.0e3));
/// let meter = SourceMeter::new(smu.clone());
/// ```
pub struct MockSmu {
    address: String,
    sim: Arc<Mutex<SmuSim>>,
    channels: Vec<Arc<MockChannel>>,
    on_trigger: Mutex<Option<TriggerHook>>,
}

impl MockSmu {
    /// Create a simulated instrument at `address` with channels `smua` and `smub`.
    pub fn new(address: impl Into<String>) -> Self {
        let names = ["smua", "smub"];
        let sim = Arc::new(Mutex::new(SmuSim {
            calls: Vec::new(),
            channels: names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.to_string(), ChannelSim::new(i)))
                .collect(),
            line_frequency: 50.0,
            blenders: HashMap::new(),
            startup_polls: 0,
            sweep_polls: 2,
            remaining_startup: 0,
            remaining_sweep: 0,
            status_bits: 0,
            stuck: false,
            fail_on: None,
            resets: 0,
            beeps: Vec::new(),
        }));
        let channels = names
            .iter()
            .map(|n| {
                Arc::new(MockChannel {
                    name: n.to_string(),
                    sim: Arc::clone(&sim),
                })
            })
            .collect();
        Self {
            address: address.into(),
            sim,
            channels,
            on_trigger: Mutex::new(None),
        }
    }

    /// Device resistance seen by a channel.
    pub fn with_resistance(self, channel: &str, ohms: f64) -> Self {
        if let Some(ch) = lock(&self.sim).channels.get_mut(channel) {
            ch.resistance_ohm = ohms;
        }
        self
    }

    /// Mains frequency reported by the instrument.
    pub fn with_line_frequency(self, hz: f64) -> Self {
        lock(&self.sim).line_frequency = hz;
        self
    }

    /// Polls reporting "not sweeping yet" after the trigger, then polls reporting "sweeping".
    pub fn with_sweep_timing(self, startup_polls: u32, sweep_polls: u32) -> Self {
        {
            let mut sim = lock(&self.sim);
            sim.startup_polls = startup_polls;
            sim.sweep_polls = sweep_polls.max(1);
        }
        self
    }

    /// Keep reporting the sweep as running forever.
    pub fn stuck_sweeping(self) -> Self {
        lock(&self.sim).stuck = true;
        self
    }

    /// Put a channel in high-capacitance mode.
    pub fn with_high_capacitance(self, channel: &str) -> Self {
        if let Some(ch) = lock(&self.sim).channels.get_mut(channel) {
            ch.high_capacitance = true;
        }
        self
    }

    /// Make the named call (e.g. `"smub.initiate"`) fail with a transport error.
    pub fn fail_on(&self, call: impl Into<String>) {
        lock(&self.sim).fail_on = Some(call.into());
    }

    /// Run `hook` whenever the global trigger is sent.
    pub fn on_trigger(&self, hook: TriggerHook) {
        *lock(&self.on_trigger) = Some(hook);
    }

    /// Every call recorded so far.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.sim).calls.clone()
    }

    /// Number of recorded calls with the given name.
    pub fn call_count(&self, call: &str) -> usize {
        lock(&self.sim).calls.iter().filter(|c| *c == call).count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.sim).calls.clear();
    }

    /// Number of instrument resets.
    pub fn resets(&self) -> usize {
        lock(&self.sim).resets
    }

    /// Beeps emitted so far.
    pub fn beeps(&self) -> Vec<(Duration, f64)> {
        lock(&self.sim).beeps.clone()
    }

    /// Current configuration of a blender slot.
    pub fn blender(&self, slot: u8) -> Option<(BlendMode, Vec<TriggerEvent>)> {
        lock(&self.sim).blenders.get(&BlenderSlot::new(slot)).cloned()
    }

    /// Stimulus programmed for a channel's trigger stage.
    pub fn stimulus(&self, channel: &str, stage: TriggerStage) -> Option<TriggerEvent> {
        lock(&self.sim)
            .channels
            .get(channel)
            .and_then(|c| c.stimuli.get(&stage).cloned())
    }

    /// Idle action programmed for a channel.
    pub fn idle_action(&self, channel: &str, phase: IdlePhase) -> Option<SourceIdleAction> {
        lock(&self.sim)
            .channels
            .get(channel)
            .and_then(|c| c.idle_actions.get(&phase).copied())
    }

    /// Autorange state of a channel's measured quantity.
    pub fn autorange(&self, channel: &str, quantity: Quantity) -> Option<bool> {
        lock(&self.sim)
            .channels
            .get(channel)
            .and_then(|c| c.autorange.get(&quantity).copied())
    }

    /// Integration time (NPLC) last set on a channel.
    pub fn nplc(&self, channel: &str) -> Option<f64> {
        lock(&self.sim).channels.get(channel).and_then(|c| c.nplc)
    }

    /// Measurement delay last set on a channel.
    pub fn measure_delay(&self, channel: &str) -> Option<MeasureDelay> {
        lock(&self.sim).channels.get(channel).and_then(|c| c.delay)
    }

    /// Sweep list currently loaded on a channel.
    pub fn sweep_list(&self, channel: &str) -> Vec<f64> {
        lock(&self.sim)
            .channels
            .get(channel)
            .map(|c| c.list.clone())
            .unwrap_or_default()
    }

    /// Trigger count currently set on a channel.
    pub fn trigger_count(&self, channel: &str) -> usize {
        lock(&self.sim).channels.get(channel).map(|c| c.count).unwrap_or(0)
    }

    /// Whether a channel's output is on.
    pub fn output_enabled(&self, channel: &str) -> bool {
        lock(&self.sim).channels.get(channel).is_some_and(|c| c.output)
    }

    /// Number of readings currently held in a channel buffer.
    pub fn buffered(&self, channel: &str, buffer: Buffer) -> usize {
        lock(&self.sim)
            .channels
            .get(channel)
            .and_then(|c| c.buffers.get(&buffer))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl SmuInstrument for MockSmu {
    fn address(&self) -> &str {
        &self.address
    }

    fn channel(&self, name: &str) -> Option<Arc<dyn SmuChannel>> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .map(|c| Arc::clone(c) as Arc<dyn SmuChannel>)
    }

    fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    async fn line_frequency(&self) -> Result<f64> {
        let mut sim = lock(&self.sim);
        sim.record("line_frequency".into())?;
        Ok(sim.line_frequency)
    }

    async fn configure_blender(
        &self,
        slot: BlenderSlot,
        mode: BlendMode,
        stimuli: &[TriggerEvent],
    ) -> Result<()> {
        let mut sim = lock(&self.sim);
        sim.record(format!("configure_blender[{}]", slot.number()))?;
        sim.blenders.insert(slot, (mode, stimuli.to_vec()));
        Ok(())
    }

    async fn send_trigger(&self) -> Result<()> {
        {
            let mut sim = lock(&self.sim);
            sim.record("send_trigger".into())?;
            let mut bits = 0;
            for channel in sim.channels.values_mut().filter(|c| c.initiated) {
                channel.run_sweep();
                bits |= channel.status_bit();
            }
            sim.status_bits = bits;
            sim.remaining_startup = sim.startup_polls;
            sim.remaining_sweep = sim.sweep_polls;
            debug!(status = bits, "MockSmu: sweep triggered");
        }
        if let Some(hook) = lock(&self.on_trigger).as_ref() {
            hook();
        }
        Ok(())
    }

    async fn sweep_status(&self) -> Result<SweepStatus> {
        let mut sim = lock(&self.sim);
        sim.record("sweep_status".into())?;
        if sim.remaining_startup > 0 {
            sim.remaining_startup -= 1;
            return Ok(SweepStatus(0));
        }
        if sim.stuck {
            return Ok(SweepStatus(sim.status_bits.max(2)));
        }
        if sim.remaining_sweep > 0 {
            sim.remaining_sweep -= 1;
            return Ok(SweepStatus(sim.status_bits));
        }
        Ok(SweepStatus(0))
    }

    async fn reset(&self) -> Result<()> {
        let mut sim = lock(&self.sim);
        sim.record("reset".into())?;
        sim.resets += 1;
        for channel in sim.channels.values_mut() {
            channel.output = false;
            channel.initiated = false;
        }
        Ok(())
    }

    async fn beep(&self, duration: Duration, frequency_hz: f64) -> Result<()> {
        let mut sim = lock(&self.sim);
        sim.record("beep".into())?;
        sim.beeps.push((duration, frequency_hz));
        Ok(())
    }
}

/// Channel of a [`MockSmu`].
pub struct MockChannel {
    name: String,
    sim: Arc<Mutex<SmuSim>>,
}

impl MockChannel {
    fn update<F>(&self, op: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ChannelSim),
    {
        let mut sim = lock(&self.sim);
        sim.record(format!("{}.{op}", self.name))?;
        apply(sim.channel(&self.name)?);
        Ok(())
    }
}

#[async_trait]
impl SmuChannel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_sweep_list(&self, function: SourceFunction, values: &[f64]) -> Result<()> {
        self.update("load_sweep_list", |c| {
            c.list = values.to_vec();
            c.list_function = Some(function);
        })
    }

    async fn set_source_function(&self, function: SourceFunction) -> Result<()> {
        self.update("set_source_function", |c| c.function = Some(function))
    }

    async fn high_capacitance(&self) -> Result<bool> {
        let mut sim = lock(&self.sim);
        sim.record(format!("{}.high_capacitance", self.name))?;
        Ok(sim.channel(&self.name)?.high_capacitance)
    }

    async fn set_autorange(&self, quantity: Quantity, enabled: bool) -> Result<()> {
        self.update("set_autorange", |c| {
            c.autorange.insert(quantity, enabled);
        })
    }

    async fn set_integration_time(&self, nplc: f64) -> Result<()> {
        self.update("set_integration_time", |c| c.nplc = Some(nplc))
    }

    async fn set_measure_delay(&self, delay: MeasureDelay) -> Result<()> {
        self.update("set_measure_delay", |c| c.delay = Some(delay))
    }

    async fn set_output(&self, enabled: bool) -> Result<()> {
        self.update("set_output", |c| c.output = enabled)
    }

    async fn set_trigger_action(&self, stage: TriggerStage, enabled: bool) -> Result<()> {
        self.update("set_trigger_action", |c| {
            c.actions.insert(stage, enabled);
        })
    }

    async fn set_trigger_stimulus(&self, stage: TriggerStage, event: &TriggerEvent) -> Result<()> {
        self.update("set_trigger_stimulus", |c| {
            c.stimuli.insert(stage, event.clone());
        })
    }

    async fn set_trigger_count(&self, count: usize) -> Result<()> {
        self.update("set_trigger_count", |c| c.count = count)
    }

    async fn set_idle_action(&self, phase: IdlePhase, action: SourceIdleAction) -> Result<()> {
        self.update("set_idle_action", |c| {
            c.idle_actions.insert(phase, action);
        })
    }

    async fn measure_into_buffers(&self) -> Result<()> {
        self.update("measure_into_buffers", |c| c.routed = true)
    }

    async fn initiate(&self) -> Result<()> {
        self.update("initiate", |c| c.initiated = true)
    }

    async fn clear_buffer(&self, buffer: Buffer) -> Result<()> {
        self.update("clear_buffer", |c| {
            c.buffers.remove(&buffer);
        })
    }

    async fn clear_buffer_cache(&self, _buffer: Buffer) -> Result<()> {
        self.update("clear_buffer_cache", |_| {})
    }

    async fn read_buffer(&self, buffer: Buffer) -> Result<Vec<f64>> {
        let mut sim = lock(&self.sim);
        sim.record(format!("{}.read_buffer", self.name))?;
        Ok(sim
            .channel(&self.name)?
            .buffers
            .get(&buffer)
            .cloned()
            .unwrap_or_default())
    }
}

// =============================================================================
// MockCryostat - Simulated Temperature / Field Controller
// =============================================================================

struct CryostatSim {
    values: HashMap<ControlledQuantity, f64>,
    statuses: HashMap<ControlledQuantity, VecDeque<i64>>,
    last_status: HashMap<ControlledQuantity, i64>,
    status_reads: HashMap<ControlledQuantity, usize>,
    setpoints: Vec<(ControlledQuantity, f64)>,
}

/// Simulated cryostat with temperature and magnetic-field loops.
///
/// Status codes are served from a per-quantity script; once the script is
/// exhausted the last code repeats. Writing a setpoint moves the reported
/// value straight to the setpoint.
pub struct MockCryostat {
    sim: Mutex<CryostatSim>,
}

impl MockCryostat {
    /// 300 K, 0 T, both loops reporting a settled status (150).
    pub fn new() -> Self {
        let quantities = [ControlledQuantity::Temperature, ControlledQuantity::MagneticField];
        Self {
            sim: Mutex::new(CryostatSim {
                values: HashMap::from([
                    (ControlledQuantity::Temperature, 300.0),
                    (ControlledQuantity::MagneticField, 0.0),
                ]),
                statuses: HashMap::new(),
                last_status: quantities.iter().map(|q| (*q, 150)).collect(),
                status_reads: HashMap::new(),
                setpoints: Vec::new(),
            }),
        }
    }

    /// Serve these status codes, in order, for a quantity.
    pub fn with_status_sequence(self, quantity: ControlledQuantity, codes: &[i64]) -> Self {
        lock(&self.sim)
            .statuses
            .insert(quantity, codes.iter().copied().collect());
        self
    }

    /// Setpoints written so far.
    pub fn setpoint_writes(&self) -> Vec<(ControlledQuantity, f64)> {
        lock(&self.sim).setpoints.clone()
    }

    /// Number of status reads for a quantity.
    pub fn status_reads(&self, quantity: ControlledQuantity) -> usize {
        lock(&self.sim)
            .status_reads
            .get(&quantity)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MockCryostat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedbackController for MockCryostat {
    async fn read_value(&self, quantity: ControlledQuantity) -> Result<f64> {
        Ok(lock(&self.sim).values.get(&quantity).copied().unwrap_or(0.0))
    }

    async fn read_status(&self, quantity: ControlledQuantity) -> Result<i64> {
        let mut sim = lock(&self.sim);
        *sim.status_reads.entry(quantity).or_insert(0) += 1;
        let next = sim.statuses.get_mut(&quantity).and_then(VecDeque::pop_front);
        if let Some(code) = next {
            sim.last_status.insert(quantity, code);
        }
        Ok(sim.last_status.get(&quantity).copied().unwrap_or(0))
    }

    async fn write_setpoint(&self, quantity: ControlledQuantity, value: f64) -> Result<()> {
        let mut sim = lock(&self.sim);
        debug!(%quantity, value, "MockCryostat: setpoint written");
        sim.setpoints.push((quantity, value));
        sim.values.insert(quantity, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn triggered_channels_fill_buffers_from_resistor_model() {
        let smu = MockSmu::new("sim").with_resistance("smua", 100.0);
        let smua = smu.channel("smua").unwrap();
        smua.load_sweep_list(SourceFunction::Current, &[1e-3, 2e-3])
            .await
            .unwrap();
        smua.measure_into_buffers().await.unwrap();
        smua.initiate().await.unwrap();
        smu.send_trigger().await.unwrap();

        let current = smua.read_buffer(Buffer::Current).await.unwrap();
        let voltage = smua.read_buffer(Buffer::Voltage).await.unwrap();
        assert_eq!(current, vec![1e-3, 2e-3]);
        assert!((voltage[1] - 0.2).abs() < 1e-12);
        assert_eq!(smu.buffered("smub", Buffer::Current), 0);
    }

    #[tokio::test]
    async fn sweep_status_follows_configured_timing() {
        let smu = MockSmu::new("sim").with_sweep_timing(1, 2);
        let smub = smu.channel("smub").unwrap();
        smub.initiate().await.unwrap();
        smu.send_trigger().await.unwrap();

        let mut codes = Vec::new();
        for _ in 0..4 {
            codes.push(smu.sweep_status().await.unwrap().0);
        }
        assert_eq!(codes, vec![0, 4, 4, 0]);
    }

    #[tokio::test]
    async fn fail_on_injects_transport_error() {
        let smu = MockSmu::new("sim");
        smu.fail_on("smua.initiate");
        let err = smu.channel("smua").unwrap().initiate().await.unwrap_err();
        assert!(err.to_string().contains("smua.initiate"));
    }

    #[tokio::test]
    async fn cryostat_repeats_last_scripted_status() {
        let cryo =
            MockCryostat::new().with_status_sequence(ControlledQuantity::Temperature, &[10, 120]);
        let q = ControlledQuantity::Temperature;
        assert_eq!(cryo.read_status(q).await.unwrap(), 10);
        assert_eq!(cryo.read_status(q).await.unwrap(), 120);
        assert_eq!(cryo.read_status(q).await.unwrap(), 120);
        assert_eq!(cryo.status_reads(q), 3);

        cryo.write_setpoint(q, 4.2).await.unwrap();
        assert_eq!(cryo.read_value(q).await.unwrap(), 4.2);
    }
}
