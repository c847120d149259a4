//! Keithley 2600-series SourceMeter Driver
//!
//! Reference: Keithley Series 2600B Reference Manual, Section 7 (TSP command reference)
//!
//! Protocol Overview:
//! - Format: TSP (Lua statements), one statement per message
//! - Transport: raw socket on port 5025 (LAN) or any line-oriented link
//! - Terminator: LF (\n)
//! - Queries are `print(...)` / `printbuffer(...)` statements
//!
//! # Important Notes
//!
//! - A single message is limited in size, so long sweep lists are built up in a
//!   temporary Lua table in chunks of [`CHUNK_SIZE`] values.
//! - `printbuffer` errors on an empty buffer; the reading count is queried first.
//! - Numbers come back in `%e` notation (e.g. `1.00000e+02`).
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use transport_daq::hardware::keithley2600::{Keithley2600, TcpTspTransport};
//! use transport_daq::hardware::capabilities::SmuInstrument;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = TcpTspTransport::connect("192.168.0.44:5025").await?;
//!     let smu = Keithley2600::new("TCPIP0::192.168.0.44::INSTR", Arc::new(transport));
//!     println!("Line frequency: {} Hz", smu.line_frequency().await?);
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::hardware::capabilities::{
    Buffer, MeasureDelay, Quantity, SmuChannel, SmuInstrument, SourceFunction, SweepStatus,
};
use crate::hardware::trigger::{
    BlendMode, BlenderSlot, IdlePhase, SourceIdleAction, TriggerEvent, TriggerStage,
};

/// Maximum number of sweep values sent in one message.
pub const CHUNK_SIZE: usize = 50;

/// Default TSP raw-socket port.
pub const TSP_PORT: u16 = 5025;

/// Name of the temporary Lua table used for chunked list upload.
const LIST_TABLE: &str = "transport_daq_list";

// =============================================================================
// Transport
// =============================================================================

/// Line-oriented link to a TSP instrument.
#[async_trait]
pub trait TspTransport: Send + Sync {
    /// Send a statement that produces no output.
    async fn write(&self, statement: &str) -> Result<()>;

    /// Send a statement and return the line it prints.
    async fn query(&self, statement: &str) -> Result<String>;
}

/// TSP over a raw TCP socket.
///
/// A timed-out or closed connection is dropped and reopened on next use, so
/// a late reply can never be read as the answer to a later query.
pub struct TcpTspTransport {
    addr: String,
    stream: Mutex<Option<BufReader<TcpStream>>>,
    timeout: Duration,
}

impl TcpTspTransport {
    /// Connect to `host:port`.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = Self::open(addr).await?;
        Ok(Self {
            addr: addr.to_string(),
            stream: Mutex::new(Some(stream)),
            timeout: Duration::from_secs(5),
        })
    }

    async fn open(addr: &str) -> Result<BufReader<TcpStream>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to TSP instrument at {addr}"))?;
        Ok(BufReader::new(stream))
    }

    async fn send(
        &self,
        slot: &mut Option<BufReader<TcpStream>>,
        statement: &str,
    ) -> Result<()> {
        if slot.is_none() {
            warn!(addr = %self.addr, "Reconnecting to TSP instrument");
            *slot = Some(Self::open(&self.addr).await?);
        }
        let stream = slot
            .as_mut()
            .ok_or_else(|| anyhow!("TSP connection unavailable"))?;
        let written = stream
            .get_mut()
            .write_all(format!("{statement}\n").as_bytes())
            .await;
        if written.is_err() {
            *slot = None;
        }
        written.context("TSP write failed")
    }

    /// Override the per-query read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Translate a VISA resource string (`TCPIP0::host::INSTR`) into a socket address.
    pub fn socket_address(resource: &str) -> Result<String> {
        let mut parts = resource.split("::");
        match (parts.next(), parts.next()) {
            (Some(interface), Some(host)) if interface.to_ascii_uppercase().starts_with("TCPIP") => {
                Ok(format!("{host}:{TSP_PORT}"))
            }
            _ => Err(anyhow!("Unsupported instrument resource '{resource}'")),
        }
    }
}

#[async_trait]
impl TspTransport for TcpTspTransport {
    async fn write(&self, statement: &str) -> Result<()> {
        let mut slot = self.stream.lock().await;
        self.send(&mut slot, statement).await
    }

    async fn query(&self, statement: &str) -> Result<String> {
        let mut slot = self.stream.lock().await;
        self.send(&mut slot, statement).await?;
        let stream = slot
            .as_mut()
            .ok_or_else(|| anyhow!("TSP connection unavailable"))?;

        let mut line = String::new();
        let outcome = tokio::time::timeout(self.timeout, stream.read_line(&mut line)).await;
        let read = match outcome {
            Ok(read) => read,
            Err(_) => {
                *slot = None;
                bail!("TSP read timeout after {:?} on '{statement}'", self.timeout);
            }
        };
        match read {
            Ok(0) => {
                *slot = None;
                bail!("TSP instrument at {} closed the connection", self.addr);
            }
            Ok(_) => Ok(line.trim().to_string()),
            Err(err) => {
                *slot = None;
                Err(err).context("TSP read failed")
            }
        }
    }
}

/// Parse a single numeric reply.
pub fn parse_number(reply: &str) -> Result<f64> {
    reply
        .trim()
        .parse::<f64>()
        .with_context(|| format!("Failed to parse TSP reply as number: '{reply}'"))
}

/// Parse a comma-separated `printbuffer` reply.
pub fn parse_number_list(reply: &str) -> Result<Vec<f64>> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed.split(',').map(parse_number).collect()
}

fn format_values(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{v:e}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_event(event: &TriggerEvent) -> String {
    match event {
        TriggerEvent::GlobalTrigger => "trigger.EVENT_ID".to_string(),
        TriggerEvent::Armed(ch) => format!("{ch}.trigger.ARMED_EVENT_ID"),
        TriggerEvent::SourceComplete(ch) => format!("{ch}.trigger.SOURCE_COMPLETE_EVENT_ID"),
        TriggerEvent::MeasureComplete(ch) => format!("{ch}.trigger.MEASURE_COMPLETE_EVENT_ID"),
        TriggerEvent::PulseComplete(ch) => format!("{ch}.trigger.PULSE_COMPLETE_EVENT_ID"),
        TriggerEvent::Blender(slot) => format!("trigger.blender[{}].EVENT_ID", slot.number()),
    }
}

// =============================================================================
// Channel
// =============================================================================

/// One `smuX` channel of a 2600-series instrument.
pub struct TspChannel {
    name: String,
    transport: Arc<dyn TspTransport>,
}

impl TspChannel {
    fn new(name: &str, transport: Arc<dyn TspTransport>) -> Self {
        Self {
            name: name.to_string(),
            transport,
        }
    }

    async fn write(&self, statement: String) -> Result<()> {
        trace!(channel = %self.name, %statement, "TSP write");
        self.transport.write(&statement).await
    }

    fn buffer_name(&self, buffer: Buffer) -> String {
        match buffer {
            Buffer::Current => format!("{}.nvbuffer1", self.name),
            Buffer::Voltage => format!("{}.nvbuffer2", self.name),
        }
    }

    fn list_function(function: SourceFunction) -> &'static str {
        match function {
            SourceFunction::Current => "listi",
            SourceFunction::Voltage => "listv",
        }
    }
}

#[async_trait]
impl SmuChannel for TspChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_sweep_list(&self, function: SourceFunction, values: &[f64]) -> Result<()> {
        let setter = format!("{}.trigger.source.{}", self.name, Self::list_function(function));

        if values.len() <= CHUNK_SIZE {
            return self.write(format!("{setter}({{{}}})", format_values(values))).await;
        }

        self.write(format!("{LIST_TABLE} = {{}}")).await?;
        for chunk in values.chunks(CHUNK_SIZE) {
            self.write(format!(
                "for _, v in ipairs({{{}}}) do table.insert({LIST_TABLE}, v) end",
                format_values(chunk)
            ))
            .await?;
        }
        self.write(format!("{setter}({LIST_TABLE})")).await?;
        self.write(format!("{LIST_TABLE} = nil")).await
    }

    async fn set_source_function(&self, function: SourceFunction) -> Result<()> {
        let constant = match function {
            SourceFunction::Current => "OUTPUT_DCAMPS",
            SourceFunction::Voltage => "OUTPUT_DCVOLTS",
        };
        self.write(format!("{0}.source.func = {0}.{constant}", self.name))
            .await
    }

    async fn high_capacitance(&self) -> Result<bool> {
        let reply = self
            .transport
            .query(&format!("print({}.source.highc)", self.name))
            .await?;
        Ok(parse_number(&reply)? != 0.0)
    }

    async fn set_autorange(&self, quantity: Quantity, enabled: bool) -> Result<()> {
        let field = match quantity {
            Quantity::Current => "autorangei",
            Quantity::Voltage => "autorangev",
        };
        let state = if enabled { "AUTORANGE_ON" } else { "AUTORANGE_OFF" };
        self.write(format!("{0}.measure.{field} = {0}.{state}", self.name))
            .await
    }

    async fn set_integration_time(&self, nplc: f64) -> Result<()> {
        self.write(format!("{}.measure.nplc = {nplc}", self.name)).await
    }

    async fn set_measure_delay(&self, delay: MeasureDelay) -> Result<()> {
        match delay {
            MeasureDelay::Auto => {
                self.write(format!("{0}.measure.delay = {0}.DELAY_AUTO", self.name))
                    .await
            }
            MeasureDelay::Fixed(seconds) => {
                self.write(format!("{}.measure.delay = {seconds}", self.name))
                    .await
            }
        }
    }

    async fn set_output(&self, enabled: bool) -> Result<()> {
        let state = if enabled { "OUTPUT_ON" } else { "OUTPUT_OFF" };
        self.write(format!("{0}.source.output = {0}.{state}", self.name))
            .await
    }

    async fn set_trigger_action(&self, stage: TriggerStage, enabled: bool) -> Result<()> {
        if !matches!(stage, TriggerStage::Source | TriggerStage::Measure) {
            return Err(anyhow!("Trigger stage '{}' has no action", stage.as_str()));
        }
        let state = if enabled { "ENABLE" } else { "DISABLE" };
        self.write(format!(
            "{0}.trigger.{1}.action = {0}.{state}",
            self.name,
            stage.as_str()
        ))
        .await
    }

    async fn set_trigger_stimulus(&self, stage: TriggerStage, event: &TriggerEvent) -> Result<()> {
        self.write(format!(
            "{}.trigger.{}.stimulus = {}",
            self.name,
            stage.as_str(),
            render_event(event)
        ))
        .await
    }

    async fn set_trigger_count(&self, count: usize) -> Result<()> {
        self.write(format!("{}.trigger.count = {count}", self.name)).await
    }

    async fn set_idle_action(&self, phase: IdlePhase, action: SourceIdleAction) -> Result<()> {
        let field = match phase {
            IdlePhase::EndPulse => "endpulse",
            IdlePhase::EndSweep => "endsweep",
        };
        let constant = match action {
            SourceIdleAction::Idle => "SOURCE_IDLE",
            SourceIdleAction::Hold => "SOURCE_HOLD",
        };
        self.write(format!("{0}.trigger.{field}.action = {0}.{constant}", self.name))
            .await
    }

    async fn measure_into_buffers(&self) -> Result<()> {
        self.write(format!(
            "{0}.trigger.measure.iv({0}.nvbuffer1, {0}.nvbuffer2)",
            self.name
        ))
        .await
    }

    async fn initiate(&self) -> Result<()> {
        self.write(format!("{}.trigger.initiate()", self.name)).await
    }

    async fn clear_buffer(&self, buffer: Buffer) -> Result<()> {
        self.write(format!("{}.clear()", self.buffer_name(buffer))).await
    }

    async fn clear_buffer_cache(&self, buffer: Buffer) -> Result<()> {
        self.write(format!("{}.clearcache()", self.buffer_name(buffer)))
            .await
    }

    async fn read_buffer(&self, buffer: Buffer) -> Result<Vec<f64>> {
        let name = self.buffer_name(buffer);
        let count = parse_number(&self.transport.query(&format!("print({name}.n)")).await?)?;
        if count < 1.0 {
            return Ok(Vec::new());
        }
        let reply = self
            .transport
            .query(&format!("printbuffer(1, {name}.n, {name}.readings)"))
            .await?;
        parse_number_list(&reply)
    }
}

// =============================================================================
// Instrument
// =============================================================================

/// A 2600-series dual-channel SourceMeter.
pub struct Keithley2600 {
    address: String,
    transport: Arc<dyn TspTransport>,
    channels: Vec<Arc<TspChannel>>,
}

impl Keithley2600 {
    /// Wrap a transport; exposes channels `smua` and `smub`.
    pub fn new(address: impl Into<String>, transport: Arc<dyn TspTransport>) -> Self {
        let channels = ["smua", "smub"]
            .iter()
            .map(|name| Arc::new(TspChannel::new(name, Arc::clone(&transport))))
            .collect();
        Self {
            address: address.into(),
            transport,
            channels,
        }
    }

    /// Open a raw-socket connection for a `TCPIP0::host::INSTR` resource.
    pub async fn connect(address: &str) -> Result<Self> {
        let socket = TcpTspTransport::socket_address(address)?;
        let transport = TcpTspTransport::connect(&socket).await?;
        Ok(Self::new(address, Arc::new(transport)))
    }
}

#[async_trait]
impl SmuInstrument for Keithley2600 {
    fn address(&self) -> &str {
        &self.address
    }

    fn channel(&self, name: &str) -> Option<Arc<dyn SmuChannel>> {
        self.channels
            .iter()
            .find(|ch| ch.name == name)
            .map(|ch| Arc::clone(ch) as Arc<dyn SmuChannel>)
    }

    fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|ch| ch.name.clone()).collect()
    }

    async fn line_frequency(&self) -> Result<f64> {
        parse_number(&self.transport.query("print(localnode.linefreq)").await?)
    }

    async fn configure_blender(
        &self,
        slot: BlenderSlot,
        mode: BlendMode,
        stimuli: &[TriggerEvent],
    ) -> Result<()> {
        let n = slot.number();
        let or_enable = matches!(mode, BlendMode::Or);
        self.transport
            .write(&format!("trigger.blender[{n}].orenable = {or_enable}"))
            .await?;
        for (i, event) in stimuli.iter().enumerate() {
            self.transport
                .write(&format!(
                    "trigger.blender[{n}].stimulus[{}] = {}",
                    i + 1,
                    render_event(event)
                ))
                .await?;
        }
        Ok(())
    }

    async fn send_trigger(&self) -> Result<()> {
        self.transport.write("*trg").await
    }

    async fn sweep_status(&self) -> Result<SweepStatus> {
        let reply = self
            .transport
            .query("print(status.operation.sweeping.condition)")
            .await?;
        Ok(SweepStatus(parse_number(&reply)? as u32))
    }

    async fn reset(&self) -> Result<()> {
        self.transport.write("reset()").await
    }

    async fn beep(&self, duration: Duration, frequency_hz: f64) -> Result<()> {
        self.transport
            .write(&format!(
                "beeper.beep({}, {frequency_hz})",
                duration.as_secs_f64()
            ))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Records statements and answers queries from a script.
    #[derive(Default)]
    struct ScriptedTransport {
        written: StdMutex<Vec<String>>,
        replies: StdMutex<VecDeque<String>>,
    }

    impl ScriptedTransport {
        fn with_replies(replies: &[&str]) -> Self {
            Self {
                written: StdMutex::new(Vec::new()),
                replies: StdMutex::new(replies.iter().map(|r| r.to_string()).collect()),
            }
        }

        fn written(&self) -> Vec<String> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TspTransport for ScriptedTransport {
        async fn write(&self, statement: &str) -> Result<()> {
            self.written.lock().unwrap().push(statement.to_string());
            Ok(())
        }

        async fn query(&self, statement: &str) -> Result<String> {
            self.written.lock().unwrap().push(statement.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("no scripted reply for '{statement}'"))
        }
    }

    fn instrument(transport: Arc<ScriptedTransport>) -> Keithley2600 {
        Keithley2600::new("TCPIP0::10.0.0.1::INSTR", transport)
    }

    #[tokio::test]
    async fn short_sweep_list_is_sent_in_one_statement() {
        let transport = Arc::new(ScriptedTransport::default());
        let smu = instrument(transport.clone());
        let smua = smu.channel("smua").unwrap();

        smua.load_sweep_list(SourceFunction::Voltage, &[0.0, 0.5])
            .await
            .unwrap();

        let written = transport.written();
        assert_eq!(written.len(), 1);
        assert!(written[0].starts_with("smua.trigger.source.listv({"));
    }

    #[tokio::test]
    async fn long_sweep_list_is_chunked() {
        let transport = Arc::new(ScriptedTransport::default());
        let smu = instrument(transport.clone());
        let smub = smu.channel("smub").unwrap();
        let values: Vec<f64> = (0..120).map(|i| i as f64 * 1e-6).collect();

        smub.load_sweep_list(SourceFunction::Current, &values)
            .await
            .unwrap();

        let written = transport.written();
        let inserts = written.iter().filter(|s| s.contains("table.insert")).count();
        assert_eq!(inserts, 3);
        assert_eq!(written.first().unwrap(), "transport_daq_list = {}");
        assert_eq!(written[written.len() - 2], "smub.trigger.source.listi(transport_daq_list)");
        assert_eq!(written.last().unwrap(), "transport_daq_list = nil");
        let chunk_sizes: Vec<usize> = written
            .iter()
            .filter_map(|s| s.split_once("ipairs({"))
            .filter_map(|(_, rest)| rest.split_once("})"))
            .map(|(literal, _)| literal.split(',').count())
            .collect();
        assert_eq!(chunk_sizes, vec![CHUNK_SIZE, CHUNK_SIZE, 20]);
    }

    #[tokio::test]
    async fn trigger_statements_render_events() {
        let transport = Arc::new(ScriptedTransport::default());
        let smu = instrument(transport.clone());
        let smua = smu.channel("smua").unwrap();

        smua.set_trigger_stimulus(
            TriggerStage::Measure,
            &TriggerEvent::SourceComplete("smua".into()),
        )
        .await
        .unwrap();
        smu.configure_blender(
            BlenderSlot::new(2),
            BlendMode::And,
            &[
                TriggerEvent::MeasureComplete("smua".into()),
                TriggerEvent::MeasureComplete("smub".into()),
            ],
        )
        .await
        .unwrap();
        smua.set_idle_action(IdlePhase::EndSweep, SourceIdleAction::Hold)
            .await
            .unwrap();

        assert_eq!(
            transport.written(),
            vec![
                "smua.trigger.measure.stimulus = smua.trigger.SOURCE_COMPLETE_EVENT_ID",
                "trigger.blender[2].orenable = false",
                "trigger.blender[2].stimulus[1] = smua.trigger.MEASURE_COMPLETE_EVENT_ID",
                "trigger.blender[2].stimulus[2] = smub.trigger.MEASURE_COMPLETE_EVENT_ID",
                "smua.trigger.endsweep.action = smua.SOURCE_HOLD",
            ]
        );
    }

    #[tokio::test]
    async fn empty_buffer_skips_printbuffer() {
        let transport = Arc::new(ScriptedTransport::with_replies(&["0.00000e+00"]));
        let smu = instrument(transport.clone());
        let readings = smu
            .channel("smua")
            .unwrap()
            .read_buffer(Buffer::Current)
            .await
            .unwrap();
        assert!(readings.is_empty());
        assert_eq!(transport.written(), vec!["print(smua.nvbuffer1.n)"]);
    }

    #[tokio::test]
    async fn buffer_and_status_replies_are_parsed() {
        let transport = Arc::new(ScriptedTransport::with_replies(&[
            "3.00000e+00",
            "1.00000e-03, 2.00000e-03, 3.00000e-03",
            "6.00000e+00",
            "true",
        ]));
        let smu = instrument(transport.clone());
        let readings = smu
            .channel("smub")
            .unwrap()
            .read_buffer(Buffer::Voltage)
            .await
            .unwrap();
        assert_eq!(readings, vec![1e-3, 2e-3, 3e-3]);
        assert_eq!(smu.sweep_status().await.unwrap(), SweepStatus(6));
        assert!(smu.line_frequency().await.is_err());
    }

    #[test]
    fn socket_address_from_visa_resource() {
        assert_eq!(
            TcpTspTransport::socket_address("TCPIP0::192.168.0.44::INSTR").unwrap(),
            "192.168.0.44:5025"
        );
        assert!(TcpTspTransport::socket_address("GPIB0::26::INSTR").is_err());
    }

    #[test]
    fn unknown_channel_is_none() {
        let smu = instrument(Arc::new(ScriptedTransport::default()));
        assert!(smu.channel("smuc").is_none());
        assert_eq!(smu.channel_names(), vec!["smua", "smub"]);
    }

    #[tokio::test]
    async fn timed_out_reply_is_not_read_by_next_query() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let instrument = tokio::spawn(async move {
            let (slow, _) = listener.accept().await.unwrap();
            let (read, mut late_writer) = slow.into_split();
            let first = BufReader::new(read).lines().next_line().await.unwrap().unwrap();

            let (fresh, _) = listener.accept().await.unwrap();
            let _ = late_writer.write_all(b"1.00000e+00\n").await;
            let (read, mut write) = fresh.into_split();
            let second = BufReader::new(read).lines().next_line().await.unwrap().unwrap();
            write.write_all(b"6.00000e+01\n").await.unwrap();
            vec![first, second]
        });

        let transport = TcpTspTransport::connect(&addr)
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(50));

        let err = transport.query("print(1)").await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
        let reply = transport.query("print(localnode.linefreq)").await.unwrap();

        assert_eq!(reply, "6.00000e+01");
        assert_eq!(
            instrument.await.unwrap(),
            vec!["print(1)", "print(localnode.linefreq)"]
        );
    }
}
