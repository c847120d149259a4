//! SECoP Cryostat Client
//!
//! Reference: SECoP 1.0 (Sample Environment Communication Protocol)
//!
//! Protocol Overview:
//! - Transport: TCP, one message per line, LF terminator
//! - Read:   `read tt:value`          -> `reply tt:value [301.2,{"t":...}]`
//! - Change: `change tt:target 4.2`   -> `changed tt:target [4.2,{...}]`
//! - Error:  `error_read tt:value ["NoSuchModule","...",{}]`
//! - Data reports are JSON arrays `[value, qualifiers]`; `status` values are
//!   themselves `[code, text]`.
//!
//! # Important Notes
//!
//! - The connection is opened on first use, not on construction.
//! - Asynchronous `update` messages are skipped while waiting for a reply.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::hardware::capabilities::{ControlledQuantity, FeedbackController};

/// SECoP module names serving each controlled quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecopModules {
    /// Temperature module (`tt` on most nodes).
    pub temperature: String,
    /// Magnet module (`mf` on most nodes).
    pub magnetic_field: String,
}

impl Default for SecopModules {
    fn default() -> Self {
        Self {
            temperature: "tt".into(),
            magnetic_field: "mf".into(),
        }
    }
}

impl SecopModules {
    fn module(&self, quantity: ControlledQuantity) -> &str {
        match quantity {
            ControlledQuantity::Temperature => &self.temperature,
            ControlledQuantity::MagneticField => &self.magnetic_field,
        }
    }
}

/// Extract the data value from a reply line.
///
/// `action` is the expected reply keyword (`reply`, `changed`) and
/// `specifier` the `module:parameter` the request addressed.
pub fn parse_reply(line: &str, action: &str, specifier: &str) -> Result<Value> {
    let mut parts = line.trim().splitn(3, ' ');
    let keyword = parts.next().unwrap_or_default();
    let spec = parts.next().unwrap_or_default();
    let payload = parts.next().unwrap_or("null");

    if keyword.starts_with("error_") {
        let detail: Value = serde_json::from_str(payload).unwrap_or(Value::Null);
        let class = detail.get(0).and_then(Value::as_str).unwrap_or("Error");
        let text = detail.get(1).and_then(Value::as_str).unwrap_or(payload);
        bail!("SECoP {class} on {spec}: {text}");
    }
    if keyword != action || spec != specifier {
        bail!("Unexpected SECoP reply to {specifier}: '{line}'");
    }

    let report: Value = serde_json::from_str(payload)
        .with_context(|| format!("Malformed SECoP data report: '{payload}'"))?;
    report
        .get(0)
        .cloned()
        .ok_or_else(|| anyhow!("Empty SECoP data report for {specifier}"))
}

/// Numeric value of a `value` / `target` report.
pub fn report_number(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| anyhow!("SECoP value is not a number: {value}"))
}

/// Status code of a `status` report (`[code, text]`).
pub fn status_code(value: &Value) -> Result<i64> {
    value
        .get(0)
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("SECoP status is not [code, text]: {value}"))
}

/// Feedback controller backed by a SECoP node.
pub struct SecopController {
    address: String,
    modules: SecopModules,
    stream: Mutex<Option<BufReader<TcpStream>>>,
    timeout: Duration,
}

impl SecopController {
    /// Client for `host:port`. Does not connect yet.
    pub fn new(address: impl Into<String>, modules: SecopModules) -> Self {
        Self {
            address: address.into(),
            modules,
            stream: Mutex::new(None),
            timeout: Duration::from_secs(5),
        }
    }

    /// Override the per-request reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Node address.
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn request(&self, message: &str, action: &str, specifier: &str) -> Result<Value> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            info!(address = %self.address, "Connecting to SECoP node");
            let stream = TcpStream::connect(&self.address)
                .await
                .with_context(|| format!("Failed to connect to SECoP node at {}", self.address))?;
            *guard = Some(BufReader::new(stream));
        }
        let stream = guard
            .as_mut()
            .ok_or_else(|| anyhow!("SECoP connection unavailable"))?;

        trace!(%message, "SECoP request");
        let written = stream
            .get_mut()
            .write_all(format!("{message}\n").as_bytes())
            .await;
        if let Err(err) = written {
            *guard = None;
            return Err(err).context("SECoP write failed");
        }

        loop {
            let stream = guard
                .as_mut()
                .ok_or_else(|| anyhow!("SECoP connection unavailable"))?;
            let mut line = String::new();
            let outcome = tokio::time::timeout(self.timeout, stream.read_line(&mut line)).await;
            let read = match outcome {
                Ok(Ok(read)) => read,
                Ok(Err(err)) => {
                    *guard = None;
                    return Err(err).context("SECoP read failed");
                }
                Err(_) => {
                    // A late reply would otherwise answer the next request.
                    *guard = None;
                    warn!(address = %self.address, "SECoP reply timed out, dropping connection");
                    bail!("SECoP read timeout after {:?} on '{message}'", self.timeout);
                }
            };
            if read == 0 {
                *guard = None;
                bail!("SECoP node {} closed the connection", self.address);
            }
            if line.starts_with("update ") {
                continue;
            }
            trace!(reply = %line.trim(), "SECoP reply");
            return parse_reply(&line, action, specifier);
        }
    }

    async fn read_parameter(&self, quantity: ControlledQuantity, parameter: &str) -> Result<Value> {
        let specifier = format!("{}:{parameter}", self.modules.module(quantity));
        self.request(&format!("read {specifier}"), "reply", &specifier)
            .await
    }
}

#[async_trait]
impl FeedbackController for SecopController {
    async fn read_value(&self, quantity: ControlledQuantity) -> Result<f64> {
        report_number(&self.read_parameter(quantity, "value").await?)
    }

    async fn read_status(&self, quantity: ControlledQuantity) -> Result<i64> {
        status_code(&self.read_parameter(quantity, "status").await?)
    }

    async fn write_setpoint(&self, quantity: ControlledQuantity, value: f64) -> Result<()> {
        let specifier = format!("{}:target", self.modules.module(quantity));
        let payload = serde_json::to_string(&value)?;
        self.request(&format!("change {specifier} {payload}"), "changed", &specifier)
            .await?;
        debug!(%quantity, value, "SECoP target changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn reply_value_is_first_report_element() {
        let value = parse_reply(
            "reply tt:value [4.21,{\"t\":1700000000.0}]\n",
            "reply",
            "tt:value",
        )
        .unwrap();
        assert_eq!(report_number(&value).unwrap(), 4.21);

        let status = parse_reply("reply mf:status [[100,\"IDLE\"],{}]", "reply", "mf:status").unwrap();
        assert_eq!(status_code(&status).unwrap(), 100);
    }

    #[test]
    fn error_replies_become_errors() {
        let err = parse_reply(
            "error_read xx:value [\"NoSuchModule\",\"xx does not exist\",{}]",
            "reply",
            "xx:value",
        )
        .unwrap_err();
        assert!(err.to_string().contains("NoSuchModule"));
        assert!(parse_reply("reply tt:target [1.0,{}]", "reply", "tt:value").is_err());
        assert!(parse_reply("reply tt:value not-json", "reply", "tt:value").is_err());
    }

    #[tokio::test]
    async fn talks_to_a_node_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let node = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                let reply = match line.as_str() {
                    "change tt:target 1.5" => "changed tt:target [1.5,{}]\n",
                    "read tt:status" => "update tt:value [3.0,{}]\nreply tt:status [[150,\"\"],{}]\n",
                    _ => "error_read ? [\"BadRequest\",\"\",{}]\n",
                };
                write.write_all(reply.as_bytes()).await.unwrap();
                seen.push(line);
                if seen.len() == 2 {
                    break;
                }
            }
            seen
        });

        let controller = SecopController::new(addr, SecopModules::default());
        controller
            .write_setpoint(ControlledQuantity::Temperature, 1.5)
            .await
            .unwrap();
        let status = controller
            .read_status(ControlledQuantity::Temperature)
            .await
            .unwrap();

        assert_eq!(status, 150);
        assert_eq!(node.await.unwrap(), vec!["change tt:target 1.5", "read tt:status"]);
    }

    #[tokio::test]
    async fn timed_out_request_reconnects_before_the_next() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let node = tokio::spawn(async move {
            let (slow, _) = listener.accept().await.unwrap();
            let (read, mut late_writer) = slow.into_split();
            let first = BufReader::new(read).lines().next_line().await.unwrap().unwrap();

            let (fresh, _) = listener.accept().await.unwrap();
            let _ = late_writer
                .write_all(b"reply tt:value [1.0,{}]\n")
                .await;
            let (read, mut write) = fresh.into_split();
            let second = BufReader::new(read).lines().next_line().await.unwrap().unwrap();
            write
                .write_all(b"reply tt:status [[150,\"\"],{}]\n")
                .await
                .unwrap();
            vec![first, second]
        });

        let controller = SecopController::new(addr, SecopModules::default())
            .with_timeout(Duration::from_millis(50));

        let err = controller
            .read_value(ControlledQuantity::Temperature)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
        let status = controller
            .read_status(ControlledQuantity::Temperature)
            .await
            .unwrap();

        assert_eq!(status, 150);
        assert_eq!(node.await.unwrap(), vec!["read tt:value", "read tt:status"]);
    }
}
