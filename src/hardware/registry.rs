//! Instrument registry keyed by connection address.
//!
//! Every part of a run that measures through the same physical instrument
//! must share one [`SourceMeter`]: that is where the measurement lock, the
//! blender-slot pool and the abort signal live. The registry hands out that
//! shared handle, connecting at most once per address, and tears
//! instruments down explicitly.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let registry = InstrumentRegistry::new(abort.clone());
//! let meter = registry
//!     .get_or_connect("TCPIP0::192.168.0.44::INSTR", || async {
//!         let smu = Keithley2600::connect("TCPIP0::192.168.0.44::INSTR").await?;
//!         Ok(Arc::new(smu) as Arc<dyn SmuInstrument>)
//!     })
//!     .await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::abort::AbortSignal;
use crate::error::AppResult;
use crate::hardware::capabilities::SmuInstrument;
use crate::sweep::{SourceMeter, SweepTiming};

/// Summary of a connected instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentInfo {
    /// Connection address.
    pub address: String,
    /// Channel names exposed by the instrument.
    pub channels: Vec<String>,
}

/// Live instruments by address.
pub struct InstrumentRegistry {
    meters: Mutex<HashMap<String, Arc<SourceMeter>>>,
    abort: AbortSignal,
    timing: SweepTiming,
}

impl InstrumentRegistry {
    /// Registry whose meters all share `abort`.
    pub fn new(abort: AbortSignal) -> Self {
        Self {
            meters: Mutex::new(HashMap::new()),
            abort,
            timing: SweepTiming::default(),
        }
    }

    /// Sweep timing applied to newly connected meters.
    pub fn with_timing(mut self, timing: SweepTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Abort signal shared by every meter of this registry.
    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Shared meter for `address`, running `connect` only if none is live.
    ///
    /// The registry stays locked while connecting, so concurrent requests
    /// for the same address never open two connections.
    pub async fn get_or_connect<F, Fut>(&self, address: &str, connect: F) -> AppResult<Arc<SourceMeter>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<dyn SmuInstrument>>>,
    {
        let mut meters = self.meters.lock().await;
        if let Some(meter) = meters.get(address) {
            return Ok(Arc::clone(meter));
        }

        info!(%address, "Connecting instrument");
        let instrument = connect().await?;
        let meter = Arc::new(
            SourceMeter::new(instrument)
                .with_abort_signal(self.abort.clone())
                .with_timing(self.timing),
        );
        meters.insert(address.to_string(), Arc::clone(&meter));
        Ok(meter)
    }

    /// Live meter for `address`, if connected.
    pub async fn get(&self, address: &str) -> Option<Arc<SourceMeter>> {
        self.meters.lock().await.get(address).cloned()
    }

    /// Wait for in-flight measurements, reset the instrument and forget it.
    ///
    /// The registry stays locked until the reset completes, so a concurrent
    /// [`get_or_connect`](Self::get_or_connect) cannot open a second
    /// connection while the old one is still in use.
    ///
    /// Returns `false` when nothing was connected at `address`.
    pub async fn disconnect(&self, address: &str) -> AppResult<bool> {
        let mut meters = self.meters.lock().await;
        let Some(meter) = meters.remove(address) else {
            return Ok(false);
        };
        let _session = meter.session().await;
        meter.instrument().reset().await?;
        drop(meters);
        info!(%address, "Instrument disconnected");
        Ok(true)
    }

    /// Disconnect everything. Keeps going past failures and reports the first.
    pub async fn disconnect_all(&self) -> AppResult<()> {
        let addresses: Vec<String> = self.meters.lock().await.keys().cloned().collect();
        let mut first_error = None;
        for address in addresses {
            if let Err(err) = self.disconnect(&address).await {
                warn!(%address, error = %err, "Failed to reset instrument on disconnect");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Connected instruments.
    pub async fn list(&self) -> Vec<InstrumentInfo> {
        let mut infos: Vec<InstrumentInfo> = self
            .meters
            .lock()
            .await
            .values()
            .map(|meter| InstrumentInfo {
                address: meter.address().to_string(),
                channels: meter.instrument().channel_names(),
            })
            .collect();
        infos.sort_by(|a, b| a.address.cmp(&b.address));
        infos
    }

    /// Number of live instruments.
    pub async fn len(&self) -> usize {
        self.meters.lock().await.len()
    }

    /// True when nothing is connected.
    pub async fn is_empty(&self) -> bool {
        self.meters.lock().await.is_empty()
    }
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::new(AbortSignal::new())
    }
}
