//! Settings loaded with Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults (`#[serde(default)]` on every section)
//! 2. a TOML file (`config/transport.toml` by default)
//! 3. environment variables prefixed with `TRANSPORT_DAQ_`, nested keys
//!    separated by a double underscore
//!    (`TRANSPORT_DAQ_INSTRUMENT__INTEGRATION_TIME=0.04`)
//!
//! # Example
//! ```no_run
//! use transport_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("SMU at {}", settings.instrument.address);
//! # Ok::<(), transport_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::hardware::secop::SecopModules;
use crate::logging::OutputFormat;
use crate::sweep::configurator::{MAX_NPLC, MIN_NPLC};
use crate::sweep::{ChannelRoles, SweepTiming};

/// Default settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "config/transport.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TRANSPORT_DAQ_";

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging and run mode.
    pub application: ApplicationSettings,
    /// Source-measure unit.
    pub instrument: InstrumentSettings,
    /// Temperature / field controller.
    pub cryostat: CryostatSettings,
}

/// Application-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name, shown in logs.
    pub name: String,
    /// Default log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log output format.
    pub log_format: OutputFormat,
    /// Use simulated instruments instead of real hardware.
    pub in_simulation: bool,
    /// Directory receiving one data file per run.
    pub output_dir: PathBuf,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "transport_daq".into(),
            log_level: "info".into(),
            log_format: OutputFormat::Pretty,
            in_simulation: true,
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Which SMU channel is wired to the drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainChannel {
    /// Drain on `smua`, gate on `smub`.
    A,
    /// Drain on `smub`, gate on `smua`.
    B,
}

impl DrainChannel {
    /// Gate / drain role assignment for this wiring.
    pub fn roles(&self) -> ChannelRoles {
        match self {
            DrainChannel::A => ChannelRoles::new("smub", "smua"),
            DrainChannel::B => ChannelRoles::new("smua", "smub"),
        }
    }
}

/// Source-measure unit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    /// VISA-style resource string (`TCPIP0::host::INSTR`).
    pub address: String,
    /// Integration time per point in seconds.
    pub integration_time: f64,
    /// Channel wired to the drain.
    pub drain_channel: DrainChannel,
    /// Interval between sweep-status polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Optional cap on how long a sweep may run.
    #[serde(with = "humantime_serde")]
    pub max_sweep_wait: Option<Duration>,
    /// Reply timeout for instrument queries.
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            address: "TCPIP0::192.168.0.44::INSTR".into(),
            integration_time: 20e-3,
            drain_channel: DrainChannel::B,
            poll_interval: Duration::from_millis(100),
            max_sweep_wait: None,
            query_timeout: Duration::from_secs(5),
        }
    }
}

impl InstrumentSettings {
    /// Sweep polling behaviour.
    pub fn timing(&self) -> SweepTiming {
        SweepTiming {
            poll_interval: self.poll_interval,
            max_wait: self.max_sweep_wait,
        }
    }
}

/// Cryostat settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryostatSettings {
    /// SECoP node `host:port`.
    pub address: String,
    /// SECoP module names.
    pub modules: SecopModules,
    /// Interval between status polls while stabilizing.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Wait after the temperature has settled.
    #[serde(with = "humantime_serde")]
    pub temperature_settle_delay: Duration,
    /// Wait after the field has settled.
    #[serde(with = "humantime_serde")]
    pub field_settle_delay: Duration,
}

impl Default for CryostatSettings {
    fn default() -> Self {
        Self {
            address: "kfes38.troja.mff.cuni.cz:5000".into(),
            modules: SecopModules::default(),
            poll_interval: Duration::from_secs(1),
            temperature_settle_delay: Duration::from_secs(10),
            field_settle_delay: Duration::from_secs(10),
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_SETTINGS_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_SETTINGS_PATH)
    }

    /// Load from a specific file and the environment. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Layered provider stack, exposed for inspection and tests.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Semantic checks Figment cannot express.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let t = self.instrument.integration_time;
        // Accept anything valid at 50 or 60 Hz; the exact bound is checked per sweep.
        if !(t.is_finite() && t > 0.0 && t * 60.0 >= MIN_NPLC && t * 50.0 <= MAX_NPLC) {
            return Err(DaqError::configuration(format!(
                "integration_time {t} s is outside the instrument range"
            )));
        }
        if self.application.output_dir.as_os_str().is_empty() {
            return Err(DaqError::configuration("application.output_dir is empty"));
        }
        if self.instrument.address.trim().is_empty() {
            return Err(DaqError::configuration("instrument.address is empty"));
        }
        if self.instrument.poll_interval.is_zero() || self.cryostat.poll_interval.is_zero() {
            return Err(DaqError::configuration("Poll intervals must be non-zero"));
        }
        if !self.application.in_simulation && self.cryostat.address.trim().is_empty() {
            return Err(DaqError::configuration(
                "cryostat.address is required outside simulation",
            ));
        }
        Ok(())
    }
}
