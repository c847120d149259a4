//! # Transport DAQ Core Library
//!
//! Trigger-synchronized sweeps on a dual-channel Keithley 2600 source-measure
//! unit, combined with cryostat temperature / field stabilization, for
//! low-temperature transport measurements on gated devices.
//!
//! ## Crate Structure
//!
//! - **`abort`**: `AbortSignal`, the shared stop flag polled by sweeps and stabilization.
//! - **`config`**: Layered `Settings` (TOML file + `TRANSPORT_DAQ_*` environment).
//! - **`error`**: `DaqError` and the `AppResult` alias used across the crate.
//! - **`hardware`**: Capability traits (`SmuInstrument`, `SmuChannel`,
//!   `FeedbackController`), the TSP driver, the SECoP cryostat client,
//!   mocks, and the `InstrumentRegistry`.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`procedures`**: Configurable measurement runs producing `TransportRecord` rows.
//! - **`stabilization`**: Setpoint writing and settle detection.
//! - **`storage`**: JSON-lines data files, one per run.
//! - **`sweep`**: Axis construction, channel configuration, trigger wiring,
//!   sweep execution and curve recording on a `SourceMeter`.

pub mod abort;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod procedures;
pub mod stabilization;
pub mod storage;
pub mod sweep;
