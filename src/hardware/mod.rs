//! Hardware layer.
//!
//! Capability traits the sweep engine and stabilization loop talk to, the
//! drivers implementing them, and simulated instruments.

pub mod capabilities;
pub mod keithley2600;
pub mod mock;
pub mod registry;
pub mod secop;
pub mod trigger;

pub use capabilities::{ControlledQuantity, FeedbackController, SmuChannel, SmuInstrument};
pub use keithley2600::{Keithley2600, TcpTspTransport, TspTransport};
pub use mock::{MockCryostat, MockSmu};
pub use registry::{InstrumentInfo, InstrumentRegistry};
pub use secop::{SecopController, SecopModules};
