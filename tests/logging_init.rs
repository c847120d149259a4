//! Global subscriber installation. Kept in its own test binary so the
//! subscriber it installs cannot replace the capture layer other tests use.

use tracing::Level;
use transport_daq::logging::{init, OutputFormat, TracingConfig};

#[test]
fn test_init_twice_is_harmless() {
    let config = TracingConfig::new(Level::WARN).with_format(OutputFormat::Compact);
    assert!(init(config.clone()).is_ok());
    assert!(init(config).is_ok());
}
