//! Custom error types for the application.
//!
//! `DaqError` is the error returned by every measurement-level operation.
//! Hardware capability traits speak `anyhow::Result`; anything they raise is
//! carried through unchanged as [`DaqError::Transport`].
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: the request cannot be executed as given (mismatched or
//!   empty sweep lists, integration time outside the instrument's range, an
//!   unknown channel, an invalid sweep axis). Raised before any hardware write.
//! - **`Transport`**: the instrument or controller failed below the core
//!   boundary (unreachable, malformed reply). Never retried.
//! - **`SweepTimeout`**: the optional maximum sweep wait elapsed.
//! - **`Settings`**, **`Io`**, **`Toml`**: loading settings or procedure files.
//! - **`Serialization`**: writing data files.
//!
//! An abort is not an error: aborted sweeps return empty or partial results.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by sweeps, stabilization and procedure orchestration.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Semantic configuration problem detected before touching hardware.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Failure reported by the instrument or feedback-controller layer.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),

    /// The instrument kept sweeping past the configured maximum wait.
    #[error("Sweep did not complete within {0:?}")]
    SweepTimeout(Duration),

    /// Settings could not be extracted from file or environment.
    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    /// File I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A TOML document failed to parse.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A record or header could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DaqError {
    /// Shorthand for building a [`DaqError::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        DaqError::Configuration(message.into())
    }

    /// True for errors that were raised before any hardware write.
    pub fn is_configuration(&self) -> bool {
        matches!(self, DaqError::Configuration(_))
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Settings(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_keep_their_message() {
        let err: DaqError = anyhow::anyhow!("socket closed").into();
        assert!(matches!(err, DaqError::Transport(_)));
        assert_eq!(err.to_string(), "socket closed");
        assert!(!err.is_configuration());
    }

    #[test]
    fn configuration_helper_builds_variant() {
        let err = DaqError::configuration("lists differ");
        assert!(err.is_configuration());
        assert_eq!(err.to_string(), "Configuration error: lists differ");
    }
}
