//! Error types for the Gatekeeper admission layer.

use thiserror::Error;

use crate::gateway::ClientId;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Two explicit rate limit entries name the same principal
    #[error("Configuration conflict: duplicate rate limit entry for principal '{0}'")]
    ConfigurationConflict(String),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for GatekeeperError {
    fn from(err: ::config::ConfigError) -> Self {
        GatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Reasons a message is refused admission.
///
/// These are ordinary outcomes of [`crate::gateway::AdmissionGateway::admit`],
/// reported back to the sender; the gateway never tears a client down itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The limiter serving this principal already holds `capacity` queued messages.
    #[error("Message dropped: capacity({capacity}) exceeded for principal '{principal}'")]
    CapacityExceeded { principal: String, capacity: usize },

    /// The sending client has no live registration.
    #[error("Message dropped: client '{client}' is not registered with any principal")]
    UnknownPrincipal { client: ClientId },
}
