//! Error types shared by the relay and the client

use thiserror::Error;

/// Errors produced by tunnel operations
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    /// Frame that is not a valid message envelope
    #[error("Protocol error: {message}")]
    Protocol {
        /// What was wrong with the message
        message: String,
    },

    /// Well-formed envelope with an unknown type or a payload that does not fit it
    #[error("Unsupported message: {message}")]
    Unsupported {
        /// What could not be interpreted
        message: String,
    },

    /// No live tunnel is registered under the subdomain
    #[error("Tunnel '{subdomain}' not found")]
    NotFound {
        /// The subdomain that was looked up
        subdomain: String,
    },

    /// Writing to the tunnel connection failed
    #[error("Failed to forward: {message}")]
    Send {
        /// Underlying transport error
        message: String,
    },

    /// No response arrived before the deadline
    #[error("Tunnel did not respond in time")]
    Timeout,

    /// The tunnel connection closed while the request was outstanding
    #[error("Tunnel closed: {reason}")]
    Disconnected {
        /// Why the tunnel was torn down
        reason: String,
    },

    /// A waiter for this correlation id is already registered
    #[error("Request {id} is already in flight")]
    DuplicateRequest {
        /// The colliding correlation id
        id: String,
    },

    /// Dialing or reading from the tunnel connection failed
    #[error("Connection error: {message}")]
    Connection {
        /// Underlying transport error
        message: String,
    },

    /// Invalid configuration value
    #[error("Configuration error: {message}")]
    Config {
        /// What was invalid
        message: String,
    },
}

impl TunnelError {
    /// Create a new protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new unsupported-message error
    #[must_use]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create a new send error from any error type
    #[must_use]
    pub fn send<E: std::fmt::Display>(err: E) -> Self {
        Self::Send {
            message: err.to_string(),
        }
    }

    /// Create a new disconnect error
    #[must_use]
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    /// Create a new connection error from any error type
    #[must_use]
    pub fn connection<E: std::fmt::Display>(err: E) -> Self {
        Self::Connection {
            message: err.to_string(),
        }
    }

    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;
