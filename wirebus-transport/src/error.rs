//! Error types for transport operations.

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Transport has not been started.
    #[error("Transport not started")]
    NotStarted,

    /// Transport has already been started once.
    #[error("Transport already started")]
    AlreadyStarted,

    /// Transport is shutting down.
    #[error("Transport stopping")]
    Stopping,

    /// A listen or connect spec failed normalization.
    #[error("Invalid spec: {message}")]
    InvalidSpec {
        /// Error message.
        message: String,
    },

    /// The normalized listen spec is already in the requested set.
    #[error("Already listening on {spec}")]
    AlreadyListening {
        /// Normalized listen spec.
        spec: String,
    },

    /// The connect target is one of our own listeners.
    #[error("Refusing connection to self: {spec}")]
    SelfConnection {
        /// Normalized connect spec.
        spec: String,
    },

    /// Per-transport connection limits are exhausted.
    #[error("Connection limit exceeded")]
    ConnectionLimit,

    /// Framing or handshake failure.
    #[error("Authentication failed: {message}")]
    AuthFailed {
        /// Error message.
        message: String,
    },

    /// Outbound connection establishment failure.
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        /// Error message.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Create an invalid spec error.
    pub fn invalid_spec<S: Into<String>>(message: S) -> Self {
        Self::InvalidSpec {
            message: message.into(),
        }
    }

    /// Create an already listening error.
    pub fn already_listening<S: Into<String>>(spec: S) -> Self {
        Self::AlreadyListening { spec: spec.into() }
    }

    /// Create a self connection error.
    pub fn self_connection<S: Into<String>>(spec: S) -> Self {
        Self::SelfConnection { spec: spec.into() }
    }

    /// Create an authentication failed error.
    pub fn auth_failed<S: Into<String>>(message: S) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    /// Create a connection failed error.
    pub fn connection_failed<S: Into<String>>(message: S) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;
