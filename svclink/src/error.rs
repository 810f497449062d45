//! Error types for the svclink library

use crate::ids::MessageId;
use thiserror::Error;

/// Main error type for svclink operations
#[derive(Error, Debug)]
pub enum Error {
    /// Routing layer errors: no queue for the target, queue closed
    #[error("Routing error: {message}")]
    Routing { message: String },

    /// No stub is registered under the given role
    #[error("Service role '{role}' not found")]
    ServiceNotFound { role: String },

    /// No dispatcher thread is registered under the given name
    #[error("Dispatcher thread '{name}' not found")]
    ThreadNotFound { name: String },

    /// Consumer id does not belong to the dispatcher thread
    #[error("Consumer {consumer} not found")]
    ConsumerNotFound { consumer: u32 },

    /// Serialization and deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A message id that does not belong to the interface, or is used in
    /// the wrong role. Raised the same way in every build profile.
    #[error("Protocol violation on '{service}': {message} (id {msg_id})")]
    ProtocolViolation {
        service: String,
        msg_id: MessageId,
        message: String,
    },

    /// Runtime errors
    #[error("Runtime error: {message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors, including malformed interface descriptors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Timeout errors
    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },
}

impl Error {
    /// Create a routing error
    pub fn routing_msg(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    /// Create a service not found error
    pub fn service_not_found(role: impl Into<String>) -> Self {
        Self::ServiceNotFound { role: role.into() }
    }

    /// Create a thread not found error
    pub fn thread_not_found(name: impl Into<String>) -> Self {
        Self::ThreadNotFound { name: name.into() }
    }

    /// Create a serialization error with source
    pub fn serialization<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol violation error
    pub fn protocol_violation(
        service: impl Into<String>,
        msg_id: MessageId,
        message: impl Into<String>,
    ) -> Self {
        Self::ProtocolViolation {
            service: service.into(),
            msg_id,
            message: message.into(),
        }
    }

    /// Create a runtime error with source
    pub fn runtime<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Runtime {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a runtime error without source
    pub fn runtime_msg(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            field,
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Routing { .. } => true,
            Error::ServiceNotFound { .. } => true,
            Error::Timeout { .. } => true,
            Error::Runtime { .. } => true,
            Error::Io { .. } => true,
            Error::ThreadNotFound { .. } => false,
            Error::ConsumerNotFound { .. } => false,
            Error::Serialization { .. } => false,
            Error::ProtocolViolation { .. } => false,
            Error::Configuration { .. } => false,
        }
    }

    /// Get error category for debugging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Routing { .. } => "routing",
            Error::ServiceNotFound { .. } => "service_discovery",
            Error::ThreadNotFound { .. } => "thread_lookup",
            Error::ConsumerNotFound { .. } => "consumer_lookup",
            Error::Serialization { .. } => "serialization",
            Error::ProtocolViolation { .. } => "protocol",
            Error::Runtime { .. } => "runtime",
            Error::Configuration { .. } => "configuration",
            Error::Io { .. } => "io",
            Error::Timeout { .. } => "timeout",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::serialization("Bincode serialization failed", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::configuration(format!("Invalid JSON configuration: {err}"), None)
    }
}

/// Result type for svclink operations
pub type Result<T> = std::result::Result<T, Error>;
