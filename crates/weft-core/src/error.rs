//! Error types for weft
//!
//! One error type is shared by the lock manager and the connector pool so that
//! callers juggling both (for example a worker that locks a document key and then
//! grabs a connector) can propagate with `?` without conversions.
//!
//! Classification:
//! - Expected contention (`LockUnavailable`) is retriable
//! - Programmer errors (`IllegalLockSequence`) and instantiation failures are not
//! - `Interrupted` is surfaced so the caller can wind down

use std::fmt;
use thiserror::Error;

/// Result type for weft operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid lock nesting (programmer error)
    LockSequence,
    /// Lock could not be taken without waiting
    LockUnavailable,
    /// Blocking wait was interrupted
    Interrupted,
    /// Connector handle could not be constructed
    Instantiation,
    /// Connector operation failed (connect, poll, disconnect, ...)
    Connector,
    /// Cross-process coordination medium failed
    Coordination,
    /// Configuration error
    Configuration,
    /// I/O error
    Io,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::LockUnavailable | Self::Coordination)
    }
}

/// Main error type for weft
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// A stronger lock was requested while only a weaker one is held,
    /// or a lock was released that is not held
    #[error("illegal lock sequence: {message}")]
    IllegalLockSequence { message: String },

    /// No-wait acquisition hit contention
    #[error("lock unavailable: {key}")]
    LockUnavailable { key: String },

    /// A blocking wait was interrupted through the thread context
    #[error("interrupted: {message}")]
    Interrupted { message: String },

    /// Connector factory failed to build a handle
    #[error("cannot instantiate connector '{type_name}': {message}")]
    Instantiation {
        type_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Batch acquisition was given the same ordering key twice
    #[error("duplicate ordering key: {key}")]
    DuplicateOrderingKey { key: String },

    /// Connector operation failed
    #[error("connector error on '{connection}': {message}")]
    Connector {
        connection: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Coordination backend failure
    #[error("coordination error: {message}")]
    Coordination {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::IllegalLockSequence { .. } => ErrorCategory::LockSequence,
            Self::LockUnavailable { .. } => ErrorCategory::LockUnavailable,
            Self::Interrupted { .. } => ErrorCategory::Interrupted,
            Self::Instantiation { .. } => ErrorCategory::Instantiation,
            Self::Connector { .. } => ErrorCategory::Connector,
            Self::Coordination { .. } => ErrorCategory::Coordination,
            Self::Configuration { .. } | Self::DuplicateOrderingKey { .. } => {
                ErrorCategory::Configuration
            }
            Self::Io(_) => ErrorCategory::Io,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this is a no-wait contention failure
    #[inline]
    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self, Self::LockUnavailable { .. })
    }

    /// Whether this is an interruption
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// Create an illegal lock sequence error
    pub fn illegal_sequence(message: impl Into<String>) -> Self {
        Self::IllegalLockSequence {
            message: message.into(),
        }
    }

    /// Create a lock unavailable error
    pub fn lock_unavailable(key: impl Into<String>) -> Self {
        Self::LockUnavailable { key: key.into() }
    }

    /// Create an interrupted error
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::Interrupted {
            message: message.into(),
        }
    }

    /// Create an instantiation error
    pub fn instantiation(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Instantiation {
            type_name: type_name.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an instantiation error with source
    pub fn instantiation_with_source(
        type_name: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Instantiation {
            type_name: type_name.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connector error
    pub fn connector(connection: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connector {
            connection: connection.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a connector error with source
    pub fn connector_with_source(
        connection: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connector {
            connection: connection.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a coordination error
    pub fn coordination(message: impl Into<String>) -> Self {
        Self::Coordination {
            message: message.into(),
            source: None,
        }
    }

    /// Create a coordination error wrapping an I/O failure
    pub fn coordination_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Coordination {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockSequence => write!(f, "lock_sequence"),
            Self::LockUnavailable => write!(f, "lock_unavailable"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Instantiation => write!(f, "instantiation"),
            Self::Connector => write!(f, "connector"),
            Self::Coordination => write!(f, "coordination"),
            Self::Configuration => write!(f, "configuration"),
            Self::Io => write!(f, "io"),
            Self::Other => write!(f, "other"),
        }
    }
}
