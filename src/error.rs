//! Error types for anvilq operations.

use thiserror::Error;

/// Result type used throughout anvilq.
pub type AnvilResult<T> = Result<T, AnvilError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for anvilq operations.
#[derive(Error, Debug)]
pub enum AnvilError {
    /// The backing store could not be reached. Transient.
    #[error("Broker unavailable: {message}")]
    BrokerUnavailable {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// The broker rejected an operation (queue full, corrupt record, script error)
    #[error("Broker error: {message}")]
    Broker {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// No handler registered for the task type. Never retried.
    #[error("No handler registered for task type '{task_type}'")]
    UnknownTaskType {
        /// The task type that wasn't found
        task_type: String,
    },

    /// A handler was registered twice for the same task type
    #[error("A handler for task type '{task_type}' is already registered")]
    DuplicateHandler {
        /// The task type registered twice
        task_type: String,
    },

    /// A handler returned an error. Retried up to the task's `max_retries`.
    #[error("Handler execution failed: {message}")]
    HandlerExecution {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// A handler ran past its deadline
    #[error("Handler timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The job service could not start
    #[error("Startup failed: {message}")]
    Startup {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The task payload could not be decoded for its handler. Never retried.
    #[error("Invalid payload for task type '{task_type}': {source}")]
    InvalidPayload {
        /// Task type whose handler rejected the payload
        task_type: String,
        /// Decoding error
        #[source]
        source: serde_json::Error,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// The job service is already running
    #[error("Job service is already running")]
    AlreadyRunning,

    /// The job service has been stopped and cannot be restarted
    #[error("Job service has been stopped")]
    AlreadyStopped,
}

impl AnvilError {
    /// Create a handler execution error from an underlying error
    pub fn handler<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::HandlerExecution {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a handler execution error with only a message
    pub fn handler_msg(message: impl Into<String>) -> Self {
        Self::HandlerExecution {
            message: message.into(),
            source: None,
        }
    }

    /// Create a non-transient broker error
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient broker error
    pub fn broker_unavailable<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::BrokerUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transient broker error with only a message
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::BrokerUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a startup error
    pub fn startup(message: impl Into<String>, source: Option<AnvilError>) -> Self {
        Self::Startup {
            message: message.into(),
            source: source.map(|e| Box::new(e) as BoxError),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Whether the worker pool should retry the failed task.
    ///
    /// A missing handler or a payload the handler cannot decode fails the
    /// same way on every attempt, so those go straight to the dead-letter set.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnknownTaskType { .. }
                | Self::DuplicateHandler { .. }
                | Self::InvalidPayload { .. }
        )
    }

    /// Whether the error is a temporary broker outage.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BrokerUnavailable { .. })
    }
}

#[cfg(feature = "redis-broker")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
impl From<redis::RedisError> for AnvilError {
    fn from(err: redis::RedisError) -> Self {
        let message = err.to_string();
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            Self::BrokerUnavailable {
                message,
                source: Some(Box::new(err)),
            }
        } else {
            Self::Broker {
                message,
                source: Some(Box::new(err)),
            }
        }
    }
}
