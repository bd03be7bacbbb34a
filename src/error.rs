use std::any::Any;
use std::time::Duration;

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use thiserror::Error;

use crate::message::ResponseStatus;

/// Generic error type for the MQ server and its transports.
#[derive(Debug, Error)]
pub enum MqError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// Error while encoding or decoding a message body.
    #[error("Failed to (de)serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid construction arguments or registration misuse.
    #[error("Messaging setup or configuration error: {message}")]
    Config { message: String },

    /// A handler for this message type is already registered.
    #[error("Message handler already registered for type '{0}'")]
    AlreadyRegistered(String),

    /// Lifecycle call against a disposed server or worker.
    #[error("MQ host has been disposed")]
    Disposed,

    /// The connection or channel went away underneath a worker.
    #[error("Transport interrupted: {0}")]
    Interrupted(String),

    /// The broker does not know the queue or exchange.
    #[error("Queue or exchange '{0}' not found")]
    NotFound(String),

    /// The client handle was closed, usually by `Worker::stop`.
    #[error("Message queue client has been closed")]
    Closed,

    /// Any other transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A worker or controller loop panicked.
    #[error("Background thread panicked: {0}")]
    Panicked(String),

    /// A wait did not observe the expected state in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl MqError {
    pub fn config(message: impl Into<String>) -> Self {
        MqError::Config {
            message: message.into(),
        }
    }

    /// True when the failure means the connection or channel is gone and the
    /// worker should reconnect instead of treating it as a processing error.
    pub fn is_interruption(&self) -> bool {
        match self {
            MqError::Interrupted(_) | MqError::Closed => true,
            MqError::Lapin(err) => matches!(
                err,
                lapin::Error::InvalidConnectionState(_)
                    | lapin::Error::InvalidChannelState(_)
                    | lapin::Error::IOError(_)
            ),
            _ => false,
        }
    }

    /// True for AMQP 404 replies, used to trigger lazy queue declaration.
    pub fn is_not_found(&self) -> bool {
        match self {
            MqError::NotFound(_) => true,
            MqError::Lapin(lapin::Error::ProtocolError(err)) => {
                matches!(err.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
            }
            _ => false,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        MqError::Panicked(panic_message(payload.as_ref()))
    }
}

/// Whether a failed message may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Requeue until the retry ceiling, then dead-letter.
    Retryable,
    /// Dead-letter immediately regardless of retry attempts.
    Unretryable,
}

/// Error returned by a message processing function.
#[derive(Debug, Clone, Error)]
#[error("{error_code}: {message}")]
pub struct HandlerError {
    kind: ErrorKind,
    error_code: String,
    message: String,
}

impl HandlerError {
    /// A transient failure; the message is requeued while retries remain.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            error_code: "HandlerError".to_string(),
            message: message.into(),
        }
    }

    /// A failure that retrying cannot fix; the message goes straight to the dlq.
    pub fn unretryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Unretryable,
            error_code: "UnretryableMessagingError".to_string(),
            message: message.into(),
        }
    }

    pub fn with_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = error_code.into();
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Retryable
    }

    pub fn error_code(&self) -> &str {
        &self.error_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn to_response_status(&self) -> ResponseStatus {
        ResponseStatus::new(self.error_code.clone(), self.message.clone())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::retryable(panic_message(payload.as_ref())).with_code("Panic")
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::unretryable(err.to_string()).with_code("SerializationError")
    }
}

impl From<MqError> for HandlerError {
    fn from(err: MqError) -> Self {
        match err {
            MqError::Serialization(e) => e.into(),
            other => HandlerError::retryable(other.to_string()).with_code("MessagingError"),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
