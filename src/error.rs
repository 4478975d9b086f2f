//! Error types shared across the relay.
//!
//! Each component owns its error enum; the crate-level [`Error`] is the
//! umbrella used where a call site spans more than one component (the worker's
//! job execution path, mainly). Binary entry points use `anyhow`.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by broker I/O.
///
/// Everything here is considered retriable by callers: the worker's dequeue
/// loop retries indefinitely, subscribers reopen their subscription.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Could not establish a connection to the broker.
    #[error("broker connection failed: {0}")]
    ConnectionFailed(String),

    /// A broker round-trip failed mid-flight.
    #[error("broker i/o error: {0}")]
    Io(String),
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Io(err.to_string())
    }
}

/// Errors raised by the typed queue layer.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A job or event record could not be serialized.
    #[error("failed to encode queue record: {0}")]
    Encode(#[source] serde_json::Error),

    /// A record popped or received from the broker did not parse.
    #[error("failed to decode queue record: {0}")]
    Decode(#[source] serde_json::Error),

    /// No status hash exists for the job (never enqueued, or TTL expired).
    #[error("job {job_id} is unknown (no status record)")]
    UnknownJob { job_id: String },

    /// The blocking wait elapsed before a terminal event arrived. The job
    /// itself is unaffected.
    #[error("timed out after {timeout:?} waiting for job {job_id} to finish")]
    TerminalWaitTimeout { job_id: String, timeout: Duration },

    /// The event subscription ended before a terminal event was observed.
    #[error("event stream for job {job_id} closed before a terminal event")]
    StreamClosed { job_id: String },
}

/// Errors raised by the bot service client.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("bot service request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx reply from the bot service.
    #[error("bot service returned {status} for {endpoint}: {detail}")]
    Status {
        status: u16,
        endpoint: String,
        detail: String,
    },

    /// The requested agent is not present in the registry, even after a
    /// refresh.
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    /// The bot service replied 2xx but the body did not match the
    /// message-create contract.
    #[error("bot service reply was malformed: {0}")]
    Contract(String),

    /// Failure reported by the agent execution itself. The message is passed
    /// through verbatim so it can be surfaced to the caller unchanged.
    #[error("{0}")]
    Execution(String),
}

/// Configuration resolution errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("configuration constraint violated: {0}")]
    Constraint(String),
}

/// Crate-level umbrella error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Bot(#[from] BotError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
