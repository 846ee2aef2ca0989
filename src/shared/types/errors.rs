use thiserror::Error;

/// Error type returned by event handlers.
pub type DynHandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Transport-level failures reported by the broker connection or a channel.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Channel fault: {0}")]
    ChannelFault(String),

    #[error("Channel is closed")]
    Closed,

    #[error("Not found: {kind} {name}")]
    NotFound { kind: &'static str, name: String },
}

impl BrokerError {
    /// Whether this failure is likely transient (broker down, network blip)
    /// and the operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unreachable(_) | BrokerError::Io(_))
    }
}

/// Failures surfaced by the event bus API.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Transport(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Handler {kind} failed: {source}")]
    Handler {
        kind: &'static str,
        source: DynHandlerError,
    },

    #[error("Event name {event} is already registered with a different payload type")]
    EventTypeMismatch { event: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// Whether this error is retryable at the transport level.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transport(e) if e.is_transient())
    }
}

pub type BusResult<T> = Result<T, BusError>;
