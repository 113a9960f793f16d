use thiserror::Error;

/// Errors from the durable storage contract (`append` / `read_all` / `delete_all`).
///
/// Always propagated to the caller of the DLQ or replay buffer operation that
/// hit it; the runtime never swallows a storage failure silently.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage connection error: {0}")]
    Connection(String),

    #[error("storage query error: {0}")]
    Query(String),

    #[error("record serialization error: {0}")]
    Serialization(String),
}

/// Why a raw frame could not be turned into a `ParsedMessage`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The payload is not valid (bad JSON, wrong field types).
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The envelope was recognized but its shape is not handled.
    #[error("unsupported message: {0}")]
    Unsupported(String),
}

/// Errors surfaced by a transport.
///
/// Connection loss is recovered inside the transport; only fatal conditions
/// ever reach the listener.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("fatal transport failure: {0}")]
    Fatal(String),
}

/// Classification of a failed downstream (gateway API) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownstreamKind {
    RateLimited,
    Auth,
    NotFound,
    Conflict,
    Server,
    Generic,
}

impl DownstreamKind {
    /// Map an HTTP status code onto a failure kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => DownstreamKind::Auth,
            404 => DownstreamKind::NotFound,
            409 => DownstreamKind::Conflict,
            429 => DownstreamKind::RateLimited,
            500..=599 => DownstreamKind::Server,
            _ => DownstreamKind::Generic,
        }
    }

    /// Tag used as the DLQ `reason` for this kind.
    pub fn as_reason(&self) -> &'static str {
        match self {
            DownstreamKind::RateLimited => "rate_limited",
            DownstreamKind::Auth => "auth",
            DownstreamKind::NotFound => "not_found",
            DownstreamKind::Conflict => "conflict",
            DownstreamKind::Server => "server",
            DownstreamKind::Generic => "generic",
        }
    }
}

/// A handler or outbound call failure reported by a downstream dependency.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} downstream error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
pub struct DownstreamError {
    pub kind: DownstreamKind,
    pub status: Option<u16>,
    pub message: String,
}

impl DownstreamError {
    pub fn new(kind: DownstreamKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Build an error from an HTTP status, classifying it on the way.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: DownstreamKind::from_status(status),
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Returned by the circuit breaker when it rejects a call without running it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit breaker is open for endpoint: {endpoint}")]
pub struct CircuitOpenError {
    pub endpoint: String,
}

/// Anything that can go wrong inside a middleware chain or command handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Downstream(#[from] DownstreamError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("command failed: {0}")]
    Command(String),
}

impl HandlerError {
    /// Shorthand for a generic command failure.
    pub fn command(message: impl Into<String>) -> Self {
        HandlerError::Command(message.into())
    }

    /// The DLQ `reason` tag for this failure.
    pub fn reason(&self) -> &'static str {
        match self {
            HandlerError::Downstream(e) => e.kind.as_reason(),
            HandlerError::CircuitOpen(_) => "circuit_open",
            HandlerError::Storage(_) => "storage",
            HandlerError::Panicked(_) => "panic",
            HandlerError::Command(_) => "generic",
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("missing required configuration values: {0}")]
    Missing(String),

    #[error("invalid configuration for {field}: {message}")]
    Invalid { field: String, message: String },
}
