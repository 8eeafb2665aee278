//! Error types for echowire.

use std::fmt;

use thiserror::Error;

/// Main error type for all echowire operations.
#[derive(Debug, Error)]
pub enum EchowireError {
    /// I/O error during socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (configuration and stats).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket protocol or transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Malformed bytes on a stream.
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    /// A service or echo could not be mounted.
    #[error("mount error: {0}")]
    Mount(#[from] MountError),

    /// The remote echo answered with an error reply.
    #[error("{0}")]
    Rpc(RpcError),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// A call did not receive its reply in time.
    #[error("call timed out")]
    Timeout,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue stayed full past the backpressure timeout.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// The processor is stopped and no longer admits streams.
    #[error("processor closed")]
    ProcessorClosed,
}

/// Result type alias using EchowireError.
pub type Result<T> = std::result::Result<T, EchowireError>;

/// Failure while reading or writing a value on a [`Stream`](crate::protocol::Stream).
///
/// Readers that return a `WireError` leave the read cursor where it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// The value extends past the readable (or allowed) range.
    #[error("value overflows the readable range")]
    Overflow,

    /// The opcode at the cursor does not match the requested type.
    #[error("unexpected opcode {0}")]
    Opcode(u8),

    /// A string was not followed by its zero sentinel byte.
    #[error("string sentinel byte is not zero")]
    Sentinel,

    /// A string payload is not valid UTF-8.
    #[error("string is not valid utf-8")]
    Utf8,

    /// Bytes remain after the last expected value.
    #[error("unexpected trailing bytes")]
    TrailingBytes,

    /// A view index or position is out of range.
    #[error("index out of range")]
    Index,
}

/// Kind of failure raised while mounting a service or echo.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountErrorKind {
    /// Service name does not match `^[_0-9a-zA-Z]+$`.
    #[error("rpc service name \"{0}\" is illegal")]
    IllegalServiceName(String),

    /// Echo name does not match `^[_a-zA-Z][_0-9a-zA-Z]*$`.
    #[error("rpc echo name \"{0}\" is illegal")]
    IllegalEchoName(String),

    /// The parent service path is not registered.
    #[error("rpc service \"{0}\" is not mounted")]
    ServiceNotFound(String),

    /// Mounting would exceed `max_node_depth`.
    #[error("rpc service \"{path}\" depth {depth} is overflow. limit({limit})")]
    DepthOverflow {
        /// Full path of the rejected service.
        path: String,
        /// Depth the service would have.
        depth: u64,
        /// Configured limit.
        limit: u64,
    },

    /// A service or echo with the same name already exists.
    #[error("rpc {what} name \"{name}\" is duplicated (already mounted at {location})")]
    Duplicate {
        /// "service" or "echo".
        what: &'static str,
        /// The conflicting name.
        name: String,
        /// Where the existing node was mounted.
        location: String,
    },
}

/// Structured registration error with the call site it came from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct MountError {
    /// What went wrong.
    pub kind: MountErrorKind,
    /// `file:line` of the failing registration call.
    pub debug: String,
}

impl MountError {
    pub(crate) fn new(kind: MountErrorKind, location: &std::panic::Location<'_>) -> Self {
        Self {
            kind,
            debug: format!("{}:{}", location.file(), location.line()),
        }
    }
}

/// Error reply produced by a remote echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    /// Human readable message.
    pub message: String,
    /// Debug origin (stack trace or mount site), may be empty.
    pub debug: String,
}

impl RpcError {
    /// Create a new error reply value.
    pub fn new(message: impl Into<String>, debug: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            debug: debug.into(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.debug.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}\n{}", self.message, self.debug)
        }
    }
}

impl std::error::Error for RpcError {}
