//! Error types for muxrpc.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Main error type for all muxrpc operations.
///
/// The variants wrapping foreign error types hold them behind an [`Arc`] so a
/// single transport failure can be fanned out to every pending call on the
/// connection.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// JSON error (handshake preamble or JSON codec).
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// MessagePack serialization error.
    #[error("msgpack encode error: {0}")]
    MsgpackEncode(Arc<rmp_serde::encode::Error>),

    /// MessagePack deserialization error.
    #[error("msgpack decode error: {0}")]
    MsgpackDecode(Arc<rmp_serde::decode::Error>),

    /// Framing violation (oversized blob, malformed preamble, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Codec name not present in the codec registry.
    #[error("invalid codec type {0}")]
    InvalidCodec(String),

    /// Handshake carried the wrong magic number.
    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),

    /// A second registration under an already-taken service name.
    #[error("service already defined: {0}")]
    DuplicateService(String),

    /// No service registered under the requested name.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// The service exists but has no such method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Error produced by a user method; its text travels back in the
    /// response header.
    #[error("{0}")]
    Handler(String),

    /// Non-empty error string received on a response header.
    #[error("{0}")]
    Remote(String),

    /// Dial did not complete within the connect timeout.
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    /// The client is closing or already shut down.
    #[error("connection is shut down")]
    Shutdown,
}

impl RpcError {
    /// Convenience constructor for user method errors.
    pub fn handler(msg: impl Into<String>) -> Self {
        RpcError::Handler(msg.into())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json(Arc::new(err))
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RpcError::MsgpackEncode(Arc::new(err))
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RpcError::MsgpackDecode(Arc::new(err))
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
