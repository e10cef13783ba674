//! Error types for the storage cluster.

use crate::types::StorePort;
use std::io;
use thiserror::Error;

/// Result type alias for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the storage cluster.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire protocol errors.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Local storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A raw byte read is already registered on this connection.
    #[error("another operation is already waiting on bytes")]
    RawReadPending,

    /// Failed to bind a listening socket.
    #[error("failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Wire protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line was empty.
    #[error("empty message")]
    Empty,

    /// The first token is not a known message kind.
    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    /// A message had the wrong number of arguments.
    #[error("{kind}: malformed arguments")]
    MalformedArguments { kind: &'static str },

    /// A numeric argument failed to parse.
    #[error("{kind}: invalid number {value:?}")]
    InvalidNumber { kind: &'static str, value: String },

    /// The message kind is not accepted on this connection.
    #[error("unexpected message on this connection: {0}")]
    Unexpected(String),
}

/// Local storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The file is not present in local storage.
    #[error("file not found: {0}")]
    NotFound(String),

    /// The file name cannot be used as a local path.
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    /// The storage path exists but is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failures of client-visible file operations.
///
/// Each variant maps onto exactly one wire error reply, see
/// [`crate::controller::error_reply`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperationError {
    /// A live file with the same name already exists.
    #[error("file already exists")]
    AlreadyExists,

    /// No available file has that name.
    #[error("file does not exist")]
    NotExists,

    /// A remove for the file is already running.
    #[error("file is already being removed")]
    AlreadyRemoving,

    /// Fewer storage nodes are connected than the replication factor.
    #[error("not enough storage nodes")]
    NotEnoughStores,

    /// No further replica can serve the load.
    #[error("load failed")]
    LoadFailed,
}

/// Rebalance related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RebalanceError {
    /// A rebalance is already pending or running.
    #[error("rebalance already in progress")]
    AlreadyRebalancing,

    /// A storage node did not report its listing in time.
    #[error("storage node {0} did not respond")]
    NodeUnresponsive(StorePort),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: Error = NetworkError::RawReadPending.into();
        assert_eq!(
            err.to_string(),
            "network error: another operation is already waiting on bytes"
        );

        let err: Error = ProtocolError::UnknownKind("FETCH".into()).into();
        assert_eq!(err.to_string(), "protocol error: unknown message kind: FETCH");
    }

    #[test]
    fn test_io_error_converts_to_network() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, Error::Network(NetworkError::Io(_))));
    }
}
