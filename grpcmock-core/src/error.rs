use std::fmt;

/// All error types produced by the mock server library.
#[derive(Debug)]
pub enum ServerError {
    /// A `.proto` source failed to parse or link. The wrapped error carries
    /// the offending file and position; the ingested sources are retained so
    /// the operator can submit a correction and re-compile.
    Compile(protox::Error),

    /// An invalid argument was provided (e.g., malformed listen address or
    /// an empty mock method name).
    InvalidArgument(String),

    /// An I/O error (socket bind, network, etc.).
    Io(std::io::Error),

    /// A protobuf encoding/decoding error.
    Proto(String),

    /// A gRPC status error from a peer.
    GrpcStatus(tonic::Status),

    /// Any other error.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Compile(err) => write!(f, "compile error: {err}"),
            ServerError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            ServerError::Io(err) => write!(f, "I/O error: {err}"),
            ServerError::Proto(msg) => write!(f, "proto error: {msg}"),
            ServerError::GrpcStatus(status) => {
                write!(f, "gRPC error: {} - {}", status.code(), status.message())
            }
            ServerError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Compile(err) => Some(err),
            ServerError::Io(err) => Some(err),
            ServerError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(err)
    }
}

impl From<tonic::Status> for ServerError {
    fn from(status: tonic::Status) -> Self {
        ServerError::GrpcStatus(status)
    }
}

impl From<protox::Error> for ServerError {
    fn from(err: protox::Error) -> Self {
        ServerError::Compile(err)
    }
}

/// Convenience type alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ServerError>;
