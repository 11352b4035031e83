//! Error types for fleetstate

use std::fmt;

/// Result type alias for fleetstate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for fleetstate
#[derive(Debug)]
pub enum Error {
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Cluster state text could not be parsed or is inconsistent
    InvalidClusterState(String),
    /// Bundle codec errors (corrupt envelope, length mismatch, ...)
    Codec(String),
    /// Payload was tagged with a compression type this codec cannot decode
    UnsupportedCompression(u8),
    /// Compression backend failure
    Compression(String),
    /// Could not establish a connection to a node
    Connection { address: String, reason: String },
    /// Transport-level failure outside a specific RPC call
    Transport(String),
    /// Name service lookup failed
    NameService(String),
    /// Every known push protocol version has been rejected by the node
    ProtocolExhausted { node: String },
    /// Internal error
    Internal(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::InvalidClusterState(msg) => write!(f, "Invalid cluster state: {}", msg),
            Error::Codec(msg) => write!(f, "Bundle codec error: {}", msg),
            Error::UnsupportedCompression(tag) => {
                write!(f, "Unsupported compression type: {}", tag)
            }
            Error::Compression(msg) => write!(f, "Compression error: {}", msg),
            Error::Connection { address, reason } => {
                write!(f, "Failed to connect to {}: {}", address, reason)
            }
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::NameService(msg) => write!(f, "Name service error: {}", msg),
            Error::ProtocolExhausted { node } => write!(
                f,
                "Node {} rejected every known cluster state protocol version",
                node
            ),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<snap::Error> for Error {
    fn from(e: snap::Error) -> Self {
        Error::Compression(e.to_string())
    }
}
