//! Error types for DIMSE operations

use thiserror::Error;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("DICOM parsing error: {0}")]
    DicomParsing(String),

    #[error("DICOM object error: {0}")]
    DicomObject(String),

    #[error("DICOM UL error: {0}")]
    DicomUl(String),

    #[error("Association rejected: {0}")]
    AssociationRejected(String),

    #[error("Association aborted: {0}")]
    Aborted(String),

    #[error("DIMSE operation failed: {0}")]
    OperationFailed(String),

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new operation failed error
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_)
                | DimseError::ConnectionFailed(_)
                | DimseError::Timeout(_)
                | DimseError::AssociationRejected(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            DimseError::Timeout(_) => true,
            DimseError::Network(e) => is_timeout_kind(e.kind()),
            _ => false,
        }
    }
}

pub(crate) fn is_timeout_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Walk an error's source chain looking for the I/O error underneath.
///
/// dicom-ul wraps socket failures several layers deep; callers need the
/// innermost `io::Error` to tell a poll timeout from a dead peer.
pub(crate) fn find_io_error<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a std::io::Error> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        current = e.source();
    }
    None
}
