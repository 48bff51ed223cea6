use serde::Serialize;

use dimse::DimseError;

/// Status taxonomy surfaced by every service call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationStatus {
    Success,
    Pending,
    Failure,
    Timeout,
    ConnectionFailed,
    AssociationRejected,
    NetworkError,
    InvalidParameters,
    Cancelled,
    NotImplemented,
    Unknown,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationStatus::Success => "Success",
            OperationStatus::Pending => "Pending",
            OperationStatus::Failure => "Failure",
            OperationStatus::Timeout => "Timeout",
            OperationStatus::ConnectionFailed => "ConnectionFailed",
            OperationStatus::AssociationRejected => "AssociationRejected",
            OperationStatus::NetworkError => "NetworkError",
            OperationStatus::InvalidParameters => "InvalidParameters",
            OperationStatus::Cancelled => "Cancelled",
            OperationStatus::NotImplemented => "NotImplemented",
            OperationStatus::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

impl From<&DimseError> for OperationStatus {
    fn from(err: &DimseError) -> Self {
        match err {
            DimseError::ConnectionFailed(_) => OperationStatus::ConnectionFailed,
            DimseError::AssociationRejected(_) => OperationStatus::AssociationRejected,
            DimseError::Timeout(_) => OperationStatus::Timeout,
            DimseError::Network(_) if err.is_timeout() => OperationStatus::Timeout,
            DimseError::Network(_) | DimseError::DicomUl(_) | DimseError::Aborted(_) => {
                OperationStatus::NetworkError
            }
            DimseError::Config(_) | DimseError::InvalidAeTitle(_) => {
                OperationStatus::InvalidParameters
            }
            DimseError::DicomParsing(_)
            | DimseError::DicomObject(_)
            | DimseError::OperationFailed(_)
            | DimseError::Storage(_)
            | DimseError::NotSupported(_) => OperationStatus::Failure,
            DimseError::Internal(_) => OperationStatus::Unknown,
        }
    }
}

/// Result of one service call: a status and, unless it succeeded, why
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub status: OperationStatus,
    pub last_error: String,
}

impl OperationOutcome {
    pub fn success() -> Self {
        Self {
            status: OperationStatus::Success,
            last_error: String::new(),
        }
    }

    pub fn new(status: OperationStatus, last_error: impl Into<String>) -> Self {
        Self {
            status,
            last_error: last_error.into(),
        }
    }

    pub fn failure(last_error: impl Into<String>) -> Self {
        Self::new(OperationStatus::Failure, last_error)
    }

    pub fn invalid_parameters(last_error: impl Into<String>) -> Self {
        Self::new(OperationStatus::InvalidParameters, last_error)
    }

    pub fn cancelled() -> Self {
        Self::new(OperationStatus::Cancelled, "operation cancelled")
    }

    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }
}

impl From<&DimseError> for OperationOutcome {
    fn from(err: &DimseError) -> Self {
        Self::new(OperationStatus::from(err), err.to_string())
    }
}

impl From<DimseError> for OperationOutcome {
    fn from(err: DimseError) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_mapping() {
        let refused = DimseError::ConnectionFailed("connection refused".into());
        assert_eq!(OperationStatus::from(&refused), OperationStatus::ConnectionFailed);

        let rejected = DimseError::AssociationRejected("no contexts".into());
        assert_eq!(OperationStatus::from(&rejected), OperationStatus::AssociationRejected);

        let timed_out = DimseError::Network(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(OperationStatus::from(&timed_out), OperationStatus::Timeout);

        let reset = DimseError::Network(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(OperationStatus::from(&reset), OperationStatus::NetworkError);

        let bad_ae = DimseError::InvalidAeTitle("''".into());
        assert_eq!(OperationStatus::from(&bad_ae), OperationStatus::InvalidParameters);
    }

    #[test]
    fn test_outcome_carries_message() {
        let outcome = OperationOutcome::from(DimseError::timeout("no response"));
        assert_eq!(outcome.status, OperationStatus::Timeout);
        assert!(outcome.last_error.contains("no response"));
        assert!(!outcome.is_success());
        assert!(OperationOutcome::success().last_error.is_empty());
    }
}
