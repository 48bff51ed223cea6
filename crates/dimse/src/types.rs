//! Common types for DIMSE operations

use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};

use crate::error::DimseError;

/// DIMSE command types, with the request/response CommandField codes of PS3.7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimseCommand {
    Echo,
    Find,
    Move,
    Get,
    Store,
    Cancel,
}

impl DimseCommand {
    /// CommandField value of the request primitive
    pub fn request_field(self) -> u16 {
        match self {
            DimseCommand::Store => 0x0001,
            DimseCommand::Get => 0x0010,
            DimseCommand::Find => 0x0020,
            DimseCommand::Move => 0x0021,
            DimseCommand::Echo => 0x0030,
            DimseCommand::Cancel => 0x0FFF,
        }
    }

    /// CommandField value of the response primitive
    pub fn response_field(self) -> u16 {
        match self {
            DimseCommand::Cancel => 0x0FFF,
            other => other.request_field() | 0x8000,
        }
    }

    /// Classify a CommandField value, returning whether it is a response
    pub fn from_field(field: u16) -> Option<(Self, bool)> {
        let is_response = field & 0x8000 != 0 && field != 0x0FFF;
        let command = match field & 0x7FFF {
            0x0001 => DimseCommand::Store,
            0x0010 => DimseCommand::Get,
            0x0020 => DimseCommand::Find,
            0x0021 => DimseCommand::Move,
            0x0030 => DimseCommand::Echo,
            0x0FFF => DimseCommand::Cancel,
            _ => return None,
        };
        Some((command, is_response))
    }
}

impl std::fmt::Display for DimseCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimseCommand::Echo => write!(f, "C-ECHO"),
            DimseCommand::Find => write!(f, "C-FIND"),
            DimseCommand::Move => write!(f, "C-MOVE"),
            DimseCommand::Get => write!(f, "C-GET"),
            DimseCommand::Store => write!(f, "C-STORE"),
            DimseCommand::Cancel => write!(f, "C-CANCEL"),
        }
    }
}

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLevel {
    /// Patient level
    Patient,
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

/// Priority of a DIMSE request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn code(self) -> u16 {
        match self {
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
            Priority::Low => 0x0002,
        }
    }
}

/// DIMSE operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// Operation is pending (more responses to follow)
    Pending,
    /// Operation cancelled by user
    Cancel,
    /// Operation failed with error
    Failure(u16), // DICOM status code
    /// Warning occurred during operation
    Warning(u16), // DICOM status code
}

/// Status codes used when answering requests
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const PENDING_WARNING: u16 = 0xFF01;
    pub const CANCEL: u16 = 0xFE00;
    pub const OUT_OF_RESOURCES: u16 = 0xA700;
    pub const CANNOT_UNDERSTAND: u16 = 0xC000;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
}

impl DimseStatus {
    /// Classify a raw Status (0000,0900) value
    pub fn from_code(code: u16) -> Self {
        match code {
            status::SUCCESS => DimseStatus::Success,
            status::PENDING | status::PENDING_WARNING => DimseStatus::Pending,
            status::CANCEL => DimseStatus::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => DimseStatus::Warning(code),
            _ => DimseStatus::Failure(code),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => status::SUCCESS,
            DimseStatus::Pending => status::PENDING,
            DimseStatus::Cancel => status::CANCEL,
            DimseStatus::Failure(c) | DimseStatus::Warning(c) => *c,
        }
    }

    /// Success or warning: the operation did what was asked
    pub fn is_successful(&self) -> bool {
        matches!(self, DimseStatus::Success | DimseStatus::Warning(_))
    }

    /// Whether this is the last response of an exchange
    pub fn is_final(&self) -> bool {
        !matches!(self, DimseStatus::Pending)
    }
}

/// A presentation context offered during association negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationContextProposal {
    pub abstract_syntax: String,
    /// Transfer syntaxes in order of preference
    pub transfer_syntaxes: Vec<String>,
}

impl PresentationContextProposal {
    pub fn new(abstract_syntax: impl Into<String>, transfer_syntaxes: &[&str]) -> Self {
        Self {
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
        }
    }
}

/// A presentation context accepted by the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
    pub id: u8,
    /// Known on the requestor side; the acceptor learns it from each command
    pub abstract_syntax: Option<String>,
    pub transfer_syntax: String,
}

/// One DIMSE message: a command set and its optional data set
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    pub dataset: Option<InMemDicomObject>,
}

impl DimseMessage {
    pub fn new(presentation_context_id: u8, command: InMemDicomObject) -> Self {
        Self {
            presentation_context_id,
            command,
            dataset: None,
        }
    }

    pub fn with_dataset(mut self, dataset: InMemDicomObject) -> Self {
        self.dataset = Some(dataset);
        self
    }
}

/// What came in on an association while waiting for a command
#[derive(Debug)]
pub enum Incoming {
    Message(DimseMessage),
    ReleaseRequested,
    Aborted,
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = DimseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            _ => Err(DimseError::config(format!("Invalid query level: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_field_codes() {
        assert_eq!(DimseCommand::Echo.request_field(), 0x0030);
        assert_eq!(DimseCommand::Echo.response_field(), 0x8030);
        assert_eq!(DimseCommand::Store.response_field(), 0x8001);
        assert_eq!(DimseCommand::Cancel.response_field(), 0x0FFF);
        assert_eq!(
            DimseCommand::from_field(0x8021),
            Some((DimseCommand::Move, true))
        );
        assert_eq!(
            DimseCommand::from_field(0x0FFF),
            Some((DimseCommand::Cancel, false))
        );
        assert_eq!(DimseCommand::from_field(0x0100), None);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(DimseStatus::from_code(0x0000), DimseStatus::Success);
        assert_eq!(DimseStatus::from_code(0xFF01), DimseStatus::Pending);
        assert_eq!(DimseStatus::from_code(0xFE00), DimseStatus::Cancel);
        assert_eq!(DimseStatus::from_code(0xB000), DimseStatus::Warning(0xB000));
        assert_eq!(DimseStatus::from_code(0xA702), DimseStatus::Failure(0xA702));
        assert!(DimseStatus::Warning(0xB007).is_successful());
        assert!(!DimseStatus::Pending.is_final());
    }

    #[test]
    fn test_query_level_parsing() {
        assert_eq!("PATIENT".parse::<QueryLevel>().unwrap(), QueryLevel::Patient);
        assert_eq!("study".parse::<QueryLevel>().unwrap(), QueryLevel::Study);
        assert!("INVALID".parse::<QueryLevel>().is_err());
    }
}
