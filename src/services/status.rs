//! DIMSE status codes to operation outcomes
//!
//! Status values follow PS3.4 / PS3.7:
//! - `0x0000`: Success
//! - `0xFF00`, `0xFF01`: Pending
//! - `0xFE00`: Cancel
//! - `0x0001`, `0x0107`, `0x0116`, `0xB000-0xBFFF`: Warning
//! - anything else: Failure

use dimse::{DimseCommand, DimseStatus};

use crate::models::{OperationOutcome, OperationStatus};

/// Short description of well known status codes
pub fn describe(code: u16) -> &'static str {
    match code {
        0x0000 => "Success",
        0xFF00 | 0xFF01 => "Pending",
        0xFE00 => "Cancelled",
        0x0110 => "Processing failure",
        0x0122 => "SOP class not supported",
        0x0124 => "Not authorized",
        0x0211 => "Unrecognized operation",
        0xA700 => "Out of resources",
        0xA701 => "Out of resources: unable to calculate number of matches",
        0xA702 => "Out of resources: unable to perform sub-operations",
        0xA801 => "Move destination unknown",
        0xA900 => "Identifier does not match SOP class",
        0xB000 => "Sub-operations complete: one or more failures",
        0xC000..=0xCFFF => "Unable to process",
        _ => "Unknown status",
    }
}

/// Outcome of an exchange from its final response.
///
/// Only `Success` is a success; a cancel status, or `cancel_requested`,
/// yields `Cancelled`; warnings and failures yield `Failure`.
pub fn final_outcome(
    command: DimseCommand,
    status: DimseStatus,
    cancel_requested: bool,
) -> OperationOutcome {
    match status {
        DimseStatus::Cancel => OperationOutcome::cancelled(),
        _ if cancel_requested => OperationOutcome::cancelled(),
        DimseStatus::Success => OperationOutcome::success(),
        DimseStatus::Pending => OperationOutcome::new(
            OperationStatus::Unknown,
            format!("{} ended while still pending", command),
        ),
        DimseStatus::Warning(code) | DimseStatus::Failure(code) => {
            OperationOutcome::failure(format!(
                "{} failed with status 0x{:04X} ({})",
                command,
                code,
                describe(code)
            ))
        }
    }
}

/// Whether a failure status is worth retrying later
pub fn is_retriable_status(status: &DimseStatus) -> bool {
    match status {
        DimseStatus::Failure(code) => matches!(*code, 0xA700 | 0xA701 | 0xA702),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_and_cancel() {
        assert!(final_outcome(DimseCommand::Find, DimseStatus::Success, false).is_success());
        assert_eq!(
            final_outcome(DimseCommand::Find, DimseStatus::Cancel, false).status,
            OperationStatus::Cancelled
        );
        assert_eq!(
            final_outcome(DimseCommand::Move, DimseStatus::Success, true).status,
            OperationStatus::Cancelled
        );
    }

    #[test]
    fn test_failure_message_carries_hex_status() {
        let outcome = final_outcome(DimseCommand::Move, DimseStatus::Failure(0xA801), false);
        assert_eq!(outcome.status, OperationStatus::Failure);
        assert_eq!(
            outcome.last_error,
            "C-MOVE failed with status 0xA801 (Move destination unknown)"
        );
    }

    #[test]
    fn test_warning_is_not_success() {
        let outcome = final_outcome(DimseCommand::Move, DimseStatus::Warning(0xB000), false);
        assert_eq!(outcome.status, OperationStatus::Failure);
        assert!(outcome.last_error.contains("0xB000"));
    }

    #[test]
    fn test_is_retriable_status() {
        assert!(is_retriable_status(&DimseStatus::Failure(0xA700)));
        assert!(is_retriable_status(&DimseStatus::Failure(0xA702)));
        assert!(!is_retriable_status(&DimseStatus::Failure(0x0110)));
        assert!(!is_retriable_status(&DimseStatus::Success));
    }
}
