//! Construction and inspection of DIMSE command sets (PS3.7 §9.3)
//!
//! Command sets are always plain data elements of group 0000; they are built
//! with `InMemDicomObject::command_from_element_iter`, which also fills in the
//! Command Group Length.

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;

use crate::types::{status, DimseCommand, DimseStatus, Priority};
use crate::uids;

/// CommandDataSetType value meaning "no data set follows"
pub const NO_DATASET: u16 = 0x0101;
/// CommandDataSetType value used when a data set follows
pub const DATASET_PRESENT: u16 = 0x0000;

fn us(tag: Tag, value: u16) -> InMemElement {
    DataElement::new(tag, VR::US, dicom_value!(U16, [value]))
}

fn ui(tag: Tag, value: &str) -> InMemElement {
    DataElement::new(tag, VR::UI, dicom_value!(Str, value))
}

fn dataset_type(has_dataset: bool) -> u16 {
    if has_dataset {
        DATASET_PRESENT
    } else {
        NO_DATASET
    }
}

pub fn echo_rq(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, uids::VERIFICATION),
        us(tags::COMMAND_FIELD, DimseCommand::Echo.request_field()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATASET),
    ])
}

pub fn echo_rsp(message_id: u16, status_code: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, uids::VERIFICATION),
        us(tags::COMMAND_FIELD, DimseCommand::Echo.response_field()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATASET),
        us(tags::STATUS, status_code),
    ])
}

pub fn find_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, DimseCommand::Find.request_field()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, priority.code()),
        us(tags::COMMAND_DATA_SET_TYPE, DATASET_PRESENT),
    ])
}

pub fn find_rsp(
    message_id: u16,
    sop_class_uid: &str,
    status_code: u16,
    has_dataset: bool,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, DimseCommand::Find.response_field()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, dataset_type(has_dataset)),
        us(tags::STATUS, status_code),
    ])
}

pub fn move_rq(
    message_id: u16,
    sop_class_uid: &str,
    priority: Priority,
    destination_ae: &str,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, DimseCommand::Move.request_field()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, priority.code()),
        us(tags::COMMAND_DATA_SET_TYPE, DATASET_PRESENT),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            dicom_value!(Str, destination_ae),
        ),
    ])
}

pub fn move_rsp(
    message_id: u16,
    sop_class_uid: &str,
    status_code: u16,
    progress: SubOperations,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, DimseCommand::Move.response_field()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATASET),
        us(tags::STATUS, status_code),
        us(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, progress.remaining),
        us(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, progress.completed),
        us(tags::NUMBER_OF_FAILED_SUBOPERATIONS, progress.failed),
        us(tags::NUMBER_OF_WARNING_SUBOPERATIONS, progress.warning),
    ])
}

pub fn store_rq(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    priority: Priority,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, DimseCommand::Store.request_field()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, priority.code()),
        us(tags::COMMAND_DATA_SET_TYPE, DATASET_PRESENT),
        ui(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
    ])
}

pub fn store_rsp(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status_code: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, DimseCommand::Store.response_field()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATASET),
        us(tags::STATUS, status_code),
        ui(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
    ])
}

/// C-CANCEL-RQ for the exchange started by `message_id`
pub fn cancel_rq(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        us(tags::COMMAND_FIELD, DimseCommand::Cancel.request_field()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATASET),
    ])
}

/// Sub-operation counters carried by C-MOVE and C-GET responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOperations {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

impl SubOperations {
    pub fn total(&self) -> u32 {
        self.remaining as u32 + self.completed as u32 + self.failed as u32 + self.warning as u32
    }

    /// Fraction of sub-operations completed, or `None` when nothing is known yet
    pub fn progress(&self) -> Option<f32> {
        match self.total() {
            0 => None,
            total => Some(self.completed as f32 / total as f32),
        }
    }
}

fn read_u16(command: &InMemDicomObject, tag: Tag) -> Option<u16> {
    command.element(tag).ok()?.to_int::<u16>().ok()
}

fn read_str(command: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = command.element(tag).ok()?.to_str().ok()?;
    Some(uids::trim_uid(&value).to_string())
}

pub fn command_field(command: &InMemDicomObject) -> Option<u16> {
    read_u16(command, tags::COMMAND_FIELD)
}

pub fn message_id(command: &InMemDicomObject) -> Option<u16> {
    read_u16(command, tags::MESSAGE_ID)
}

pub fn message_id_responded_to(command: &InMemDicomObject) -> Option<u16> {
    read_u16(command, tags::MESSAGE_ID_BEING_RESPONDED_TO)
}

pub fn status_code(command: &InMemDicomObject) -> Option<u16> {
    read_u16(command, tags::STATUS)
}

/// Status of a response, treating a missing Status element as a failure
pub fn response_status(command: &InMemDicomObject) -> DimseStatus {
    status_code(command)
        .map(DimseStatus::from_code)
        .unwrap_or(DimseStatus::Failure(status::CANNOT_UNDERSTAND))
}

pub fn affected_sop_class_uid(command: &InMemDicomObject) -> Option<String> {
    read_str(command, tags::AFFECTED_SOP_CLASS_UID)
}

pub fn affected_sop_instance_uid(command: &InMemDicomObject) -> Option<String> {
    read_str(command, tags::AFFECTED_SOP_INSTANCE_UID)
}

pub fn error_comment(command: &InMemDicomObject) -> Option<String> {
    read_str(command, tags::ERROR_COMMENT)
}

/// Whether the command announces a data set
pub fn has_dataset(command: &InMemDicomObject) -> bool {
    read_u16(command, tags::COMMAND_DATA_SET_TYPE)
        .map(|t| t != NO_DATASET)
        .unwrap_or(false)
}

pub fn sub_operations(command: &InMemDicomObject) -> SubOperations {
    SubOperations {
        remaining: read_u16(command, tags::NUMBER_OF_REMAINING_SUBOPERATIONS).unwrap_or(0),
        completed: read_u16(command, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS).unwrap_or(0),
        failed: read_u16(command, tags::NUMBER_OF_FAILED_SUBOPERATIONS).unwrap_or(0),
        warning: read_u16(command, tags::NUMBER_OF_WARNING_SUBOPERATIONS).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_request_fields() {
        let rq = echo_rq(7);
        assert_eq!(command_field(&rq), Some(0x0030));
        assert_eq!(message_id(&rq), Some(7));
        assert_eq!(affected_sop_class_uid(&rq).as_deref(), Some(uids::VERIFICATION));
        assert!(!has_dataset(&rq));
    }

    #[test]
    fn test_store_response_echoes_uids() {
        let rsp = store_rsp(3, uids::CT_IMAGE_STORAGE, "1.2.3.4", status::OUT_OF_RESOURCES);
        assert_eq!(message_id_responded_to(&rsp), Some(3));
        assert_eq!(affected_sop_instance_uid(&rsp).as_deref(), Some("1.2.3.4"));
        assert_eq!(response_status(&rsp), DimseStatus::Failure(0xA700));
    }

    #[test]
    fn test_move_response_counters() {
        let counters = SubOperations {
            remaining: 2,
            completed: 6,
            failed: 1,
            warning: 1,
        };
        let rsp = move_rsp(1, uids::STUDY_ROOT_QR_MOVE, status::PENDING, counters);
        let parsed = sub_operations(&rsp);
        assert_eq!(parsed, counters);
        assert_eq!(parsed.progress(), Some(0.6));
        assert_eq!(SubOperations::default().progress(), None);
    }
}
