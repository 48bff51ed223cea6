//! Well-known SOP class and transfer syntax UIDs used during negotiation

use dicom_core::dictionary::UidDictionary;
use dicom_dictionary_std::StandardSopClassDictionary;

pub use dicom_dictionary_std::uids::{
    CT_IMAGE_STORAGE, EXPLICIT_VR_BIG_ENDIAN, EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN,
    MR_IMAGE_STORAGE, SECONDARY_CAPTURE_IMAGE_STORAGE, ULTRASOUND_IMAGE_STORAGE, VERIFICATION,
};
pub use dicom_dictionary_std::uids::{
    COMPUTED_RADIOGRAPHY_IMAGE_STORAGE as CR_IMAGE_STORAGE,
    STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND as STUDY_ROOT_QR_FIND,
    STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET as STUDY_ROOT_QR_GET,
    STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE as STUDY_ROOT_QR_MOVE,
    X_RAY_ANGIOGRAPHIC_IMAGE_STORAGE as XA_IMAGE_STORAGE,
};

/// Root of the Storage Service Class SOP classes (PS3.4 Annex B)
const STORAGE_SOP_CLASS_ROOT: &str = "1.2.840.10008.5.1.4.1.1.";

/// Transfer syntaxes in preference order, used by both roles.
pub const TRANSFER_SYNTAX_PREFERENCE: &[&str] = &[
    IMPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_BIG_ENDIAN,
];

/// Storage classes proposed by default when acting as an SCU.
pub const COMMON_STORAGE_SOP_CLASSES: &[&str] = &[
    CT_IMAGE_STORAGE,
    MR_IMAGE_STORAGE,
    ULTRASOUND_IMAGE_STORAGE,
    SECONDARY_CAPTURE_IMAGE_STORAGE,
    XA_IMAGE_STORAGE,
    CR_IMAGE_STORAGE,
];

/// Whether `uid` names a standard storage SOP class.
///
/// Query/retrieve models that share the storage root (protocol approval,
/// inventory) are not storage classes and are left out.
pub fn is_storage_sop_class(uid: &str) -> bool {
    let uid = trim_uid(uid);
    uid.starts_with(STORAGE_SOP_CLASS_ROOT)
        && StandardSopClassDictionary
            .by_uid(uid)
            .map(|entry| entry.name.contains("Storage"))
            .unwrap_or(false)
}

/// Trim the padding that UI values carry on the wire.
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(['\0', ' '])
}
