//! C-FIND identifiers and the records built from the matches

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};

/// Study search predicates. Empty strings are return keys (match anything).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(default)]
    pub patient_name: String,
    #[serde(default)]
    pub patient_id: String,
    /// Single date or `YYYYMMDD-YYYYMMDD` range
    #[serde(default)]
    pub study_date: String,
    #[serde(default)]
    pub modality: String,
    #[serde(default)]
    pub accession_number: String,
    #[serde(default)]
    pub study_description: String,
    #[serde(default)]
    pub study_instance_uid: String,
    /// Matches kept client-side; 0 keeps everything
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStudyInfo {
    pub study_instance_uid: String,
    pub patient_name: String,
    pub patient_id: String,
    pub patient_birth_date: String,
    pub patient_sex: String,
    pub study_date: String,
    pub study_time: String,
    pub study_description: String,
    pub accession_number: String,
    pub modalities_in_study: String,
    pub referring_physician: String,
    pub number_of_series: Option<u32>,
    pub number_of_instances: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSeriesInfo {
    pub series_instance_uid: String,
    pub study_instance_uid: String,
    pub series_number: Option<u32>,
    pub modality: String,
    pub series_description: String,
    pub body_part_examined: String,
    pub number_of_instances: Option<u32>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            patient_name: String::new(),
            patient_id: String::new(),
            study_date: String::new(),
            modality: String::new(),
            accession_number: String::new(),
            study_description: String::new(),
            study_instance_uid: String::new(),
            max_results: default_max_results(),
        }
    }
}

fn default_max_results() -> usize {
    100
}

fn key(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    let value = if value.is_empty() {
        PrimitiveValue::Empty
    } else {
        PrimitiveValue::from(value)
    };
    obj.put(DataElement::new(tag, vr, value));
}

fn text(obj: &InMemDicomObject, tag: Tag) -> String {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).trim().to_string())
        .unwrap_or_default()
}

fn number(obj: &InMemDicomObject, tag: Tag) -> Option<u32> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u32>().ok())
}

impl QueryFilter {
    pub fn with_patient_name(mut self, name: impl Into<String>) -> Self {
        self.patient_name = name.into();
        self
    }

    pub fn with_patient_id(mut self, id: impl Into<String>) -> Self {
        self.patient_id = id.into();
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    /// STUDY level identifier carrying every filter field and return key
    pub fn to_study_identifier(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        key(&mut obj, tags::QUERY_RETRIEVE_LEVEL, VR::CS, "STUDY");
        key(&mut obj, tags::PATIENT_NAME, VR::PN, &self.patient_name);
        key(&mut obj, tags::PATIENT_ID, VR::LO, &self.patient_id);
        key(&mut obj, tags::PATIENT_BIRTH_DATE, VR::DA, "");
        key(&mut obj, tags::PATIENT_SEX, VR::CS, "");
        key(&mut obj, tags::STUDY_DATE, VR::DA, &self.study_date);
        key(&mut obj, tags::STUDY_TIME, VR::TM, "");
        key(&mut obj, tags::ACCESSION_NUMBER, VR::SH, &self.accession_number);
        key(&mut obj, tags::STUDY_DESCRIPTION, VR::LO, &self.study_description);
        key(&mut obj, tags::MODALITIES_IN_STUDY, VR::CS, &self.modality);
        key(&mut obj, tags::REFERRING_PHYSICIAN_NAME, VR::PN, "");
        key(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, &self.study_instance_uid);
        key(&mut obj, tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS, "");
        key(&mut obj, tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS, "");
        obj
    }
}

/// SERIES level identifier for all series of one study
pub fn series_identifier(study_instance_uid: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    key(&mut obj, tags::QUERY_RETRIEVE_LEVEL, VR::CS, "SERIES");
    key(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, study_instance_uid);
    key(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, "");
    key(&mut obj, tags::SERIES_NUMBER, VR::IS, "");
    key(&mut obj, tags::MODALITY, VR::CS, "");
    key(&mut obj, tags::SERIES_DESCRIPTION, VR::LO, "");
    key(&mut obj, tags::BODY_PART_EXAMINED, VR::CS, "");
    key(&mut obj, tags::NUMBER_OF_SERIES_RELATED_INSTANCES, VR::IS, "");
    obj
}

/// C-MOVE identifier: the level plus the unique keys down to it
pub fn move_identifier(
    study_instance_uid: &str,
    series_instance_uid: Option<&str>,
) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    let level = if series_instance_uid.is_some() { "SERIES" } else { "STUDY" };
    key(&mut obj, tags::QUERY_RETRIEVE_LEVEL, VR::CS, level);
    key(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, study_instance_uid);
    if let Some(series) = series_instance_uid {
        key(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, series);
    }
    obj
}

impl RemoteStudyInfo {
    pub fn from_identifier(obj: &InMemDicomObject) -> Self {
        Self {
            study_instance_uid: text(obj, tags::STUDY_INSTANCE_UID),
            patient_name: text(obj, tags::PATIENT_NAME),
            patient_id: text(obj, tags::PATIENT_ID),
            patient_birth_date: text(obj, tags::PATIENT_BIRTH_DATE),
            patient_sex: text(obj, tags::PATIENT_SEX),
            study_date: text(obj, tags::STUDY_DATE),
            study_time: text(obj, tags::STUDY_TIME),
            study_description: text(obj, tags::STUDY_DESCRIPTION),
            accession_number: text(obj, tags::ACCESSION_NUMBER),
            modalities_in_study: text(obj, tags::MODALITIES_IN_STUDY),
            referring_physician: text(obj, tags::REFERRING_PHYSICIAN_NAME),
            number_of_series: number(obj, tags::NUMBER_OF_STUDY_RELATED_SERIES),
            number_of_instances: number(obj, tags::NUMBER_OF_STUDY_RELATED_INSTANCES),
        }
    }
}

impl RemoteSeriesInfo {
    pub fn from_identifier(obj: &InMemDicomObject) -> Self {
        Self {
            series_instance_uid: text(obj, tags::SERIES_INSTANCE_UID),
            study_instance_uid: text(obj, tags::STUDY_INSTANCE_UID),
            series_number: number(obj, tags::SERIES_NUMBER),
            modality: text(obj, tags::MODALITY),
            series_description: text(obj, tags::SERIES_DESCRIPTION),
            body_part_examined: text(obj, tags::BODY_PART_EXAMINED),
            number_of_instances: number(obj, tags::NUMBER_OF_SERIES_RELATED_INSTANCES),
        }
    }
}
