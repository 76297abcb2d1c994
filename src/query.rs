//! Translation of human-facing search filters into a study level C-FIND identifier,
//! and of the matching identifiers back into flat study records.

use crate::types::{trim_padding, QueryRetrieveLevel};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use serde::{Deserialize, Serialize};

/// Modality filter value that matches every modality.
pub const ALL_MODALITIES: &str = "ALL";

/// Attributes requested for every study, together with their value representation.
const RETURN_KEYS: [(Tag, VR); 13] = [
	(tags::STUDY_INSTANCE_UID, VR::UI),
	(tags::STUDY_ID, VR::SH),
	(tags::STUDY_DATE, VR::DA),
	(tags::STUDY_TIME, VR::TM),
	(tags::STUDY_DESCRIPTION, VR::LO),
	(tags::ACCESSION_NUMBER, VR::SH),
	(tags::PATIENT_NAME, VR::PN),
	(tags::PATIENT_ID, VR::LO),
	(tags::PATIENT_BIRTH_DATE, VR::DA),
	(tags::PATIENT_SEX, VR::CS),
	(tags::MODALITIES_IN_STUDY, VR::CS),
	(tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS),
	(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS),
];

/// Optional search criteria. An absent or empty field matches any value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryFilter {
	/// Substring of the patient name.
	pub patient_name: Option<String>,
	/// Substring of the patient ID.
	pub patient_id: Option<String>,
	/// Exact modality, or [`ALL_MODALITIES`].
	pub modality: Option<String>,
	/// `YYYY-MM-DD` or `YYYYMMDD`. Ranges like `2024-01-01-2024-01-31` are not supported.
	pub study_date: Option<String>,
	/// Substring of the accession number.
	pub accession_number: Option<String>,
}

impl QueryFilter {
	/// Builds the C-FIND identifier. Every return key is present, unfiltered keys with an empty value.
	pub fn to_identifier(&self) -> InMemDicomObject {
		let mut identifier = InMemDicomObject::from_element_iter(
			RETURN_KEYS
				.iter()
				.map(|(tag, vr)| DataElement::new(*tag, *vr, PrimitiveValue::Empty)),
		);
		identifier.put(DataElement::new(
			tags::QUERY_RETRIEVE_LEVEL,
			VR::CS,
			PrimitiveValue::from(QueryRetrieveLevel::Study),
		));

		if let Some(patient_name) = non_empty(self.patient_name.as_deref()) {
			identifier.put_str(tags::PATIENT_NAME, VR::PN, substring(patient_name));
		}
		if let Some(patient_id) = non_empty(self.patient_id.as_deref()) {
			identifier.put_str(tags::PATIENT_ID, VR::LO, substring(patient_id));
		}
		if let Some(modality) = non_empty(self.modality.as_deref()) {
			if modality != ALL_MODALITIES {
				identifier.put_str(tags::MODALITIES_IN_STUDY, VR::CS, modality);
			}
		}
		if let Some(study_date) = non_empty(self.study_date.as_deref()) {
			identifier.put_str(tags::STUDY_DATE, VR::DA, normalize_date(study_date));
		}
		if let Some(accession_number) = non_empty(self.accession_number.as_deref()) {
			identifier.put_str(tags::ACCESSION_NUMBER, VR::SH, substring(accession_number));
		}

		identifier
	}
}

fn non_empty(value: Option<&str>) -> Option<&str> {
	value.filter(|value| !value.is_empty())
}

fn substring(value: &str) -> String {
	format!("*{value}*")
}

/// `2024-03-15` becomes `20240315`. Anything else is passed on with separators removed.
fn normalize_date(value: &str) -> String {
	value
		.chars()
		.filter(|c| *c != '-' && !c.is_whitespace())
		.collect()
}

/// One matching study as reported by the archive.
/// Attributes missing from the response are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyRecord {
	pub study_instance_uid: String,
	pub study_id: String,
	pub study_date: String,
	pub study_time: String,
	pub study_description: String,
	pub accession_number: String,
	pub patient_name: String,
	pub patient_id: String,
	pub patient_birth_date: String,
	pub patient_sex: String,
	/// Modalities in Study (0008,0061), multiple values separated by `\`.
	pub modality: String,
	pub number_of_series: String,
	pub number_of_instances: String,
}

impl From<&InMemDicomObject> for StudyRecord {
	fn from(identifier: &InMemDicomObject) -> Self {
		let get = |tag: Tag| -> String {
			identifier
				.get(tag)
				.map(InMemElement::to_str)
				.and_then(Result::ok)
				.map(|value| trim_padding(&value).to_owned())
				.unwrap_or_default()
		};

		Self {
			study_instance_uid: get(tags::STUDY_INSTANCE_UID),
			study_id: get(tags::STUDY_ID),
			study_date: get(tags::STUDY_DATE),
			study_time: get(tags::STUDY_TIME),
			study_description: get(tags::STUDY_DESCRIPTION),
			accession_number: get(tags::ACCESSION_NUMBER),
			patient_name: get(tags::PATIENT_NAME),
			patient_id: get(tags::PATIENT_ID),
			patient_birth_date: get(tags::PATIENT_BIRTH_DATE),
			patient_sex: get(tags::PATIENT_SEX),
			modality: get(tags::MODALITIES_IN_STUDY),
			number_of_series: get(tags::NUMBER_OF_STUDY_RELATED_SERIES),
			number_of_instances: get(tags::NUMBER_OF_STUDY_RELATED_INSTANCES),
		}
	}
}
