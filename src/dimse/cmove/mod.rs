use crate::dimse::{DicomMessage, ReadError, DATA_SET_EXISTS};
use crate::types::{Priority, QueryRetrieveLevel, AE, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;

pub mod movescu;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_MOVE_REQUEST: US = 0x0021;
pub const COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE: US = 0x8021;

/// C-MOVE-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.4.html>
pub struct CompositeMoveRequest {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	pub destination: AE,
}

impl CompositeMoveRequest {
	pub fn new(message_id: US, destination: AE) -> Self {
		Self {
			identifier: InMemDicomObject::new_empty(),
			priority: Priority::Medium as US,
			message_id,
			destination,
		}
	}

	pub fn identifier(mut self, identifier: InMemDicomObject) -> Self {
		self.identifier = identifier;
		self
	}

	/// Requests every instance of a single study.
	#[must_use]
	pub fn study(self, study_instance_uid: &str) -> Self {
		let mut identifier = InMemDicomObject::new_empty();
		identifier.put_str(
			tags::QUERY_RETRIEVE_LEVEL,
			VR::CS,
			QueryRetrieveLevel::Study.to_string(),
		);
		identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study_instance_uid);
		self.identifier(identifier)
	}
}

impl From<CompositeMoveRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeMoveRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination)),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// C-MOVE-RSP
/// The sub-operation counters are optional for all but the final response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeMoveResponse {
	pub status: US,
	pub remaining: Option<US>,
	pub completed: Option<US>,
	pub failed: Option<US>,
	pub warning: Option<US>,
}

impl TryFrom<DicomMessage> for CompositeMoveResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			status: message.status()?,
			remaining: message.command_int(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
			completed: message.command_int(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
			failed: message.command_int(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
			warning: message.command_int(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn move_request_names_destination_and_study() {
		let message = DicomMessage::from(CompositeMoveRequest::new(3, AE::from("DICOM-QR")).study("1.2.3.4"));

		assert_eq!(
			message.command_field().unwrap(),
			COMMAND_FIELD_COMPOSITE_MOVE_REQUEST
		);
		assert_eq!(
			message.command_str(tags::MOVE_DESTINATION).as_deref(),
			Some("DICOM-QR")
		);
		let identifier = message.data.unwrap();
		assert_eq!(
			identifier
				.get(tags::STUDY_INSTANCE_UID)
				.map(|e| e.to_str().unwrap().to_string())
				.as_deref(),
			Some("1.2.3.4")
		);
		assert_eq!(
			identifier
				.get(tags::QUERY_RETRIEVE_LEVEL)
				.map(|e| e.to_str().unwrap().to_string())
				.as_deref(),
			Some("STUDY")
		);
	}

	#[test]
	fn move_response_reads_counters() {
		let message = DicomMessage {
			command: InMemDicomObject::command_from_element_iter([
				DataElement::new(
					tags::COMMAND_FIELD,
					VR::US,
					dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE]),
				),
				DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0xB000])),
				DataElement::new(
					tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
					VR::US,
					dicom_value!(U16, [4]),
				),
				DataElement::new(tags::NUMBER_OF_FAILED_SUBOPERATIONS, VR::US, dicom_value!(U16, [1])),
			]),
			data: None,
			presentation_context_id: Some(1),
		};

		let response = CompositeMoveResponse::try_from(message).unwrap();
		assert_eq!(
			response,
			CompositeMoveResponse {
				status: 0xB000,
				remaining: None,
				completed: Some(4),
				failed: Some(1),
				warning: None,
			}
		);
	}
}
