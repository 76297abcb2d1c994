use crate::dimse::association;
use crate::dimse::cfind::{CompositeFindRequest, CompositeFindResponse};
use crate::dimse::{DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError};
use crate::types::{Priority, UI, US};
use association::manager::{AssociationManager, PresentationParameter};
use association::AssociationError;
use async_stream::try_stream;
use dicom::dictionary_std::uids;
use dicom::object::InMemDicomObject;
use futures::Stream;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

pub struct FindServiceClassUser {
	manager: AssociationManager,
	timeout: Duration,
}

pub struct FindServiceClassUserOptions {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: Priority,
}

impl From<FindServiceClassUserOptions> for CompositeFindRequest {
	fn from(options: FindServiceClassUserOptions) -> Self {
		Self {
			identifier: options.identifier,
			message_id: options.message_id,
			priority: options.priority as US,
			affected_sop_class_uid: UI::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
		}
	}
}

impl FindServiceClassUser {
	pub const fn new(manager: AssociationManager, timeout: Duration) -> Self {
		Self { manager, timeout }
	}

	/// Sends a study root C-FIND-RQ and yields the identifier of every pending response.
	/// The stream ends with the first non-pending status, after which the association is released.
	pub fn invoke(
		&self,
		options: FindServiceClassUserOptions,
	) -> impl Stream<Item = Result<InMemDicomObject, FindError>> + '_ {
		let presentation = PresentationParameter {
			abstract_syntax_uid: UI::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
			transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		};

		try_stream! {
			let association = self
				.manager
				.create(&presentation)
				.await
				.map_err(FindError::Association)?;
			let request = CompositeFindRequest::from(options);
			association.write_message(request, None, self.timeout).await?;
			trace!("Sent C-FIND-RQ");

			loop {
				let response = association.read_message(self.timeout).await?;
				let response = CompositeFindResponse::try_from(response)?;
				trace!("Received C-FIND-RSP");

				let status_type = StatusType::classify(response.status);
				if status_type != StatusType::Pending {
					debug!(status = response.status, "C-FIND finished with {status_type:?}");
					break;
				}

				if let Some(data) = response.data {
					yield data;
				}
			}

			if let Err(err) = association.release(self.timeout).await {
				warn!("Failed to release association after C-FIND: {err}");
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(AssociationError),
}
