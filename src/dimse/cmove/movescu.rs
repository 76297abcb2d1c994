use crate::dimse::association;
use crate::dimse::cmove::{CompositeMoveRequest, CompositeMoveResponse};
use crate::dimse::{DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError};
use crate::types::{UI, US};
use association::manager::{AssociationManager, PresentationParameter};
use association::AssociationError;
use dicom::dictionary_std::uids;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, trace, warn};

pub struct MoveServiceClassUser {
	manager: AssociationManager,
	timeout: Duration,
}

/// Sub-operation bookkeeping of a C-MOVE.
///
/// These numbers describe what the archive reported on the DIMSE level. They are advisory:
/// the instances that actually arrived are counted by the store service class provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MoveSummary {
	/// Terminal responses with a success status.
	pub succeeded: usize,
	/// Terminal responses with any other status.
	pub failed: usize,
	/// Number of Completed Sub-operations (0000,1021) of the final response.
	pub archive_completed: Option<US>,
	/// Number of Failed Sub-operations (0000,1022) of the final response.
	pub archive_failed: Option<US>,
	/// Number of Warning Sub-operations (0000,1023) of the final response.
	pub archive_warning: Option<US>,
	/// Status of the final response.
	pub final_status: Option<US>,
}

impl MoveSummary {
	/// Records a C-MOVE-RSP and returns whether further responses are expected.
	pub fn record(&mut self, response: &CompositeMoveResponse) -> bool {
		match StatusType::classify(response.status) {
			StatusType::Pending => {
				trace!(
					remaining = response.remaining,
					completed = response.completed,
					"C-MOVE is pending"
				);
				return true;
			}
			StatusType::Success => self.succeeded += 1,
			StatusType::Warning | StatusType::Failure | StatusType::Cancel => self.failed += 1,
		}

		self.archive_completed = response.completed;
		self.archive_failed = response.failed;
		self.archive_warning = response.warning;
		self.final_status = Some(response.status);
		false
	}
}

impl MoveServiceClassUser {
	pub const fn new(manager: AssociationManager, timeout: Duration) -> Self {
		Self { manager, timeout }
	}

	/// Sends the C-MOVE-RQ and consumes the responses until the archive reports a final status.
	/// A final failure status is not an error here, the caller decides based on what was received.
	#[instrument(skip_all, name = "MOVE-SCU")]
	pub async fn invoke(&self, request: CompositeMoveRequest) -> Result<MoveSummary, MoveError> {
		let association = self
			.manager
			.create(&PresentationParameter {
				abstract_syntax_uid: UI::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
				transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
			})
			.await
			.map_err(MoveError::Association)?;

		association.write_message(request, None, self.timeout).await?;
		trace!("Sent C-MOVE-RQ");

		let mut summary = MoveSummary::default();
		loop {
			let response = association.read_message(self.timeout).await?;
			let response = CompositeMoveResponse::try_from(response)?;
			trace!("Received C-MOVE-RSP");

			if !summary.record(&response) {
				break;
			}
		}

		if summary.failed > 0 {
			warn!(
				status = summary.final_status,
				failed = summary.archive_failed,
				"C-MOVE finished with failed sub-operations"
			);
		} else {
			info!(
				completed = summary.archive_completed,
				"C-MOVE completed successfully"
			);
		}

		if let Err(err) = association.release(self.timeout).await {
			warn!("Failed to release association after C-MOVE: {err}");
		}

		Ok(summary)
	}
}

#[derive(Debug, Error)]
pub enum MoveError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(AssociationError),
}
