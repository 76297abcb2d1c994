use crate::dimse::cfind::findscu::{FindServiceClassUser, FindServiceClassUserOptions};
use crate::dimse::next_message_id;
use crate::error::QueryRetrieveError;
use crate::query::{QueryFilter, StudyRecord};
use crate::service::{ArchiveEndpoint, Timeouts};
use crate::types::{Priority, AE};
use futures::TryStreamExt;
use tracing::{info, instrument};

/// Searches studies on one archive.
pub struct FindService {
	endpoint: ArchiveEndpoint,
	local_aet: AE,
	timeouts: Timeouts,
}

impl FindService {
	pub const fn new(endpoint: ArchiveEndpoint, local_aet: AE, timeouts: Timeouts) -> Self {
		Self {
			endpoint,
			local_aet,
			timeouts,
		}
	}

	/// Returns one record per pending C-FIND-RSP, in the order the archive sent them.
	/// No matching study is an empty list, not an error.
	#[instrument(skip_all, fields(archive = %self.endpoint))]
	pub async fn find(&self, filter: &QueryFilter) -> Result<Vec<StudyRecord>, QueryRetrieveError> {
		self.endpoint.validate()?;

		let findscu = FindServiceClassUser::new(
			self.endpoint.manager(&self.local_aet, self.timeouts.connect),
			self.timeouts.dimse,
		);
		let options = FindServiceClassUserOptions {
			identifier: filter.to_identifier(),
			message_id: next_message_id(),
			priority: Priority::Medium,
		};

		let studies: Vec<StudyRecord> = findscu
			.invoke(options)
			.map_ok(|identifier| StudyRecord::from(&identifier))
			.try_collect()
			.await?;

		info!(count = studies.len(), "Found matching studies");
		Ok(studies)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::ErrorKind;

	#[tokio::test]
	async fn malformed_endpoint_is_rejected() {
		let service = FindService::new(
			ArchiveEndpoint {
				host: String::from("127.0.0.1"),
				port: 4242,
				aet: AE::new(),
			},
			AE::from("DICOM-QR"),
			Timeouts::default(),
		);

		let err = service.find(&QueryFilter::default()).await.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::MalformedInput);
	}
}
