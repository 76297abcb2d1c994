use crate::cache::CacheLayout;
use crate::dimse::cmove::movescu::{MoveServiceClassUser, MoveSummary};
use crate::dimse::cmove::CompositeMoveRequest;
use crate::dimse::cstore::storescp::{ReceiverHandle, StoreReceiverOptions, StoreServiceClassProvider};
use crate::dimse::next_message_id;
use crate::error::QueryRetrieveError;
use crate::service::{ArchiveEndpoint, Timeouts};
use crate::types::{trim_padding, AE};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Where the store receiver listens during a retrieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverSettings {
	pub interface: IpAddr,
	/// `0` picks an ephemeral port. The archive must then learn the port some other way,
	/// as a C-MOVE only names the destination AE title.
	pub port: u16,
	pub uncompressed: bool,
}

impl Default for ReceiverSettings {
	fn default() -> Self {
		Self {
			interface: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			port: 0,
			uncompressed: false,
		}
	}
}

/// How long to wait for late C-STORE-RQs after the final C-MOVE-RSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleSettings {
	/// Required time without store activity.
	pub quiet: Duration,
	/// Upper bound of the whole wait.
	pub max: Duration,
}

impl Default for SettleSettings {
	fn default() -> Self {
		Self {
			quiet: Duration::from_millis(250),
			max: Duration::from_secs(10),
		}
	}
}

/// Result of a retrieve. `file_count` is what is in the cache, `sub_operations` is what the archive claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalOutcome {
	pub success: bool,
	pub file_count: usize,
	pub cache_dir: PathBuf,
	pub study_instance_uid: String,
	pub sub_operations: MoveSummary,
}

/// Retrieves whole studies from one archive into the local cache.
pub struct RetrieveService {
	endpoint: ArchiveEndpoint,
	local_aet: AE,
	receiver: ReceiverSettings,
	timeouts: Timeouts,
	settle: SettleSettings,
}

impl RetrieveService {
	pub const fn new(
		endpoint: ArchiveEndpoint,
		local_aet: AE,
		receiver: ReceiverSettings,
		timeouts: Timeouts,
		settle: SettleSettings,
	) -> Self {
		Self {
			endpoint,
			local_aet,
			receiver,
			timeouts,
			settle,
		}
	}

	/// Starts the store receiver, asks the archive to move the study to it and counts what arrived
	/// in `<cache_root>/<study_instance_uid>`. The receiver is stopped before this returns, on every path.
	///
	/// A partial move still succeeds. Compare `file_count` with an independently known instance count
	/// if completeness matters.
	#[instrument(skip_all, fields(archive = %self.endpoint, study_instance_uid = %study_instance_uid))]
	pub async fn retrieve(
		&self,
		study_instance_uid: &str,
		cache_root: &Path,
	) -> Result<RetrievalOutcome, QueryRetrieveError> {
		self.endpoint.validate()?;
		let study_instance_uid = trim_padding(study_instance_uid);
		if study_instance_uid.is_empty() {
			return Err(QueryRetrieveError::MalformedInput(String::from(
				"Missing required parameter: study_instance_uid",
			)));
		}

		let cache = CacheLayout::new(cache_root);
		let cache_dir = cache
			.study_dir(study_instance_uid)
			.map_err(|err| QueryRetrieveError::MalformedInput(err.to_string()))?;
		cache.create_root()?;

		let address = SocketAddr::new(self.receiver.interface, self.receiver.port);
		let receiver = StoreServiceClassProvider::spawn(StoreReceiverOptions {
			aet: self.local_aet.clone(),
			address,
			uncompressed: self.receiver.uncompressed,
			cache: cache.clone(),
			timeout: self.timeouts.store,
		})
		.await
		.map_err(|source| QueryRetrieveError::Receiver { address, source })?;

		let result = self
			.move_study(study_instance_uid, &receiver, &cache)
			.await
			.map(|sub_operations| (sub_operations, cache.count_instances(study_instance_uid)));

		receiver.stop().await;

		let (sub_operations, file_count) = result?;
		let file_count = file_count?;
		info!(file_count, "Retrieved study");

		Ok(RetrievalOutcome {
			success: true,
			file_count,
			cache_dir,
			study_instance_uid: study_instance_uid.to_owned(),
			sub_operations,
		})
	}

	async fn move_study(
		&self,
		study_instance_uid: &str,
		receiver: &ReceiverHandle,
		cache: &CacheLayout,
	) -> Result<MoveSummary, QueryRetrieveError> {
		let movescu = MoveServiceClassUser::new(
			self.endpoint.manager(&self.local_aet, self.timeouts.connect),
			self.timeouts.dimse,
		);
		let request =
			CompositeMoveRequest::new(next_message_id(), self.local_aet.clone()).study(study_instance_uid);

		let summary = match self.timeouts.retrieve {
			Some(limit) => tokio::time::timeout(limit, movescu.invoke(request))
				.await
				.map_err(|_| QueryRetrieveError::Timeout(limit))??,
			None => movescu.invoke(request).await?,
		};

		// C-STORE sub-operations may still be running on other associations.
		if !receiver.settle(self.settle.quiet, self.settle.max).await {
			warn!(
				max = ?self.settle.max,
				"Receiver still busy, counting what has been written so far"
			);
		}

		let stored = receiver.stored();
		let failed = receiver.failed();
		if failed > 0 {
			warn!(stored, failed, cache_root = %cache.root().display(), "Some instances could not be stored");
		}
		if let Some(completed) = summary.archive_completed {
			if usize::from(completed) != stored {
				warn!(completed, stored, "Archive and receiver disagree on the number of instances");
			}
		}

		Ok(summary)
	}
}
