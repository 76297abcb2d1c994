//! One-shot find and retrieve operations against a single archive.
//! Every call opens its own association and releases it before returning.

mod find;
mod retrieve;

pub use find::FindService;
pub use retrieve::{ReceiverSettings, RetrievalOutcome, RetrieveService, SettleSettings};

use crate::dimse::association::manager::AssociationManager;
use crate::error::QueryRetrieveError;
use crate::types::AE;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Network address and AE title of the remote archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEndpoint {
	pub host: String,
	pub port: u16,
	pub aet: AE,
}

impl Display for ArchiveEndpoint {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}@{}:{}", self.aet, self.host, self.port)
	}
}

impl ArchiveEndpoint {
	/// Rejects endpoints that cannot be contacted, before any network activity.
	pub fn validate(&self) -> Result<(), QueryRetrieveError> {
		let mut missing = Vec::new();
		if self.host.trim().is_empty() {
			missing.push("pacs_ip");
		}
		if self.port == 0 {
			missing.push("pacs_port");
		}
		if self.aet.trim().is_empty() {
			missing.push("pacs_ae_title");
		}

		if missing.is_empty() {
			Ok(())
		} else {
			Err(QueryRetrieveError::MalformedInput(format!(
				"Missing required parameters: {}",
				missing.join(", ")
			)))
		}
	}

	fn manager(&self, calling_aet: &str, connect_timeout: Duration) -> AssociationManager {
		AssociationManager {
			host: self.host.clone(),
			port: self.port,
			calling_aet: AE::from(calling_aet),
			called_aet: self.aet.clone(),
			connect_timeout,
		}
	}
}

/// Upper bounds for the individual steps of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
	/// Resolving the archive and negotiating the association.
	pub connect: Duration,
	/// Sending or receiving a single DIMSE message.
	pub dimse: Duration,
	/// Answering a single C-STORE-RQ on the receiver side.
	pub store: Duration,
	/// The whole C-MOVE exchange, including the association. `None` waits as long as the archive keeps responding.
	pub retrieve: Option<Duration>,
}

impl Default for Timeouts {
	fn default() -> Self {
		Self {
			connect: Duration::from_secs(10),
			dimse: Duration::from_secs(30),
			store: Duration::from_secs(10),
			retrieve: None,
		}
	}
}
