use crate::cache::CacheError;
use crate::dimse::association::AssociationError;
use crate::dimse::cfind::findscu::FindError;
use crate::dimse::cmove::movescu::MoveError;
use crate::dimse::{ReadError, WriteError};
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Everything that can make a find or retrieve fail.
#[derive(Debug, Error)]
pub enum QueryRetrieveError {
	#[error("{0}")]
	MalformedInput(String),
	#[error("Failed to establish association with the archive: {0}")]
	Association(AssociationError),
	#[error("Message exchange with the archive failed: {0}")]
	Transport(String),
	#[error("Failed to start the store receiver on {address}: {source}")]
	Receiver {
		address: SocketAddr,
		source: std::io::Error,
	},
	#[error(transparent)]
	Cache(#[from] CacheError),
	#[error("Operation did not finish within {0:?}")]
	Timeout(Duration),
}

/// Machine readable category of a [`QueryRetrieveError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	MalformedInput,
	Association,
	Transport,
	Receiver,
	Storage,
	Timeout,
}

impl Display for ErrorKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let kind = match self {
			Self::MalformedInput => "malformed_input",
			Self::Association => "association",
			Self::Transport => "transport",
			Self::Receiver => "receiver",
			Self::Storage => "storage",
			Self::Timeout => "timeout",
		};
		f.write_str(kind)
	}
}

impl QueryRetrieveError {
	pub const fn kind(&self) -> ErrorKind {
		match self {
			Self::MalformedInput(_) => ErrorKind::MalformedInput,
			Self::Association(_) => ErrorKind::Association,
			Self::Transport(_) => ErrorKind::Transport,
			Self::Receiver { .. } => ErrorKind::Receiver,
			Self::Cache(_) => ErrorKind::Storage,
			Self::Timeout(_) => ErrorKind::Timeout,
		}
	}

	/// Additional context for callers, mirroring the `details` field of the JSON result.
	pub const fn details(&self) -> Option<&'static str> {
		match self {
			Self::Association(_) => Some("Association rejected or timeout"),
			Self::Transport(_) => Some("Exception during DICOM message exchange"),
			Self::Receiver { .. } => Some("The archive was not contacted"),
			_ => None,
		}
	}

	fn exchange(err: impl Display) -> Self {
		Self::Transport(err.to_string())
	}
}

impl From<ReadError> for QueryRetrieveError {
	fn from(err: ReadError) -> Self {
		Self::exchange(err)
	}
}

impl From<WriteError> for QueryRetrieveError {
	fn from(err: WriteError) -> Self {
		Self::exchange(err)
	}
}

impl From<FindError> for QueryRetrieveError {
	fn from(err: FindError) -> Self {
		match err {
			FindError::Association(err) => Self::Association(err),
			FindError::Read(err) => err.into(),
			FindError::Write(err) => err.into(),
		}
	}
}

impl From<MoveError> for QueryRetrieveError {
	fn from(err: MoveError) -> Self {
		match err {
			MoveError::Association(err) => Self::Association(err),
			MoveError::Read(err) => err.into(),
			MoveError::Write(err) => err.into(),
		}
	}
}
