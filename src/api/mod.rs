//! JSON documents exchanged with the caller of the command line interface.
//! A request is a single JSON object, the result is printed as a single JSON object.

use crate::config::AppConfig;
use crate::error::{ErrorKind, QueryRetrieveError};
use crate::query::{QueryFilter, StudyRecord};
use crate::service::{ArchiveEndpoint, FindService, RetrieveService};
use crate::types::AE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

pub const USAGE: &str = "Usage: dicom-qr <find|move> '<json_params>'";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
	Find,
	Move,
}

impl FromStr for Operation {
	type Err = QueryRetrieveError;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value {
			"find" => Ok(Self::Find),
			"move" => Ok(Self::Move),
			_ => Err(QueryRetrieveError::MalformedInput(format!(
				"Unknown operation '{value}'. {USAGE}"
			))),
		}
	}
}

/// Ports are accepted as JSON number or as string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Port {
	Number(u64),
	Text(String),
}

impl Port {
	fn get(&self) -> Option<u16> {
		match self {
			Self::Number(port) => u16::try_from(*port).ok(),
			Self::Text(port) => port.trim().parse().ok(),
		}
	}
}

/// Addressing shared by all requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveParameters {
	pacs_ip: Option<String>,
	pacs_port: Option<Port>,
	pacs_ae_title: Option<String>,
	local_ae_title: Option<String>,
}

impl ArchiveParameters {
	/// Fails with the list of missing parameters.
	pub fn endpoint(&self) -> Result<ArchiveEndpoint, QueryRetrieveError> {
		let endpoint = ArchiveEndpoint {
			host: self.pacs_ip.clone().unwrap_or_default(),
			port: self.pacs_port.as_ref().and_then(Port::get).unwrap_or(0),
			aet: self.pacs_ae_title.clone().unwrap_or_default(),
		};
		endpoint.validate()?;
		Ok(endpoint)
	}

	pub fn local_aet(&self, default: &str) -> AE {
		self.local_ae_title
			.as_deref()
			.map(str::trim)
			.filter(|aet| !aet.is_empty())
			.unwrap_or(default)
			.to_owned()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct FindRequest {
	#[serde(flatten)]
	pub archive: ArchiveParameters,
	pub filters: Option<QueryFilter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoveRequest {
	#[serde(flatten)]
	pub archive: ArchiveParameters,
	pub study_instance_uid: Option<String>,
	pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct FindResponse {
	pub success: bool,
	pub count: usize,
	pub studies: Vec<StudyRecord>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
	pub success: bool,
	pub error: String,
	pub error_kind: ErrorKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<&'static str>,
}

impl From<&QueryRetrieveError> for ErrorResponse {
	fn from(err: &QueryRetrieveError) -> Self {
		Self {
			success: false,
			error: err.to_string(),
			error_kind: err.kind(),
			details: err.details(),
		}
	}
}

fn parse<T: DeserializeOwned>(input: &str) -> Result<T, QueryRetrieveError> {
	serde_json::from_str(input)
		.map_err(|err| QueryRetrieveError::MalformedInput(format!("Invalid JSON input: {err}")))
}

fn to_json(value: impl Serialize) -> Value {
	serde_json::to_value(value).unwrap_or_else(|err| {
		serde_json::json!({ "success": false, "error": format!("Failed to serialize result: {err}") })
	})
}

/// Parses and validates the request, then runs the operation.
/// Malformed input is rejected before any network activity.
pub async fn execute(
	config: &AppConfig,
	operation: Operation,
	input: &str,
) -> Result<Value, QueryRetrieveError> {
	match operation {
		Operation::Find => {
			let request: FindRequest = parse(input)?;
			let endpoint = request.archive.endpoint()?;
			let service = FindService::new(
				endpoint,
				request.archive.local_aet(&config.local.aet),
				(&config.timeouts).into(),
			);

			let studies = service
				.find(&request.filters.unwrap_or_default())
				.await?;
			Ok(to_json(FindResponse {
				success: true,
				count: studies.len(),
				studies,
			}))
		}
		Operation::Move => {
			let request: MoveRequest = parse(input)?;
			let endpoint = request.archive.endpoint()?;
			let study_instance_uid = request
				.study_instance_uid
				.as_deref()
				.map(str::trim)
				.filter(|uid| !uid.is_empty())
				.ok_or_else(|| {
					QueryRetrieveError::MalformedInput(String::from(
						"Missing required parameter: study_instance_uid",
					))
				})?;
			let cache_root = request
				.cache_dir
				.clone()
				.unwrap_or_else(|| config.cache.root.clone());
			info!(cache_root = %cache_root.display(), "Retrieving study");

			let service = RetrieveService::new(
				endpoint,
				request.archive.local_aet(&config.local.aet),
				(&config.receiver).into(),
				(&config.timeouts).into(),
				(&config.settle).into(),
			);
			let outcome = service.retrieve(study_instance_uid, &cache_root).await?;
			Ok(to_json(outcome))
		}
	}
}

/// The JSON printed for a failed operation.
pub fn error_json(err: &QueryRetrieveError) -> Value {
	to_json(ErrorResponse::from(err))
}
