//! Content-addressed layout of retrieved instances:
//! `<cache_root>/<StudyInstanceUID>/<SOPInstanceUID>.dcm`

use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extension of cached instances.
pub const FILE_EXTENSION: &str = "dcm";

#[derive(Debug, Error)]
pub enum CacheError {
	#[error("Invalid {kind} '{value}' cannot be used as a cache path component")]
	InvalidIdentifier { kind: &'static str, value: String },
	#[error("Cache I/O failed for {path}: {source}")]
	Io {
		path: PathBuf,
		source: std::io::Error,
	},
}

/// Maps study and instance identifiers to paths below the cache root.
/// Owns no state apart from the root; directories are created on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
	root: PathBuf,
}

impl CacheLayout {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// `<cache_root>/<study>`
	pub fn study_dir(&self, study_instance_uid: &str) -> Result<PathBuf, CacheError> {
		validate("study instance UID", study_instance_uid)?;
		Ok(self.root.join(study_instance_uid))
	}

	/// `<cache_root>/<study>/<instance>.dcm`
	pub fn instance_path(
		&self,
		study_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Result<PathBuf, CacheError> {
		validate("SOP instance UID", sop_instance_uid)?;
		let mut path = self.study_dir(study_instance_uid)?;
		path.push(format!("{sop_instance_uid}.{FILE_EXTENSION}"));
		Ok(path)
	}

	/// Creates the cache root if it does not exist yet.
	pub fn create_root(&self) -> Result<(), CacheError> {
		std::fs::create_dir_all(&self.root).map_err(|source| CacheError::Io {
			path: self.root.clone(),
			source,
		})
	}

	/// Derives the path of an instance and creates its study directory.
	pub fn prepare_instance_path(
		&self,
		study_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Result<PathBuf, CacheError> {
		let path = self.instance_path(study_instance_uid, sop_instance_uid)?;
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).map_err(|source| CacheError::Io {
				path: parent.to_path_buf(),
				source,
			})?;
		}
		Ok(path)
	}

	/// Counts the cached instances of a study. A study without a directory has none.
	pub fn count_instances(&self, study_instance_uid: &str) -> Result<usize, CacheError> {
		let study_dir = self.study_dir(study_instance_uid)?;
		let entries = match std::fs::read_dir(&study_dir) {
			Ok(entries) => entries,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(source) => {
				return Err(CacheError::Io {
					path: study_dir,
					source,
				})
			}
		};

		let mut count = 0;
		for entry in entries {
			let entry = entry.map_err(|source| CacheError::Io {
				path: study_dir.clone(),
				source,
			})?;
			let path = entry.path();
			if path.is_file() && path.extension().is_some_and(|ext| ext == FILE_EXTENSION) {
				count += 1;
			}
		}
		Ok(count)
	}
}

/// Identifiers are used verbatim, but must stay a single path component.
fn validate(kind: &'static str, value: &str) -> Result<(), CacheError> {
	let invalid = value.is_empty()
		|| value == "."
		|| value == ".."
		|| value.contains(['/', '\\', '\0']);
	if invalid {
		return Err(CacheError::InvalidIdentifier {
			kind,
			value: value.to_owned(),
		});
	}
	Ok(())
}
