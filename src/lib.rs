//! DICOM Query/Retrieve client.
//!
//! Studies are searched on a remote archive with C-FIND and retrieved with C-MOVE. During a
//! retrieve a short-lived store service class provider receives the pushed instances and writes
//! them to `<cache_root>/<StudyInstanceUID>/<SOPInstanceUID>.dcm`.

pub mod api;
pub mod cache;
pub mod config;
pub mod dimse;
pub mod error;
pub mod query;
pub mod service;
pub mod types;

/// The implementation class UID for DICOM-QR.
/// The UID is a randomly generated UUID represented as a single integer value under the 2.25 root.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.203970391815244817417092451893946325177";

/// The implementation version name for DICOM-QR.
/// It consists of the string "DICOM-QR" followed by the crate version.
pub const IMPLEMENTATION_VERSION_NAME: &str = concat!("DICOM-QR ", env!("CARGO_PKG_VERSION"));
