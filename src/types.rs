use dicom::core::PrimitiveValue;
use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone, Default)]
pub enum Priority {
	Low = 0x0002,
	#[default]
	Medium = 0x0000,
	High = 0x0001,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryRetrieveLevel {
	Patient,
	Study,
	Series,
	Image,
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Patient => write!(f, "PATIENT"),
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Image => write!(f, "IMAGE"),
		}
	}
}

impl From<QueryRetrieveLevel> for PrimitiveValue {
	fn from(level: QueryRetrieveLevel) -> Self {
		Self::Str(level.to_string())
	}
}

/// Strips the padding DICOM allows at the end of UI and AE values.
pub fn trim_padding(value: &str) -> &str {
	value.trim_end_matches(['\0', ' ']).trim_start()
}
