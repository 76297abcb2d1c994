use super::client::{ClientAssociation, ClientAssociationOptions};
use super::AssociationError;
use crate::types::{AE, UI};
use std::time::Duration;
use tracing::{info, warn};

/// The abstract syntax and acceptable transfer syntaxes of the single presentation context
/// that is proposed for an outbound association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationParameter {
	pub abstract_syntax_uid: UI,
	pub transfer_syntax_uids: Vec<UI>,
}

/// Creates client associations towards one remote application entity.
#[derive(Debug, Clone)]
pub struct AssociationManager {
	pub host: String,
	pub port: u16,
	pub calling_aet: AE,
	pub called_aet: AE,
	pub connect_timeout: Duration,
}

impl AssociationManager {
	pub async fn create(
		&self,
		param: &PresentationParameter,
	) -> Result<ClientAssociation, AssociationError> {
		let address = tokio::net::lookup_host((self.host.as_str(), self.port))
			.await
			.and_then(|mut addresses| {
				addresses.next().ok_or_else(|| {
					std::io::Error::new(std::io::ErrorKind::NotFound, "no address found")
				})
			})
			.map_err(|source| AssociationError::Resolve {
				address: format!("{}:{}", self.host, self.port),
				source,
			})?;

		let options = ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.called_aet.clone(),
			abstract_syntax: param.abstract_syntax_uid.clone(),
			transfer_syntaxes: param.transfer_syntax_uids.clone(),
			address,
		};

		let association = tokio::time::timeout(self.connect_timeout, ClientAssociation::new(options))
			.await
			.map_err(|_| AssociationError::ConnectTimeout(self.connect_timeout))
			.and_then(|result| result);

		match &association {
			Ok(association) => info!(
				association_id = association.uuid().to_string(),
				called_aet = self.called_aet,
				%address,
				"Created new client association"
			),
			Err(err) => warn!(
				called_aet = self.called_aet,
				%address,
				"Failed to create new client association: {err}"
			),
		}

		association
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::dictionary_std::uids;

	#[tokio::test]
	async fn refused_connection_is_an_association_error() {
		// Bind and drop to obtain a local port that is (very likely) closed.
		let port = std::net::TcpListener::bind("127.0.0.1:0")
			.and_then(|listener| listener.local_addr())
			.map(|address| address.port())
			.unwrap();

		let manager = AssociationManager {
			host: String::from("127.0.0.1"),
			port,
			calling_aet: AE::from("DICOM-QR"),
			called_aet: AE::from("ARCHIVE"),
			connect_timeout: Duration::from_secs(5),
		};
		let result = manager
			.create(&PresentationParameter {
				abstract_syntax_uid: UI::from(uids::VERIFICATION),
				transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
			})
			.await;

		assert!(matches!(result, Err(AssociationError::Association(_))));
	}

	#[tokio::test]
	async fn unresolvable_host_is_reported() {
		let manager = AssociationManager {
			host: String::from("host.invalid"),
			port: 104,
			calling_aet: AE::from("DICOM-QR"),
			called_aet: AE::from("ARCHIVE"),
			connect_timeout: Duration::from_secs(5),
		};
		let result = manager
			.create(&PresentationParameter {
				abstract_syntax_uid: UI::from(uids::VERIFICATION),
				transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
			})
			.await;

		assert!(matches!(result, Err(AssociationError::Resolve { .. })));
	}
}
