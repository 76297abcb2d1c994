use dicom::ul::pdu::{PDataValue, PDataValueType, PresentationContextNegotiated};
use dicom::ul::Pdu;
use std::convert::identity;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use super::{AskPattern, Association, AssociationError, ChannelError, Command};

/// Item length, presentation context ID and message control header of a PDV item.
const PDV_HEADER_LENGTH: usize = 6;

pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextNegotiated>,
}

pub struct ClientAssociationOptions {
	pub calling_aet: String,
	pub called_aet: String,
	pub abstract_syntax: String,
	pub transfer_syntaxes: Vec<String>,
	pub address: SocketAddr,
}

impl ClientAssociation {
	/// Data sets that exceed the acceptor's maximum PDU length must be split into several PDUs.
	fn needs_chunking(data: &[PDataValue], acceptor_max_pdu_length: u32) -> bool {
		let is_data = data
			.iter()
			.all(|pdv| pdv.value_type == PDataValueType::Data);
		let data_length: usize = data
			.iter()
			.map(|pdv| pdv.data.len() + PDV_HEADER_LENGTH)
			.sum();
		is_data && data_length > acceptor_max_pdu_length as usize
	}

	pub async fn new(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let address = options.address;
		let thread_name = format!("{}-client", options.calling_aet);
		let options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet)
			.with_presentation_context(options.abstract_syntax, options.transfer_syntaxes);

		let _handle = thread::Builder::new()
			.name(thread_name)
			.spawn(move || {
				let span = tracing::info_span!("ClientAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match options.establish(address) {
					Ok(mut association) => {
						let presentation_contexts = association.presentation_contexts().to_vec();
						match association.inner_stream().try_clone() {
							Ok(stream) => {
								connect_tx
									.send(Ok((stream, presentation_contexts)))
									.map_err(|_| ())?;
								association
							}
							Err(e) => {
								connect_tx
									.send(Err(AssociationError::Stream(e)))
									.map_err(|_| ())?;
								return Err(());
							}
						}
					}
					Err(e) => {
						error!("Failed to connect to {address}: {e}");
						connect_tx.send(Err(e.into())).map_err(|_| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = match &pdu {
								Pdu::PData { data }
									if Self::needs_chunking(
										data,
										association.acceptor_max_pdu_length(),
									) =>
								{
									data.iter().try_for_each(|pdv| {
										association
											.send_pdata(pdv.presentation_context_id)
											.write_all(&pdv.data)
											.map_err(AssociationError::ChunkWriter)
									})
								}
								_ => association
									.send(&pdu)
									.map_err(AssociationError::Association),
							};
							reply_to.send(send_result).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result = association
								.receive()
								.map_err(AssociationError::Association);
							reply_to
								.send(receive_result)
								.map_err(|_| ChannelError::Closed)
						}
						Command::Release(reply_to) => {
							let release_result = association
								.release()
								.map_err(AssociationError::Association);
							debug!("Released association");
							// The requester may have given up waiting already.
							let _ = reply_to.send(release_result);
							return Ok(());
						}
					};
					if let Some(err) = result.err() {
						error!("Error in ClientAssociation backend: {err}");
						return Err(());
					}
				}

				rx.close();

				if let Err(err) = association.abort() {
					debug!("Failed to abort ClientAssociation: {err}");
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) = connect_result
			.await
			.map_err(|_| AssociationError::Channel(ChannelError::Closed))??;

		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			presentation_contexts,
		})
	}

	pub const fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	/// Gracefully releases the association (A-RELEASE-RQ / A-RELEASE-RP).
	pub async fn release(self, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(Command::Release, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

impl Association for ClientAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				association_id = self.uuid.to_string(),
				"Failed to shutdown TcpStream: {err}"
			);
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}
