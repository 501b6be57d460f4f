//! The outbound (SCU-side) association, used by the streaming store SCU.
//! A single [`ClientAssociation`] corresponds to one open DICOM
//! association with a destination peer.

use dicom::ul::pdu::{PDataValueType, PresentationContextResult};
use dicom::ul::Pdu;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use super::{AskPattern, Association, AssociationError, ChannelError, Command};

/// One proposed presentation context: an abstract syntax (SOP Class UID)
/// together with the transfer syntaxes offered for it. Presentation
/// context ids are assigned by `dicom::ul` in the order contexts are added
/// here, starting at 1 and incrementing by 2.
#[derive(Debug, Clone)]
pub struct ProposedContext {
	pub abstract_syntax: String,
	pub transfer_syntaxes: Vec<String>,
}

pub struct ClientAssociationOptions {
	pub calling_aet: String,
	pub called_aet: String,
	pub address: SocketAddr,
	pub contexts: Vec<ProposedContext>,
}

pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextResult>,
}

impl ClientAssociation {
	pub async fn new(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(4);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let address = options.address;
		let mut builder = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet);

		for context in &options.contexts {
			builder = builder
				.with_presentation_context(context.abstract_syntax.clone(), context.transfer_syntaxes.clone());
		}

		let _handle = thread::Builder::new()
			.name(String::from("dicom-forward-scu"))
			.spawn(move || {
				let span = tracing::info_span!("ClientAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match builder.establish(address) {
					Ok(association) => {
						let presentation_contexts = association.presentation_contexts().to_vec();
						let stream = association.inner_stream().try_clone().expect("TcpStream::clone");

						connect_tx.send(Ok((stream, presentation_contexts))).map_err(|_| ())?;
						association
					}
					Err(e) => {
						error!("Failed to establish outbound association: {e}");
						connect_tx.send(Err(e.into())).map_err(|_| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = Self::chunked_send(&mut association, &pdu);
							reply_to.send(send_result).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result = association.receive().map_err(AssociationError::Client);
							reply_to.send(receive_result).map_err(|_| ChannelError::Closed)
						}
						Command::Release(reply_to) => {
							let release_result = association.release().map_err(AssociationError::Client);
							reply_to.send(release_result).map_err(|_| ChannelError::Closed)
						}
					};
					if let Some(err) = result.err() {
						error!("Error in ClientAssociation backend: {err}");
						return Err(());
					}
				}

				rx.close();
				if let Err(err) = association.abort() {
					debug!("ClientAssociation::abort() returned error: {err}");
				}
				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) = connect_result.await.expect("connect_result.await")?;

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

	fn chunked_send(
		association: &mut dicom::ul::ClientAssociation,
		pdu: &Pdu,
	) -> Result<(), AssociationError> {
		match &pdu {
			Pdu::PData { data } => {
				let is_command = data.first().is_some_and(|pdv| pdv.value_type == PDataValueType::Command);
				if is_command {
					return association.send(pdu).map_err(AssociationError::Client);
				}

				let data_length: usize = data.iter().map(|pdv| pdv.data.len()).sum();
				if data_length > association.acceptor_max_pdu_length() as usize {
					for pdv in data {
						let mut writer = association.send_pdata(pdv.presentation_context_id);
						std::io::Write::write_all(&mut writer, &pdv.data).map_err(AssociationError::ChunkWriter)?;
					}
					Ok(())
				} else {
					association.send(pdu).map_err(AssociationError::Client)
				}
			}
			_ => association.send(pdu).map_err(AssociationError::Client),
		}
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		Association::abort(self);
	}
}

impl Association for ClientAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel.ask(Command::Receive, timeout).await.map_err(AssociationError::Channel)?
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)?
	}

	async fn release(&self, timeout: Duration) -> Result<(), AssociationError> {
		self.channel.ask(Command::Release, timeout).await.map_err(AssociationError::Channel)?
	}

	fn abort(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(association_id = self.uuid.to_string(), "Failed to shutdown TcpStream: {err}");
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextResult] {
		&self.presentation_contexts
	}
}
