//! The inbound (SCP-side) association, used by the C-STORE SCP. Accepts
//! any presented abstract syntax ("promiscuous") and negotiates transfer
//! syntax against the configured transfer capability list.

use dicom::ul::pdu::PresentationContextResult;
use dicom::ul::Pdu;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::time::Duration;
use std::{net::SocketAddr, thread};
use tokio::sync::oneshot;
use tokio::sync::mpsc::Sender;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{AskPattern, Association, AssociationError, ChannelError, Command};

pub struct ServerAssociation {
	channel: Sender<Command>,
	presentation_contexts: Vec<PresentationContextResult>,
	tcp_stream: TcpStream,
	peer_address: SocketAddr,
	calling_ae_title: String,
}

pub struct ServerAssociationOptions {
	pub aet: String,
	pub tcp_stream: TcpStream,
	pub peer_address: SocketAddr,
	/// Transfer syntax UIDs proposed to the peer, taken from the loaded
	/// transfer capability file. Empty means "accept whatever the full
	/// transfer syntax registry supports", the bundled-defaults fallback.
	pub transfer_syntaxes: Vec<String>,
}

impl ServerAssociation {
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.ae_title(options.aet.clone())
			.promiscuous(true);

		if options.transfer_syntaxes.is_empty() {
			use dicom::transfer_syntax::TransferSyntaxRegistry;
			for syntax in TransferSyntaxRegistry.iter().filter(|ts| !ts.is_unsupported()) {
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		} else {
			for ts in &options.transfer_syntaxes {
				server_options = server_options.with_transfer_syntax(ts.clone());
			}
		}

		let peer_address = options.peer_address;
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(4);

		let _handle = thread::Builder::new()
			.name(format!("{}-scp", options.aet))
			.spawn(move || {
				let span = tracing::info_span!("ServerAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(association) => {
						info!(
							calling_aet = association.client_ae_title(),
							called_aet = options.aet,
							peer = peer_address.to_string(),
							"Accepted inbound association"
						);
						let contexts = association.presentation_contexts().to_vec();
						let stream = association.inner_stream().try_clone().expect("TcpStream::clone");
						connect_tx
							.send(Ok((stream, contexts, association.client_ae_title().to_owned())))
							.map_err(|_| ())?;
						association
					}
					Err(e) => {
						connect_tx.send(Err(e.into())).map_err(|_| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = association.send(&pdu).map_err(AssociationError::Server);
							reply_to.send(send_result).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result = association.receive().map_err(AssociationError::Server);
							reply_to.send(receive_result).map_err(|_| ChannelError::Closed)
						}
						Command::Release(reply_to) => {
							let release_result = association.release().map_err(AssociationError::Server);
							reply_to.send(release_result).map_err(|_| ChannelError::Closed)
						}
					};

					if let Some(err) = result.err() {
						error!("Error in ServerAssociation: {err}");
						return Err(());
					}
				}

				rx.close();
				if let Err(e) = association.abort() {
					match &e {
						dicom::ul::association::server::Error::Send { source, .. }
							if source.kind() == ErrorKind::BrokenPipe =>
						{
							// Peer already closed the TCP stream; nothing to do.
						}
						_ => warn!("ServerAssociation::abort() returned error: {e}"),
					}
				}
				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts, calling_ae_title) =
			connect_result.await.expect("connect_result.await")?;

		Ok(Self {
			channel: tx,
			presentation_contexts,
			tcp_stream,
			peer_address,
			calling_ae_title,
		})
	}

	pub const fn peer_address(&self) -> SocketAddr {
		self.peer_address
	}

	pub fn calling_ae_title(&self) -> &str {
		&self.calling_ae_title
	}
}

impl Association for ServerAssociation {
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
		debug!("Aborting inbound association from outside");
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			warn!("TcpStream::shutdown failed: {err}");
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextResult] {
		&self.presentation_contexts
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		Association::abort(self);
	}
}
