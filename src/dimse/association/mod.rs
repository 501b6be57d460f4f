//! A DICOM association wrapped so it can be driven from async code even
//! though `dicom::ul`'s association types are blocking: each association
//! owns a dedicated OS thread, and callers talk to it over a bounded
//! channel using an ask/reply pattern.

pub mod client;
pub mod server;

use dicom::ul::pdu::PresentationContextResult;
use dicom::ul::Pdu;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error(transparent)]
	Channel(#[from] ChannelError),
	#[error("Failed to spawn thread")]
	OsThread(std::io::Error),
	#[error("Failed to write P-DATA chunk: {0}")]
	ChunkWriter(std::io::Error),
	#[error(transparent)]
	Client(#[from] dicom::ul::association::client::Error),
	#[error(transparent)]
	Server(#[from] dicom::ul::association::server::Error),
}

pub trait Association {
	fn receive(&self, timeout: Duration) -> impl Future<Output = Result<Pdu, AssociationError>> + Send;

	fn send(&self, pdu: Pdu, timeout: Duration) -> impl Future<Output = Result<(), AssociationError>> + Send;

	/// Releases the association gracefully (A-RELEASE-RQ/RP), bounded by
	/// `timeout`. Used by the streaming store SCU's `close()`.
	fn release(&self, timeout: Duration) -> impl Future<Output = Result<(), AssociationError>> + Send;

	/// Aborts the association immediately (A-ABORT), no handshake.
	fn abort(&mut self);

	fn presentation_contexts(&self) -> &[PresentationContextResult];
}

#[derive(Debug)]
pub enum Command {
	Send(Pdu, oneshot::Sender<Result<(), AssociationError>>),
	Receive(oneshot::Sender<Result<Pdu, AssociationError>>),
	Release(oneshot::Sender<Result<(), AssociationError>>),
}

#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("Timed out")]
	Timeout,
	#[error("Channel is closed")]
	Closed,
}

pub trait AskPattern<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError>;
}

impl<T> AskPattern<T> for Sender<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError> {
		let (tx, rx) = oneshot::channel();
		tokio::time::timeout(timeout, async {
			self.send(command(tx)).await.map_err(|_| ChannelError::Closed)?;
			rx.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)?
	}
}
