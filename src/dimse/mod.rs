//! DIMSE message framing on top of the association primitives in
//! [`association`]. The bit-level PDU codec is external (`dicom::ul`);
//! this module turns its `Pdu` stream into whole
//! command-set/data-set DIMSE messages and back, which the streaming store
//! SCU and inbound SCP build on to speak C-STORE.

pub mod association;
pub mod message;

use association::Association;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

use crate::types::{UI, US};

/// Value for `(0000,0800) CommandDataSetType` meaning "a data set follows".
pub const DATA_SET_EXISTS: US = 0x0102;
/// Value for `(0000,0800) CommandDataSetType` meaning "no data set".
pub const DATA_SET_MISSING: US = 0x0101;

/// A DIMSE message: a command set, optionally followed by a data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	pub command: InMemDicomObject,
	pub data: Option<InMemDicomObject>,
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = message.into();

		let presentation_context = match presentation_context_id {
			None => self.presentation_contexts().first(),
			Some(id) => self.presentation_contexts().iter().find(|pctx| pctx.id == id),
		}
		.ok_or(NegotiationError::NoPresentationContext)?;

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

		self.send(
			Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Command,
					presentation_context_id: presentation_context.id,
					is_last: true,
					data: command_buf,
				}],
			},
			timeout,
		)
		.await?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&presentation_context.transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(UI::from(&presentation_context.transfer_syntax))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, &transfer_syntax)?;

			self.send(
				Pdu::PData {
					data: vec![PDataValue {
						value_type: PDataValueType::Data,
						presentation_context_id: presentation_context.id,
						is_last: true,
						data: data_buf,
					}],
				},
				timeout,
			)
			.await?;
		}

		Ok(())
	}
}

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut message_command: Option<InMemDicomObject> = None;

		loop {
			let pdu = self.receive(timeout).await?;
			let Pdu::PData { data } = pdu else {
				return Err(ReadError::UnexpectedPdu(pdu));
			};

			for mut pdv in data {
				match pdv.value_type {
					PDataValueType::Command => {
						trace!("Received command fragment (last={})", pdv.is_last);
						if message_command.is_some() {
							return Err(ReadError::OutOfOrder);
						}
						command_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let command = InMemDicomObject::read_dataset_with_ts(
								command_fragments.as_slice(),
								&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
							)?;
							let has_data_set = command
								.get(tags::COMMAND_DATA_SET_TYPE)
								.map(InMemElement::to_int::<US>)
								.and_then(Result::ok)
								.is_some_and(|value| value != DATA_SET_MISSING);

							if has_data_set {
								message_command = Some(command);
							} else {
								return Ok(DicomMessage {
									command,
									data: None,
									presentation_context_id: Some(pdv.presentation_context_id),
								});
							}
						}
					}
					PDataValueType::Data => {
						trace!("Received data fragment (last={})", pdv.is_last);
						data_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let presentation_context = self
								.presentation_contexts()
								.iter()
								.find(|pctx| pctx.id == pdv.presentation_context_id)
								.ok_or(NegotiationError::NoPresentationContext)?;
							let transfer_syntax = TransferSyntaxRegistry
								.get(&presentation_context.transfer_syntax)
								.ok_or_else(|| {
									NegotiationError::UnknownTransferSyntax(UI::from(
										&presentation_context.transfer_syntax,
									))
								})?;
							let data = InMemDicomObject::read_dataset_with_ts(
								data_fragments.as_slice(),
								transfer_syntax,
							)?;

							let Some(command) = message_command else {
								return Err(ReadError::OutOfOrder);
							};
							return Ok(DicomMessage {
								command,
								data: Some(data),
								presentation_context_id: Some(pdv.presentation_context_id),
							});
						}
					}
				}
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] association::AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute is missing: {0:?}")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] association::AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("No accepted presentation context for this message")]
	NoPresentationContext,
}

/// Monotonically increasing DIMSE Message ID, unique within the process.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(1);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}
