use crate::types::US;
use thiserror::Error;

/// The error taxonomy this proxy surfaces. Every kind maps to a DIMSE status
/// code via [`ForwardError::status_code`] so that the inbound SCP can answer
/// the originating C-STORE-RQ without re-deriving the mapping at the call
/// site.
#[derive(Debug, Error)]
pub enum ForwardError {
	#[error("no destination configured for this source")]
	NoDestination,

	#[error("outbound association is not ready for data transfer")]
	AssociationNotReady,

	#[error("outbound association is not ready for data transfer: {0}")]
	AssociationNotReadyWith(String),

	#[error("no destination completed the transfer")]
	ProcessingFailed,

	#[error("no accepted presentation context for {cuid}/{tsuid}")]
	PresentationContextUnsupported { cuid: String, tsuid: String },

	#[error("editor requested abort: {0}")]
	FileException(String),

	#[error("editor requested abort, releasing inbound association: {0}")]
	ConnectionException(String),

	#[error("transcoding failed: {0}")]
	TranscodeFailure(String),

	#[error("I/O failure: {0}")]
	Io(#[from] std::io::Error),

	#[error("caller is not authorized")]
	Authorization,
}

impl ForwardError {
	/// The DIMSE status code to place in the C-STORE-RSP command set.
	pub const fn status_code(&self) -> US {
		match self {
			Self::NoDestination
			| Self::TranscodeFailure(_)
			| Self::Io(_)
			| Self::FileException(_)
			| Self::ConnectionException(_)
			| Self::ProcessingFailed => 0x0110, // ProcessingFailure
			Self::AssociationNotReady
			| Self::AssociationNotReadyWith(_)
			| Self::PresentationContextUnsupported { .. } => 0x0110,
			Self::Authorization => 0x0124, // NotAuthorized
		}
	}

	/// True for the one abort kind that must propagate out of the engine and
	/// terminate the inbound association.
	pub const fn is_connection_exception(&self) -> bool {
		matches!(self, Self::ConnectionException(_))
	}
}
