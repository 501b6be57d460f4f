//! The Forwarding Engine: fans one received
//! instance out to 1..N destinations, reusing a single parsed dataset,
//! applying each destination's editors to its own clone, and coordinating
//! abort propagation.

use crate::destination::{ForwardDestination, Params};
use crate::editor::{apply_pipeline, Abort, AttributeEditorContext};
use crate::error::ForwardError;
use crate::node::DicomNode;
use crate::transcoder::{self, Decision};
use crate::types::{Priority, Status, UI};
use dicom::object::InMemDicomObject;
use tracing::{info, instrument, warn};

/// `1.2.840.10008.1.3.10`: Media Storage Directory Storage (DICOMDIR).
/// These are directory records, not stored instances, and are dropped.
const DICOMDIR_SOP_CLASS: &str = "1.2.840.10008.1.3.10";

/// Outcome of forwarding one instance to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationOutcome {
	Completed,
	Warning,
	Failed,
}

#[instrument(skip(destinations, params), fields(iuid = %params.iuid, cuid = %params.cuid))]
pub async fn store_multiple_destinations(
	source: &DicomNode,
	destinations: &[ForwardDestination],
	params: Params,
) -> Result<u16, ForwardError> {
	if params.cuid == DICOMDIR_SOP_CLASS {
		info!("dropping DICOMDIR instance, not a stored instance");
		return Ok(Status::Success.code());
	}

	if destinations.is_empty() {
		return Err(ForwardError::NoDestination);
	}

	let mut prepared = Vec::with_capacity(destinations.len());
	for destination in destinations {
		match prepare_transfer(destination, &params).await {
			Ok(()) => prepared.push(destination),
			Err(err) => warn!(destination = destination.name(), "prepare_transfer failed, dropping destination: {err}"),
		}
	}

	if prepared.is_empty() {
		return Err(ForwardError::AssociationNotReady);
	}

	let mut any_completed = false;
	let mut connection_exception = None;

	for destination in prepared {
		let clone = params.dataset.clone();
		match transfer(source, destination, &params, clone).await {
			Ok(DestinationOutcome::Completed | DestinationOutcome::Warning) => any_completed = true,
			Ok(DestinationOutcome::Failed) => {}
			Err(err) if err.is_connection_exception() => {
				connection_exception = Some(err);
				break;
			}
			Err(err) => warn!(destination = destination.name(), "transfer failed: {err}"),
		}
	}

	if let Some(err) = connection_exception {
		return Err(err);
	}

	if any_completed {
		Ok(Status::Success.code())
	} else {
		Err(ForwardError::ProcessingFailed)
	}
}

/// Adds presentation contexts and opens the destination's outbound
/// association if needed.
async fn prepare_transfer(destination: &ForwardDestination, params: &Params) -> Result<(), ForwardError> {
	match destination {
		ForwardDestination::Dicom { stream_scu, .. } => stream_scu
			.prepare(&params.cuid, &params.tsuid)
			.await
			.map_err(|err| ForwardError::AssociationNotReadyWith(err.to_string())),
		ForwardDestination::Web { .. } => Ok(()),
	}
}

/// Runs one destination's editors over `dataset`, transcodes if required,
/// and sends. Returns the per-destination outcome; a `FILE_EXCEPTION` abort
/// is folded into `Failed`, a `CONNECTION_EXCEPTION` abort escapes as
/// `Err(ForwardError::ConnectionException)`.
async fn transfer(
	source: &DicomNode,
	destination: &ForwardDestination,
	params: &Params,
	mut dataset: InMemDicomObject,
) -> Result<DestinationOutcome, ForwardError> {
	let destination_node = destination_node_of(destination);
	let mut context = AttributeEditorContext::new(params.tsuid.clone(), source.clone(), destination_node);

	apply_pipeline(destination.editors(), &mut dataset, &mut context);

	match &context.abort {
		Abort::None => {}
		Abort::FileException(message) => {
			warn!("editor requested skip: {message}");
			return Ok(DestinationOutcome::Failed);
		}
		Abort::ConnectionException(message) => {
			return Err(ForwardError::ConnectionException(message.clone()));
		}
	}

	match destination {
		ForwardDestination::Dicom {
			stream_scu,
			use_jpeg_destination,
			..
		} => send_dicom(stream_scu.as_ref(), params, dataset, &context, *use_jpeg_destination).await,
		ForwardDestination::Web { stow_client, content_type, .. } => {
			send_web(stow_client.as_ref(), params, dataset, &context, content_type).await
		}
	}
}

fn destination_node_of(destination: &ForwardDestination) -> DicomNode {
	match destination {
		ForwardDestination::Dicom { called_node, .. } => called_node.clone(),
		ForwardDestination::Web { name, .. } => DicomNode::new(name.clone()),
	}
}

async fn send_dicom(
	scu: &crate::scu::StreamingStoreScu,
	params: &Params,
	mut dataset: InMemDicomObject,
	context: &AttributeEditorContext,
	use_jpeg_destination: bool,
) -> Result<DestinationOutcome, ForwardError> {
	let accepted_tsuid = select_transfer_syntax(scu, &params.cuid, &params.tsuid).await?;
	let has_pixel_data = dataset.element(dicom::dictionary_std::tags::PIXEL_DATA).is_ok();
	let decision = if use_jpeg_destination && has_pixel_data && params.tsuid != transcoder::JPEG_BASELINE {
		// This destination always wants JPEG Baseline pixel data, regardless
		// of what `decide` would otherwise pick (including pass-through).
		Decision::Transcode {
			target_tsuid: transcoder::JPEG_BASELINE.to_owned(),
		}
	} else {
		transcoder::decide(has_pixel_data, context.mask_area.is_some(), &params.tsuid, &accepted_tsuid)
	};

	let (output_tsuid, output_dataset) = match decision {
		Decision::PassThrough => (accepted_tsuid, dataset),
		Decision::Transcode { target_tsuid } => {
			let target_tsuid = transcoder::substitute_unwritable_target(&target_tsuid).to_owned();
			let recoded = transcoder::recode(&dataset, context.mask_area.as_ref(), &params.tsuid, &target_tsuid)
				.map_err(|err| ForwardError::TranscodeFailure(err.to_string()))?;
			dataset = recoded;
			(target_tsuid, dataset)
		}
	};

	let status = scu
		.cstore(&params.cuid, &params.iuid, output_dataset, Priority::Medium, &output_tsuid)
		.await
		.map_err(|err| ForwardError::AssociationNotReadyWith(err.to_string()))?;

	Ok(classify_outcome(status))
}

async fn send_web(
	stow: &crate::stow::StowClient,
	params: &Params,
	dataset: InMemDicomObject,
	context: &AttributeEditorContext,
	content_type: &str,
) -> Result<DestinationOutcome, ForwardError> {
	let has_pixel_data = dataset.element(dicom::dictionary_std::tags::PIXEL_DATA).is_ok();
	// Web destinations never receive RLE Lossless; Explicit VR Big Endian is also always remapped.
	let preferred_tsuid = if params.tsuid == "1.2.840.10008.1.2.2" || params.tsuid == transcoder::RLE_LOSSLESS {
		transcoder::EXPLICIT_VR_LITTLE_ENDIAN.to_owned()
	} else {
		params.tsuid.clone()
	};

	let decision = transcoder::decide(has_pixel_data, context.mask_area.is_some(), &params.tsuid, &preferred_tsuid);
	let (output_tsuid, output_dataset) = match decision {
		Decision::PassThrough => (preferred_tsuid, dataset),
		Decision::Transcode { target_tsuid } => {
			let target_tsuid = transcoder::substitute_unwritable_target(&target_tsuid).to_owned();
			let recoded = transcoder::recode(&dataset, context.mask_area.as_ref(), &params.tsuid, &target_tsuid)
				.map_err(|err| ForwardError::TranscodeFailure(err.to_string()))?;
			(target_tsuid, recoded)
		}
	};

	stow.store(&params.iuid, &params.cuid, &output_tsuid, output_dataset, content_type)
		.await
		.map(|()| DestinationOutcome::Completed)
		.map_err(|err| ForwardError::Io(std::io::Error::other(err.to_string())))
}

fn classify_outcome(status: u16) -> DestinationOutcome {
	use crate::types::StatusClass;
	match Status::classify(status) {
		StatusClass::Success => DestinationOutcome::Completed,
		StatusClass::Warning => DestinationOutcome::Warning,
		StatusClass::Failure => DestinationOutcome::Failed,
	}
}

/// Picks the outbound transfer syntax: prefers an accepted context whose
/// tsuid equals the inbound tsuid; else any accepted context for the cuid;
/// else Explicit VR Little Endian.
async fn select_transfer_syntax(
	scu: &crate::scu::StreamingStoreScu,
	cuid: &str,
	inbound_tsuid: &str,
) -> Result<UI, ForwardError> {
	match scu.accepted_transfer_syntax(cuid).await {
		Some(tsuid) => Ok(tsuid),
		None => {
			let _ = inbound_tsuid;
			Ok(transcoder::EXPLICIT_VR_LITTLE_ENDIAN.to_owned())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::destination::Params;

	fn params(cuid: &str) -> Params {
		Params {
			iuid: UI::from("1.2.3.4"),
			cuid: UI::from(cuid),
			tsuid: UI::from("1.2.840.10008.1.2.1"),
			pcid: 1,
			dataset: InMemDicomObject::new_empty(),
		}
	}

	#[tokio::test]
	async fn dicomdir_is_dropped_without_touching_destinations() {
		let source = DicomNode::new("SRC");
		let result = store_multiple_destinations(&source, &[], params(DICOMDIR_SOP_CLASS)).await;
		assert_eq!(result.unwrap(), Status::Success.code());
	}

	#[tokio::test]
	async fn empty_destinations_fails_with_no_destination() {
		let source = DicomNode::new("SRC");
		let err = store_multiple_destinations(&source, &[], params("1.2.840.10008.5.1.4.1.1.2"))
			.await
			.unwrap_err();
		assert!(matches!(err, ForwardError::NoDestination));
	}
}
