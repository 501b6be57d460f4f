//! The Inbound C-STORE SCP: accepts peer
//! associations, checks authorization, hands every received C-STORE to the
//! forwarding engine, and writes its verdict back into the DIMSE response.

use crate::destination::Params;
use crate::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use crate::dimse::association::Association;
use crate::dimse::message::{CStoreResponseMessage, COMMAND_FIELD_C_STORE_RQ};
use crate::dimse::{DicomMessageReader, DicomMessageWriter};
use crate::engine;
use crate::node::DicomNode;
use crate::registry::AssociationRegistry;
use crate::types::{Status, US};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, info_span, instrument, warn, Instrument};

/// Optional test affordance: sleeps `receive_delays[k % len]` before
/// processing, and `response_delays[k % len]` before replying, to the k-th
/// received request on one association.
#[derive(Clone, Default)]
pub struct DelayKnobs {
	pub receive_delays: Vec<Duration>,
	pub response_delays: Vec<Duration>,
}

impl DelayKnobs {
	fn receive_delay(&self, k: usize) -> Option<Duration> {
		(!self.receive_delays.is_empty()).then(|| self.receive_delays[k % self.receive_delays.len()])
	}

	fn response_delay(&self, k: usize) -> Option<Duration> {
		(!self.response_delays.is_empty()).then(|| self.response_delays[k % self.response_delays.len()])
	}
}

pub struct StoreServiceClassProvider {
	aet: String,
	bind_calling_aet: bool,
	authorized_calling_nodes: Vec<DicomNode>,
	transfer_syntaxes: Vec<String>,
	registry: Arc<AssociationRegistry>,
	delays: DelayKnobs,
}

impl StoreServiceClassProvider {
	pub fn new(
		aet: impl Into<String>,
		bind_calling_aet: bool,
		authorized_calling_nodes: Vec<DicomNode>,
		transfer_syntaxes: Vec<String>,
		registry: Arc<AssociationRegistry>,
		delays: DelayKnobs,
	) -> Self {
		Self {
			aet: aet.into(),
			bind_calling_aet,
			authorized_calling_nodes,
			transfer_syntaxes,
			registry,
			delays,
		}
	}

	pub async fn bind(self: Arc<Self>, interface: SocketAddr) -> anyhow::Result<()> {
		let listener = TcpListener::bind(interface).await?;
		info!(aet = %self.aet, %interface, "inbound C-STORE SCP listening");
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let span = info_span!("inbound-association", %peer);
					let this = Arc::clone(&self);
					tokio::spawn(async move {
						if let Err(err) = this.process(stream, peer).instrument(span).await {
							error!("inbound association ended with error: {err}");
						}
					});
				}
				Err(err) => error!("failed to accept inbound connection: {err}"),
			}
		}
	}

	#[instrument(skip(self, stream))]
	async fn process(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		tcp_stream.set_nonblocking(false)?;

		let mut association = ServerAssociation::new(ServerAssociationOptions {
			aet: self.aet.clone(),
			tcp_stream,
			peer_address: peer,
			transfer_syntaxes: self.transfer_syntaxes.clone(),
		})
		.await?;

		let source = DicomNode::new(association.calling_ae_title()).with_hostname(peer.ip().to_string());

		if !self.is_authorized(&source) {
			warn!(aet = association.calling_ae_title(), "rejecting unauthorized caller");
			return Ok(());
		}

		let destinations = match self.registry.destinations_for(association.calling_ae_title(), peer) {
			Ok(destinations) => destinations.to_vec(),
			Err(_) => Vec::new(),
		};

		let mut k = 0usize;
		while let Ok(message) = association.read_message(Duration::MAX).await {
			if let Some(delay) = self.delays.receive_delay(k) {
				tokio::time::sleep(delay).await;
			}

			let command_field = message
				.command
				.get(dicom::dictionary_std::tags::COMMAND_FIELD)
				.map(dicom::object::mem::InMemElement::to_int::<US>)
				.and_then(Result::ok);

			if command_field != Some(COMMAND_FIELD_C_STORE_RQ) {
				warn!("ignoring non-C-STORE-RQ message on inbound association");
				k += 1;
				continue;
			}

			let (status, release_association) = self.handle_c_store(&source, &destinations, &association, &message).await;

			if let Some(delay) = self.delays.response_delay(k) {
				tokio::time::sleep(delay).await;
			}

			let message_id = message
				.command
				.get(dicom::dictionary_std::tags::MESSAGE_ID)
				.map(dicom::object::mem::InMemElement::to_int::<US>)
				.and_then(Result::ok)
				.unwrap_or(0);
			let sop_class_uid = message
				.command
				.get(dicom::dictionary_std::tags::AFFECTED_SOP_CLASS_UID)
				.map(dicom::object::mem::InMemElement::to_str)
				.and_then(Result::ok)
				.map(|cow| cow.into_owned())
				.unwrap_or_default();
			let sop_instance_uid = message
				.command
				.get(dicom::dictionary_std::tags::AFFECTED_SOP_INSTANCE_UID)
				.map(dicom::object::mem::InMemElement::to_str)
				.and_then(Result::ok)
				.map(|cow| cow.into_owned())
				.unwrap_or_default();

			let response = CStoreResponseMessage {
				message_id_being_responded_to: message_id,
				affected_sop_class_uid: sop_class_uid,
				affected_sop_instance_uid: sop_instance_uid,
				status,
			};
			association
				.write_message(response, message.presentation_context_id, Duration::from_secs(10))
				.await?;

			if release_association {
				warn!("releasing inbound association after a connection exception; no further C-STOREs will be served");
				association.abort();
				break;
			}

			k += 1;
		}

		Ok(())
	}

	fn is_authorized(&self, source: &DicomNode) -> bool {
		if !self.bind_calling_aet || self.authorized_calling_nodes.is_empty() {
			return true;
		}
		self.authorized_calling_nodes.iter().any(|node| {
			node.aet == source.aet
				&& (!node.validate_hostname || node.hostname == source.hostname)
		})
	}

	async fn handle_c_store(
		&self,
		source: &DicomNode,
		destinations: &[crate::destination::ForwardDestination],
		association: &ServerAssociation,
		message: &crate::dimse::DicomMessage,
	) -> (US, bool) {
		let Some(dataset) = message.data.clone() else {
			return (Status::InvalidDataSet.code(), false);
		};

		let cuid = message
			.command
			.get(dicom::dictionary_std::tags::AFFECTED_SOP_CLASS_UID)
			.map(dicom::object::mem::InMemElement::to_str)
			.and_then(Result::ok)
			.map(|cow| cow.into_owned())
			.unwrap_or_default();
		let iuid = message
			.command
			.get(dicom::dictionary_std::tags::AFFECTED_SOP_INSTANCE_UID)
			.map(dicom::object::mem::InMemElement::to_str)
			.and_then(Result::ok)
			.map(|cow| cow.into_owned())
			.unwrap_or_default();

		let pcid = message.presentation_context_id.unwrap_or(1);
		let tsuid = association
			.presentation_contexts()
			.iter()
			.find(|pctx| pctx.id == pcid)
			.map(|pctx| pctx.transfer_syntax.clone())
			.unwrap_or_else(|| crate::transcoder::EXPLICIT_VR_LITTLE_ENDIAN.to_owned());

		let params = Params {
			iuid,
			cuid,
			tsuid,
			pcid,
			dataset,
		};

		match engine::store_multiple_destinations(source, destinations, params).await {
			Ok(status) => (status, false),
			Err(err) => {
				let release_association = err.is_connection_exception();
				(err.status_code(), release_association)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::destination::ForwardDestination;
	use crate::dimse::association::client::{ClientAssociation, ClientAssociationOptions, ProposedContext};
	use crate::dimse::message::CStoreRequest;
	use crate::dimse::{DicomMessageReader, DicomMessageWriter};
	use crate::editor::{Abort, AttributeEditorContext, Editor};
	use crate::stow::StowClient;
	use crate::types::{Priority, Status};
	use dicom::object::InMemDicomObject;

	/// An editor that always requests a connection exception, standing in
	/// for whatever real editor failure would trigger scenario 5 (a
	/// destination-side fault serious enough to abandon the whole inbound
	/// association, not just this one instance).
	struct AlwaysConnectionException;
	impl Editor for AlwaysConnectionException {
		fn apply(&self, _dataset: &mut InMemDicomObject, context: &mut AttributeEditorContext) {
			context.abort = Abort::ConnectionException(String::from("forced for test"));
		}
	}

	fn registry_with_aborting_web_destination(peer_hostname: &str) -> AssociationRegistry {
		let destination = ForwardDestination::Web {
			name: String::from("web"),
			endpoint_url: String::from("http://127.0.0.1:1/dicom-web"),
			content_type: String::from("application/dicom"),
			editors: vec![Arc::new(AlwaysConnectionException)],
			stow_client: Arc::new(StowClient::new("http://127.0.0.1:1/dicom-web", Duration::from_secs(1)).unwrap()),
		};
		let mut registry = AssociationRegistry::new();
		registry.register(DicomNode::new("PEER").with_hostname(peer_hostname), vec![destination]);
		registry
	}

	#[tokio::test]
	async fn connection_exception_releases_the_inbound_association() {
		let cuid = "1.2.840.10008.5.1.4.1.1.2";
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let scp = Arc::new(StoreServiceClassProvider::new(
			"SCPAET",
			false,
			Vec::new(),
			Vec::new(),
			Arc::new(registry_with_aborting_web_destination("127.0.0.1")),
			DelayKnobs::default(),
		));

		let server_handle = tokio::spawn({
			let scp = Arc::clone(&scp);
			async move {
				let (stream, peer) = listener.accept().await.unwrap();
				scp.process(stream, peer).await.unwrap();
			}
		});

		let client = ClientAssociation::new(ClientAssociationOptions {
			calling_aet: String::from("PEER"),
			called_aet: String::from("SCPAET"),
			address: addr,
			contexts: vec![ProposedContext {
				abstract_syntax: cuid.to_owned(),
				transfer_syntaxes: vec![String::from("1.2.840.10008.1.2.1")],
			}],
		})
		.await
		.unwrap();

		let request = CStoreRequest {
			affected_sop_class_uid: cuid.to_owned(),
			affected_sop_instance_uid: String::from("1.2.3.4"),
			message_id: 1,
			priority: Priority::Medium,
			move_originator_aet: None,
			move_originator_message_id: None,
			data_set: InMemDicomObject::new_empty(),
		};
		client.write_message(request, None, Duration::from_secs(5)).await.unwrap();
		let response = client.read_message(Duration::from_secs(5)).await.unwrap();
		let status = response
			.command
			.get(dicom::dictionary_std::tags::STATUS)
			.map(dicom::object::mem::InMemElement::to_int::<crate::types::US>)
			.and_then(Result::ok)
			.unwrap();
		assert_eq!(Status::classify(status), crate::types::StatusClass::Failure);

		// The inbound association must already be gone: a second C-STORE-RQ
		// on it cannot complete.
		let second_request = CStoreRequest {
			affected_sop_class_uid: cuid.to_owned(),
			affected_sop_instance_uid: String::from("1.2.3.5"),
			message_id: 2,
			priority: Priority::Medium,
			move_originator_aet: None,
			move_originator_message_id: None,
			data_set: InMemDicomObject::new_empty(),
		};
		// Writing to an already-shutdown socket can still succeed at the
		// buffering layer; reading back confirms no further response ever
		// arrives, since the inbound association (and its SCP task) is gone.
		let _ = client.write_message(second_request, None, Duration::from_secs(5)).await;
		let second_read = client.read_message(Duration::from_secs(5)).await;
		assert!(second_read.is_err(), "association must be aborted after a connection exception");

		server_handle.await.unwrap();
	}
}
