//! `ForwardDestination`: one outbound target a received
//! instance is forwarded to, either a classical DICOM peer or an HTTP
//! STOW-RS endpoint.

use crate::config::{ConnectOptions, DestinationConfig, EditorConfig};
use crate::editor::{DefaultEditor, Editor};
use crate::node::DicomNode;
use crate::scu::StreamingStoreScu;
use crate::stow::StowClient;
use crate::types::UI;
use dicom::core::{DataElement, Tag, VR};
use dicom::dicom_value;
use dicom::object::InMemDicomObject;
use std::sync::Arc;
use std::time::Duration;

/// One configured forward target. The [`crate::registry::AssociationRegistry`]
/// owns these; a [`crate::scu::StreamingStoreScu`] or [`StowClient`] is
/// exclusively owned by the destination that holds it.
#[derive(Clone)]
pub enum ForwardDestination {
	Dicom {
		name: String,
		calling_node: DicomNode,
		called_node: DicomNode,
		editors: Vec<Arc<dyn Editor>>,
		stream_scu: Arc<StreamingStoreScu>,
		use_jpeg_destination: bool,
	},
	Web {
		name: String,
		endpoint_url: String,
		content_type: String,
		editors: Vec<Arc<dyn Editor>>,
		stow_client: Arc<StowClient>,
	},
}

impl ForwardDestination {
	pub fn name(&self) -> &str {
		match self {
			Self::Dicom { name, .. } | Self::Web { name, .. } => name,
		}
	}

	pub fn editors(&self) -> &[Arc<dyn Editor>] {
		match self {
			Self::Dicom { editors, .. } | Self::Web { editors, .. } => editors,
		}
	}

	/// Stops this destination's outbound association/client, the
	/// operator-facing surface for `close(force=true)`.
	pub async fn stop(&self) {
		match self {
			Self::Dicom { stream_scu, .. } => stream_scu.close(true).await,
			Self::Web { .. } => {}
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum BuildDestinationError {
	#[error("destination {name}: invalid endpoint URL {endpoint_url:?}: {source}")]
	InvalidEndpointUrl {
		name: String,
		endpoint_url: String,
		source: url::ParseError,
	},
	#[error("destination {name}: invalid content type {content_type:?}: {source}")]
	InvalidContentType {
		name: String,
		content_type: String,
		source: mime::FromStrError,
	},
	#[error(transparent)]
	Client(#[from] reqwest::Error),
}

/// Builds a [`DestinationConfig`] into a live [`ForwardDestination`],
/// wiring up its editor chain and owning connection.
pub fn build_destination(
	config: &DestinationConfig,
	calling_node: &DicomNode,
	connect_options: &ConnectOptions,
) -> Result<ForwardDestination, BuildDestinationError> {
	match config {
		DestinationConfig::Dicom {
			name,
			called_aet,
			hostname,
			port,
			editors,
			use_jpeg_destination,
		} => {
			let called_node = DicomNode::new(called_aet.clone()).with_hostname(hostname.clone()).with_port(*port);
			Ok(ForwardDestination::Dicom {
				name: name.clone(),
				calling_node: calling_node.clone(),
				stream_scu: Arc::new(StreamingStoreScu::new(calling_node.clone(), called_node.clone())),
				called_node,
				editors: editors.iter().map(build_editor).collect(),
				use_jpeg_destination: *use_jpeg_destination,
			})
		}
		DestinationConfig::Web {
			name,
			endpoint_url,
			content_type,
			editors,
		} => {
			url::Url::parse(endpoint_url).map_err(|source| BuildDestinationError::InvalidEndpointUrl {
				name: name.clone(),
				endpoint_url: endpoint_url.clone(),
				source,
			})?;
			content_type.parse::<mime::Mime>().map_err(|source| BuildDestinationError::InvalidContentType {
				name: name.clone(),
				content_type: content_type.clone(),
				source,
			})?;

			let timeout = Duration::from_millis(connect_options.request_timeout_ms);
			Ok(ForwardDestination::Web {
				name: name.clone(),
				endpoint_url: endpoint_url.clone(),
				content_type: content_type.clone(),
				editors: editors.iter().map(build_editor).collect(),
				stow_client: Arc::new(StowClient::new(endpoint_url.clone(), timeout)?),
			})
		}
	}
}

fn build_editor(config: &EditorConfig) -> Arc<dyn Editor> {
	let session_key = config.session_key.clone().unwrap_or_default().into_bytes();
	let mut editor = DefaultEditor::new(session_key).with_generate_uids(config.generate_uids);

	if !config.tag_to_override.is_empty() {
		let mut overrides = InMemDicomObject::new_empty();
		for (tag_hex, value) in &config.tag_to_override {
			if let Some(tag) = parse_tag(tag_hex) {
				overrides.put(DataElement::new(tag, VR::LO, dicom_value!(Str, value.clone())));
			}
		}
		editor = editor.with_tag_to_override(overrides);
	}

	Arc::new(editor)
}

fn parse_tag(hex: &str) -> Option<Tag> {
	let (group, element) = hex.split_once(',')?;
	let group = u16::from_str_radix(group.trim(), 16).ok()?;
	let element = u16::from_str_radix(element.trim(), 16).ok()?;
	Some(Tag(group, element))
}

/// Per-inbound-C-STORE immutable parameters. The
/// dataset has already been parsed out of the PDV stream by the time the
/// engine receives this; what the engine owns from here on is the
/// in-memory object, not the wire bytes.
#[derive(Clone)]
pub struct Params {
	pub iuid: UI,
	pub cuid: UI,
	pub tsuid: UI,
	pub pcid: u8,
	pub dataset: dicom::object::InMemDicomObject,
}
