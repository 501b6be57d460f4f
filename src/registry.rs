//! The Association Registry: maps an inbound
//! peer identity to its configured list of forward destinations.

use crate::destination::ForwardDestination;
use crate::node::DicomNode;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("no destination configured for source {0:?}")]
	NoDestination(DicomNode),
}

/// Maps `(sourceAET, sourceHostname)` to an ordered list of destinations.
/// Lookup clears the port on the key so a peer connecting from an
/// ephemeral source port still matches a configured entry.
#[derive(Default)]
pub struct AssociationRegistry {
	routes: HashMap<DicomNode, Vec<ForwardDestination>>,
}

impl AssociationRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `destinations` for `source`. One entry may mix DICOM and
	/// Web destinations.
	pub fn register(&mut self, source: DicomNode, destinations: Vec<ForwardDestination>) {
		self.routes.insert(source.without_port(), destinations);
	}

	/// Looks up the destinations configured for `source`, ignoring its port.
	pub fn lookup(&self, source: &DicomNode) -> Option<&[ForwardDestination]> {
		self.routes.get(&source.without_port()).map(Vec::as_slice)
	}

	/// Resolves destinations for a peer association by its calling AE
	/// title and peer socket address.
	pub fn destinations_for(
		&self,
		calling_aet: &str,
		peer: SocketAddr,
	) -> Result<&[ForwardDestination], RegistryError> {
		let key = DicomNode::new(calling_aet).with_hostname(peer.ip().to_string());
		self.lookup(&key).ok_or(RegistryError::NoDestination(key))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::editor::DefaultEditor;
	use crate::scu::StreamingStoreScu;
	use std::sync::Arc;

	fn dicom_destination() -> ForwardDestination {
		ForwardDestination::Dicom {
			calling_node: DicomNode::new("US"),
			called_node: DicomNode::new("THEM").with_hostname("10.0.0.2").with_port(104),
			editors: vec![Arc::new(DefaultEditor::new(b"key".to_vec()))],
			stream_scu: Arc::new(StreamingStoreScu::new(
				DicomNode::new("US"),
				DicomNode::new("THEM").with_hostname("10.0.0.2").with_port(104),
			)),
			use_jpeg_destination: false,
		}
	}

	#[test]
	fn lookup_ignores_ephemeral_source_port() {
		let mut registry = AssociationRegistry::new();
		registry.register(
			DicomNode::new("REMOTE").with_hostname("192.168.1.5"),
			vec![dicom_destination()],
		);

		let peer: SocketAddr = "192.168.1.5:54821".parse().unwrap();
		let destinations = registry.destinations_for("REMOTE", peer).unwrap();
		assert_eq!(destinations.len(), 1);
	}

	#[test]
	fn lookup_miss_surfaces_no_destination() {
		let registry = AssociationRegistry::new();
		let peer: SocketAddr = "10.0.0.9:11112".parse().unwrap();
		let err = registry.destinations_for("UNKNOWN", peer).unwrap_err();
		assert!(matches!(err, RegistryError::NoDestination(_)));
	}
}
