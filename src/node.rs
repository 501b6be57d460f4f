use crate::types::AE;
use serde::Deserialize;

/// The identity of a DICOM peer.
///
/// Two nodes are equal iff AET, hostname and port all match. [`DicomNode::without_port`]
/// produces a lookup key that ignores the port, used by the [`crate::registry::AssociationRegistry`]
/// so a peer connecting from an ephemeral source port still matches a
/// configured AET+hostname entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DicomNode {
	pub aet: AE,
	#[serde(default)]
	pub hostname: Option<String>,
	#[serde(default)]
	pub port: Option<u16>,
	#[serde(default)]
	pub validate_hostname: bool,
}

impl DicomNode {
	pub fn new(aet: impl Into<AE>) -> Self {
		Self {
			aet: aet.into(),
			hostname: None,
			port: None,
			validate_hostname: false,
		}
	}

	pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
		self.hostname = Some(hostname.into());
		self
	}

	pub fn with_port(mut self, port: u16) -> Self {
		self.port = Some(port);
		self
	}

	/// A copy of this node with the port cleared, used as a registry lookup
	/// key so an ephemeral source port does not prevent a match.
	#[must_use]
	pub fn without_port(&self) -> Self {
		Self {
			port: None,
			..self.clone()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn without_port_clears_only_port() {
		let node = DicomNode::new("REMOTE").with_hostname("10.0.0.1").with_port(104);
		let key = node.without_port();
		assert_eq!(key.aet, "REMOTE");
		assert_eq!(key.hostname.as_deref(), Some("10.0.0.1"));
		assert_eq!(key.port, None);
	}

	#[test]
	fn equality_requires_aet_hostname_and_port() {
		let a = DicomNode::new("AE1").with_hostname("host").with_port(104);
		let b = DicomNode::new("AE1").with_hostname("host").with_port(105);
		assert_ne!(a, b);
	}
}
