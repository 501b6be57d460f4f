//! The Attribute Editor Pipeline: an ordered
//! list of [`Editor`]s applied to a parsed dataset in place. The first
//! editor to request an abort short-circuits the remaining editors.

pub mod default;
pub mod uid;

use crate::node::DicomNode;
use crate::types::UI;
use dicom::object::InMemDicomObject;
use std::collections::HashMap;

pub use default::DefaultEditor;

/// A region of a decoded frame to black out before re-encoding, in pixel
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskArea {
	pub x: u32,
	pub y: u32,
	pub width: u32,
	pub height: u32,
}

/// Why, if at all, the pipeline or transcoder should stop processing this
/// instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Abort {
	#[default]
	None,
	/// Skip this instance for this destination only; the batch continues.
	FileException(String),
	/// Skip all destinations for this instance and release the inbound
	/// association; the only abort kind that escapes the engine.
	ConnectionException(String),
}

impl Abort {
	pub const fn is_none(&self) -> bool {
		matches!(self, Self::None)
	}
}

/// Per-instance-transfer context threaded through the editor pipeline and
/// the transcoder.
#[derive(Debug, Clone)]
pub struct AttributeEditorContext {
	pub tsuid: UI,
	pub source_node: DicomNode,
	pub destination_node: DicomNode,
	pub abort: Abort,
	pub mask_area: Option<MaskArea>,
	pub properties: HashMap<String, String>,
}

impl AttributeEditorContext {
	pub fn new(tsuid: impl Into<UI>, source_node: DicomNode, destination_node: DicomNode) -> Self {
		Self {
			tsuid: tsuid.into(),
			source_node,
			destination_node,
			abort: Abort::None,
			mask_area: None,
			properties: HashMap::new(),
		}
	}
}

/// A single step of the attribute editor pipeline. Implementations mutate
/// the dataset in place and signal a requested abort through
/// `context.abort` rather than through `Result` — editors do not fail,
/// except on programming errors.
pub trait Editor: Send + Sync {
	fn apply(&self, dataset: &mut InMemDicomObject, context: &mut AttributeEditorContext);
}

/// Runs `editors` over `dataset` in order, stopping as soon as one editor
/// sets `context.abort` to something other than [`Abort::None`].
///
/// Editors are held behind `Arc` rather than `Box` because a
/// [`crate::destination::ForwardDestination`]'s editor chain is shared
/// across every inbound association that forwards to it.
pub fn apply_pipeline(
	editors: &[std::sync::Arc<dyn Editor>],
	dataset: &mut InMemDicomObject,
	context: &mut AttributeEditorContext,
) {
	for editor in editors {
		editor.apply(dataset, context);
		if !context.abort.is_none() {
			break;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::InMemDicomObject;

	struct AbortingEditor(Abort);
	impl Editor for AbortingEditor {
		fn apply(&self, _dataset: &mut InMemDicomObject, context: &mut AttributeEditorContext) {
			context.abort = self.0.clone();
		}
	}

	struct MarkerEditor(std::sync::Arc<std::sync::atomic::AtomicBool>);
	impl Editor for MarkerEditor {
		fn apply(&self, _dataset: &mut InMemDicomObject, _context: &mut AttributeEditorContext) {
			self.0.store(true, std::sync::atomic::Ordering::SeqCst);
		}
	}

	#[test]
	fn abort_short_circuits_later_editors() {
		let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
		let editors: Vec<std::sync::Arc<dyn Editor>> = vec![
			std::sync::Arc::new(AbortingEditor(Abort::FileException(String::from("nope")))),
			std::sync::Arc::new(MarkerEditor(ran.clone())),
		];
		let mut dataset = InMemDicomObject::new_empty();
		let mut context = AttributeEditorContext::new(
			"1.2.840.10008.1.2.1",
			DicomNode::new("A"),
			DicomNode::new("B"),
		);
		apply_pipeline(&editors, &mut dataset, &mut context);
		assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
		assert!(matches!(context.abort, Abort::FileException(_)));
	}

	#[test]
	fn no_abort_runs_every_editor() {
		let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
		let editors: Vec<std::sync::Arc<dyn Editor>> = vec![std::sync::Arc::new(MarkerEditor(ran.clone()))];
		let mut dataset = InMemDicomObject::new_empty();
		let mut context = AttributeEditorContext::new(
			"1.2.840.10008.1.2.1",
			DicomNode::new("A"),
			DicomNode::new("B"),
		);
		apply_pipeline(&editors, &mut dataset, &mut context);
		assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
		assert!(context.abort.is_none());
	}
}
