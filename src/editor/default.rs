use super::uid::hash_uid;
use super::{AttributeEditorContext, Editor};
use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::{InMemDicomObject, Tag};

/// The set of UID-valued tags the pseudonymizer is allowed to rewrite.
const SUPPORTED_UID_TAGS: &[Tag] = &[
	tags::STUDY_INSTANCE_UID,
	tags::SERIES_INSTANCE_UID,
	tags::SOP_INSTANCE_UID,
	tags::AFFECTED_SOP_INSTANCE_UID,
	tags::FAILED_SOP_INSTANCE_UID_LIST,
	tags::MEDIA_STORAGE_SOP_INSTANCE_UID,
	tags::REFERENCED_SOP_INSTANCE_UID,
	tags::REFERENCED_SOP_INSTANCE_UID_IN_FILE,
	tags::REQUESTED_SOP_INSTANCE_UID,
	tags::MULTI_FRAME_SOURCE_SOP_INSTANCE_UID,
];

/// The bundled editor, configured per destination:
/// - `generate_uids` rehashes every UI-VR element in
///   [`SUPPORTED_UID_TAGS`] via HMAC-SHA256 keyed by `session_key`.
/// - `tag_to_override`, if set, is applied afterwards with
///   overwrite-if-present, non-recursive semantics: UID regeneration runs
///   first so an override can deterministically pin a tag to a fixed value.
pub struct DefaultEditor {
	pub generate_uids: bool,
	pub session_key: Vec<u8>,
	pub tag_to_override: Option<InMemDicomObject>,
}

impl DefaultEditor {
	pub fn new(session_key: Vec<u8>) -> Self {
		Self {
			generate_uids: false,
			session_key,
			tag_to_override: None,
		}
	}

	pub const fn with_generate_uids(mut self, generate_uids: bool) -> Self {
		self.generate_uids = generate_uids;
		self
	}

	pub fn with_tag_to_override(mut self, overrides: InMemDicomObject) -> Self {
		self.tag_to_override = Some(overrides);
		self
	}

	fn regenerate_uids(&self, dataset: &mut InMemDicomObject) {
		for &tag in SUPPORTED_UID_TAGS {
			let Some(element) = dataset.element(tag).ok() else {
				continue;
			};
			if element.header().vr() != VR::UI {
				continue;
			}
			let Ok(original) = element.to_str() else {
				continue;
			};
			let rehashed = hash_uid(&self.session_key, original.trim_end_matches('\0'));
			dataset
				.update_value(tag, |value| {
					*value = dicom::core::PrimitiveValue::from(rehashed.clone());
				})
				.ok();
		}
	}

	/// Overwrite-if-present: every top-level element in the override set
	/// replaces the dataset's element of the same tag wholesale (a
	/// sequence's items are not merged item-by-item, the whole sequence is
	/// replaced).
	fn apply_overrides(dataset: &mut InMemDicomObject, overrides: &InMemDicomObject) {
		for element in overrides {
			dataset.put(element.clone());
		}
	}
}

impl Editor for DefaultEditor {
	fn apply(&self, dataset: &mut InMemDicomObject, _context: &mut AttributeEditorContext) {
		if self.generate_uids {
			self.regenerate_uids(dataset);
		}
		if let Some(overrides) = &self.tag_to_override {
			Self::apply_overrides(dataset, overrides);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::editor::apply_pipeline;
	use crate::node::DicomNode;
	use dicom::core::header::Header;
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;

	fn dataset_with_study_uid(uid: &str) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, uid),
		)])
	}

	#[test]
	fn generate_uids_rewrites_supported_tags_deterministically() {
		let editor: std::sync::Arc<dyn Editor> =
			std::sync::Arc::new(DefaultEditor::new(b"key".to_vec()).with_generate_uids(true));
		let mut a = dataset_with_study_uid("1.2.3.4");
		let mut b = dataset_with_study_uid("1.2.3.4");
		let mut context =
			AttributeEditorContext::new("1.2.840.10008.1.2.1", DicomNode::new("A"), DicomNode::new("B"));

		apply_pipeline(&[editor], &mut a, &mut context);
		let editor2: std::sync::Arc<dyn Editor> =
			std::sync::Arc::new(DefaultEditor::new(b"key".to_vec()).with_generate_uids(true));
		apply_pipeline(&[editor2], &mut b, &mut context);

		let a_uid = a.element(tags::STUDY_INSTANCE_UID).unwrap().to_str().unwrap();
		let b_uid = b.element(tags::STUDY_INSTANCE_UID).unwrap().to_str().unwrap();
		assert_eq!(a_uid, b_uid);
		assert_ne!(a_uid, "1.2.3.4");
	}

	#[test]
	fn override_runs_after_uid_regeneration_and_wins() {
		let overrides = InMemDicomObject::from_element_iter([DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, "1.2.840.10008.1"),
		)]);
		let editor: std::sync::Arc<dyn Editor> = std::sync::Arc::new(
			DefaultEditor::new(b"key".to_vec())
				.with_generate_uids(true)
				.with_tag_to_override(overrides),
		);
		let mut dataset = dataset_with_study_uid("1.2.3.4");
		let mut context =
			AttributeEditorContext::new("1.2.840.10008.1.2.1", DicomNode::new("A"), DicomNode::new("B"));
		apply_pipeline(&[editor], &mut dataset, &mut context);

		let uid = dataset.element(tags::STUDY_INSTANCE_UID).unwrap().to_str().unwrap();
		assert_eq!(uid, "1.2.840.10008.1");
	}
}
