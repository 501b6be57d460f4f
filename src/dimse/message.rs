//! C-STORE-RQ / C-STORE-RSP command set construction.

use super::{DicomMessage, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{Priority, AE, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;

/// `(0000,0100) CommandField` value identifying a C-STORE-RQ.
pub const COMMAND_FIELD_C_STORE_RQ: US = 0x0001;
/// `(0000,0100) CommandField` value identifying a C-STORE-RSP.
pub const COMMAND_FIELD_C_STORE_RSP: US = 0x8001;

/// C-STORE-RQ: the request half of one instance transfer.
pub struct CStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub message_id: US,
	pub priority: Priority,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
	pub data_set: InMemDicomObject,
}

impl From<CStoreRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CStoreRequest) -> Self {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_STORE_RQ])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority as u16])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
		]);

		if let Some(aet) = request.move_originator_aet {
			command.put_element(DataElement::new(
				tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
				VR::AE,
				dicom_value!(Str, aet),
			));
		}
		if let Some(message_id) = request.move_originator_message_id {
			command.put_element(DataElement::new(
				tags::MOVE_ORIGINATOR_MESSAGE_ID,
				VR::US,
				dicom_value!(U16, [message_id]),
			));
		}

		Self {
			command,
			data: Some(request.data_set),
			presentation_context_id: None,
		}
	}
}

/// C-STORE-RSP, as read off the wire. `status` is the raw 16-bit DIMSE
/// status code; classification into success/warning/failure is
/// [`crate::types::Status::classify`]'s job.
#[derive(Debug, Clone)]
pub struct CStoreResponse {
	pub message_id_being_responded_to: US,
	pub affected_sop_instance_uid: UI,
	pub status: US,
}

impl CStoreResponse {
	pub fn from_command(command: &InMemDicomObject) -> Option<Self> {
		let message_id_being_responded_to = command
			.get(tags::MESSAGE_ID_BEING_RESPONDED_TO)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)?;
		let status = command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)?;
		let affected_sop_instance_uid = command
			.get(tags::AFFECTED_SOP_INSTANCE_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|cow| UI::from(cow.into_owned()))
			.unwrap_or_default();

		Some(Self {
			message_id_being_responded_to,
			affected_sop_instance_uid,
			status,
		})
	}
}

/// The inbound SCP's reply to a received C-STORE-RQ.
pub struct CStoreResponseMessage {
	pub message_id_being_responded_to: US,
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub status: US,
}

impl From<CStoreResponseMessage> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CStoreResponseMessage) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_STORE_RSP])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id_being_responded_to])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.affected_sop_instance_uid)),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}
