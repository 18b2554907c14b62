use crate::dimse::{element_u16, DicomMessage, ReadError, DATA_SET_EXISTS};
use crate::types::{AE, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;

pub const COMMAND_FIELD_COMPOSITE_MOVE_REQUEST: US = 0x0021;
pub const COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE: US = 0x8021;

/// C-MOVE-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.4.html>
pub struct CompositeMoveRequest {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	/// The AE the peer opens its store association towards.
	pub destination: AE,
}

impl From<CompositeMoveRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeMoveRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination)),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// Progress counters a retrieve response may carry.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.4.2.html>
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubOperationCounts {
	pub remaining: Option<US>,
	pub completed: Option<US>,
	pub failed: Option<US>,
	pub warning: Option<US>,
}

impl SubOperationCounts {
	pub fn of(message: &DicomMessage) -> Self {
		Self {
			remaining: element_u16(&message.command, tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
			completed: element_u16(&message.command, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
			failed: element_u16(&message.command, tags::NUMBER_OF_FAILED_SUBOPERATIONS),
			warning: element_u16(&message.command, tags::NUMBER_OF_WARNING_SUBOPERATIONS),
		}
	}

	/// Completion in percent, when the peer reports counters.
	pub fn percent(&self) -> Option<u8> {
		let completed = u32::from(self.completed?);
		let remaining = u32::from(self.remaining?);
		let total = completed + remaining;
		if total == 0 {
			return None;
		}
		u8::try_from(completed * 100 / total).ok()
	}
}

/// C-MOVE-RSP
#[derive(Debug)]
pub struct CompositeMoveResponse {
	pub status: US,
	pub sub_operations: SubOperationCounts,
}

impl TryFrom<DicomMessage> for CompositeMoveResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message.status()?;
		Ok(Self {
			status,
			sub_operations: SubOperationCounts::of(&message),
		})
	}
}
