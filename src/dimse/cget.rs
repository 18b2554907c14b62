use crate::dimse::association::PresentationParameter;
use crate::dimse::cmove::SubOperationCounts;
use crate::dimse::{element_str, DicomMessage, ReadError, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;

use super::standard_transfer_syntaxes;

pub const COMMAND_FIELD_COMPOSITE_GET_REQUEST: US = 0x0010;
pub const COMMAND_FIELD_COMPOSITE_GET_RESPONSE: US = 0x8010;
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// C-GET-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.3.html>
pub struct CompositeGetRequest {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
}

impl From<CompositeGetRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeGetRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_GET_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// C-GET-RSP
#[derive(Debug)]
pub struct CompositeGetResponse {
	pub status: US,
	pub sub_operations: SubOperationCounts,
}

impl TryFrom<DicomMessage> for CompositeGetResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message.status()?;
		Ok(Self {
			status,
			sub_operations: SubOperationCounts::of(&message),
		})
	}
}

/// A C-STORE-RQ sub-operation received on the requester's association
/// during a C-GET transfer.
#[derive(Debug)]
pub struct InboundStoreRequest {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub presentation_context_id: Option<u8>,
	pub data: InMemDicomObject,
}

impl TryFrom<DicomMessage> for InboundStoreRequest {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let message_id = crate::dimse::element_u16(&message.command, tags::MESSAGE_ID)
			.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))?;
		let sop_class_uid = element_str(&message.command, tags::AFFECTED_SOP_CLASS_UID)
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?;
		let sop_instance_uid = element_str(&message.command, tags::AFFECTED_SOP_INSTANCE_UID)
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_INSTANCE_UID))?;
		let data = message
			.data
			.ok_or(ReadError::MissingAttribute(tags::COMMAND_DATA_SET_TYPE))?;

		Ok(Self {
			message_id,
			sop_class_uid,
			sop_instance_uid,
			presentation_context_id: message.presentation_context_id,
			data,
		})
	}
}

/// C-STORE-RSP acknowledging one received sub-operation.
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

/// Storage SOP classes proposed alongside the retrieve context so that the
/// peer can send instances back on the same association. The list covers
/// the common image objects; exotic SOP classes fall back to a C-MOVE
/// server configuration.
pub fn storage_presentation_parameters() -> Vec<PresentationParameter> {
	const STORAGE_SOP_CLASSES: [&str; 10] = [
		uids::CT_IMAGE_STORAGE,
		uids::ENHANCED_CT_IMAGE_STORAGE,
		uids::MR_IMAGE_STORAGE,
		uids::ENHANCED_MR_IMAGE_STORAGE,
		uids::ULTRASOUND_IMAGE_STORAGE,
		uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
		uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
		uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
		uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
		uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
	];

	STORAGE_SOP_CLASSES
		.iter()
		.map(|sop_class| PresentationParameter {
			abstract_syntax_uid: UI::from(*sop_class),
			transfer_syntax_uids: standard_transfer_syntaxes(),
		})
		.collect()
}
