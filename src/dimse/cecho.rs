use crate::dimse::association::Association;
use crate::dimse::{
	next_message_id, read_message, write_message, DicomMessage, ReadError, StatusType, WriteError,
	DATA_SET_MISSING,
};
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

pub const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: US = 0x0030;
pub const COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE: US = 0x8030;

/// C-ECHO-RQ
#[derive(Debug)]
pub struct CompositeEchoRequest {
	pub message_id: US,
}

impl From<CompositeEchoRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeEchoRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

/// Service class user for the Verification SOP class: sends a C-ECHO-RQ
/// and reports whether the peer answered with a success status.
pub struct EchoServiceClassUser<'a, A: Association> {
	association: &'a A,
}

impl<'a, A: Association> EchoServiceClassUser<'a, A> {
	pub const fn new(association: &'a A) -> Self {
		Self { association }
	}

	pub async fn echo(&self, timeout: Duration) -> Result<bool, EchoError> {
		trace!("Initiated C-ECHO protocol");
		let request = CompositeEchoRequest {
			message_id: next_message_id(),
		};
		write_message(self.association, request, None, timeout).await?;

		let response = read_message(self.association, timeout).await?;
		let status = response.status()?;
		let status_type = StatusType::try_from(status).unwrap_or(StatusType::Failure);
		debug!(status, "Received C-ECHO-RSP ({status_type:?})");

		Ok(status_type == StatusType::Success)
	}
}

#[derive(Debug, Error)]
pub enum EchoError {
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Read(#[from] ReadError),
}
