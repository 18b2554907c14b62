//! The DIMSE layer: message framing over an [`Association`], plus the
//! composite service codecs (C-ECHO, C-FIND, C-GET, C-MOVE) the drivers
//! are built on.

pub mod association;
pub mod cecho;
pub mod cfind;
pub mod cget;
pub mod cmove;
pub mod pool;

#[cfg(test)]
pub(crate) mod testing;

use crate::types::{UI, US};
use association::{Association, AssociationError};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Value of [`tags::COMMAND_DATA_SET_TYPE`] announcing that a data set
/// follows the command set.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Value of [`tags::COMMAND_DATA_SET_TYPE`] for messages without a data
/// set (DICOM NULL). Peers are free to use other truthy values for the
/// existing case, so readers compare against this constant only.
pub const DATA_SET_MISSING: US = 0x0101;

/// A DICOM message: a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
#[derive(Debug)]
pub struct DicomMessage {
	pub command: InMemDicomObject,
	pub data: Option<InMemDicomObject>,
	/// Presentation context the message arrived on (set by the reader).
	pub presentation_context_id: Option<u8>,
}

impl DicomMessage {
	/// The Command Field (0000,0100) value, identifying the DIMSE primitive.
	pub fn command_field(&self) -> Result<US, ReadError> {
		element_u16(&self.command, tags::COMMAND_FIELD)
			.ok_or(ReadError::MissingAttribute(tags::COMMAND_FIELD))
	}

	/// The Status (0000,0900) value of a response message.
	pub fn status(&self) -> Result<US, ReadError> {
		element_u16(&self.command, tags::STATUS).ok_or(ReadError::MissingAttribute(tags::STATUS))
	}
}

/// Status categories of DIMSE response codes.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<US> for StatusType {
	type Error = US;

	fn try_from(value: US) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF => Ok(Self::Failure),
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

impl StatusType {
	pub fn of(message: &DicomMessage) -> Self {
		message
			.status()
			.ok()
			.and_then(|status| Self::try_from(status).ok())
			.unwrap_or(Self::Failure)
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Box<Pdu>),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error("No presentation context accepted for this message")]
	NoPresentationContext,
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
}

/// Sends a DICOM message over an association: the command set on the
/// selected presentation context (always implicit VR little endian), then
/// the data set in the context's negotiated transfer syntax.
pub async fn write_message<A: Association>(
	association: &A,
	message: impl Into<DicomMessage>,
	presentation_context_id: Option<u8>,
	timeout: Duration,
) -> Result<(), WriteError> {
	let message: DicomMessage = message.into();

	let presentation_context = match presentation_context_id {
		None => association.presentation_contexts().first(),
		Some(id) => association
			.presentation_contexts()
			.iter()
			.find(|pctx| pctx.id == id),
	}
	.ok_or(WriteError::NoPresentationContext)?;

	let mut command_buf = Vec::new();
	message
		.command
		.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

	let command_pdu = Pdu::PData {
		data: vec![PDataValue {
			value_type: PDataValueType::Command,
			presentation_context_id: presentation_context.id,
			is_last: true,
			data: command_buf,
		}],
	};
	association.send(command_pdu, timeout).await?;
	trace!(pctx = presentation_context.id, "Sent command set");

	if let Some(data) = message.data {
		let transfer_syntax = TransferSyntaxRegistry
			.get(&presentation_context.transfer_syntax)
			.ok_or_else(|| {
				WriteError::UnknownTransferSyntax(UI::from(&presentation_context.transfer_syntax))
			})?;
		let mut data_buf = Vec::new();
		data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;

		let data_pdu = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Data,
				presentation_context_id: presentation_context.id,
				is_last: true,
				data: data_buf,
			}],
		};
		association.send(data_pdu, timeout).await?;
		trace!(pctx = presentation_context.id, "Sent data set");
	}

	Ok(())
}

/// Reads one DICOM message from an association, reassembling command and
/// data fragments. Returns as soon as the command set announces that no
/// data set follows.
pub async fn read_message<A: Association>(
	association: &A,
	timeout: Duration,
) -> Result<DicomMessage, ReadError> {
	let mut command_fragments = Vec::new();
	let mut data_fragments = Vec::new();
	let mut message_command: Option<InMemDicomObject> = None;

	loop {
		let pdu = association.receive(timeout).await?;
		let Pdu::PData { data } = pdu else {
			return Err(ReadError::UnexpectedPdu(Box::new(pdu)));
		};

		for mut pdv in data {
			match pdv.value_type {
				PDataValueType::Command => {
					trace!("Received command fragment (last={})", pdv.is_last);
					if message_command.is_some() {
						// The command set is already complete; another
						// command fragment cannot belong to this message.
						return Err(ReadError::OutOfOrder);
					}
					command_fragments.append(&mut pdv.data);
					if pdv.is_last {
						let command = InMemDicomObject::read_dataset_with_ts(
							command_fragments.as_slice(),
							&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
						)?;
						let has_data_set = element_u16(&command, tags::COMMAND_DATA_SET_TYPE)
							.is_some_and(|value| value != DATA_SET_MISSING);

						if has_data_set {
							message_command = Some(command);
						} else {
							return Ok(DicomMessage {
								command,
								data: None,
								presentation_context_id: Some(pdv.presentation_context_id),
							});
						}
					}
				}
				PDataValueType::Data => {
					trace!("Received data fragment (last={})", pdv.is_last);
					if message_command.is_none() {
						return Err(ReadError::OutOfOrder);
					}
					data_fragments.append(&mut pdv.data);
					if pdv.is_last {
						let presentation_context = association
							.presentation_contexts()
							.iter()
							.find(|pctx| pctx.id == pdv.presentation_context_id)
							.ok_or_else(|| {
								ReadError::UnknownTransferSyntax(UI::from("<unnegotiated context>"))
							})?;
						let transfer_syntax = TransferSyntaxRegistry
							.get(&presentation_context.transfer_syntax)
							.ok_or_else(|| {
								ReadError::UnknownTransferSyntax(UI::from(
									&presentation_context.transfer_syntax,
								))
							})?;
						let data = InMemDicomObject::read_dataset_with_ts(
							data_fragments.as_slice(),
							transfer_syntax,
						)?;

						return Ok(DicomMessage {
							command: message_command.expect("command set was received"),
							data: Some(data),
							presentation_context_id: Some(pdv.presentation_context_id),
						});
					}
				}
			}
		}
	}
}

/// Convenience accessor for an unsigned short command/identifier element.
pub(crate) fn element_u16(object: &InMemDicomObject, tag: Tag) -> Option<US> {
	object
		.get(tag)
		.map(InMemElement::to_int::<US>)
		.and_then(Result::ok)
}

/// Convenience accessor for a string element, with padding stripped.
pub(crate) fn element_str(object: &InMemDicomObject, tag: Tag) -> Option<String> {
	object
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim_end_matches(['\0', ' ']).to_string())
}

/// Returns a new message id by incrementing a process-global counter.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(1);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

/// A presentation context negotiated with every Query/Retrieve SCU in this
/// crate: explicit little endian preferred, then explicit big endian, then
/// the implicit default.
pub fn standard_transfer_syntaxes() -> Vec<UI> {
	use dicom::dictionary_std::uids;
	vec![
		UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
		UI::from(uids::EXPLICIT_VR_BIG_ENDIAN),
		UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
	]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_ranges_follow_part7() {
		assert_eq!(StatusType::try_from(0x0000), Ok(StatusType::Success));
		assert_eq!(StatusType::try_from(0xFF00), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xFF01), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xFE00), Ok(StatusType::Cancel));
		assert_eq!(StatusType::try_from(0xA700), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xB000), Ok(StatusType::Warning));
		assert_eq!(StatusType::try_from(0xC123), Err(0xC123));
	}

	#[test]
	fn message_ids_are_unique() {
		let first = next_message_id();
		let second = next_message_id();
		assert_ne!(first, second);
	}
}
