//! Scripted associations for driver and scheduler tests. A mock association
//! replays a fixed list of inbound PDUs and records everything sent to it,
//! so DIMSE exchanges can be exercised without a network peer.

use crate::dimse::association::{
	Association, AssociationError, ChannelError, PresentationContext, PresentationParameter,
};
use crate::dimse::pool::Connector;
use crate::dimse::{DicomMessage, DATA_SET_MISSING};
use crate::server::ServerDescriptor;
use crate::types::US;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) const MOCK_PRESENTATION_CONTEXT_ID: u8 = 1;

type ReceiveHook = Box<dyn Fn(usize) + Send + Sync>;

/// An [`Association`] whose inbound traffic is a pre-recorded script.
#[derive(Default)]
pub(crate) struct MockAssociation {
	responses: Mutex<VecDeque<Pdu>>,
	sent: Mutex<Vec<Pdu>>,
	contexts: Vec<PresentationContext>,
	receive_count: Mutex<usize>,
	on_receive: Option<ReceiveHook>,
}

impl MockAssociation {
	pub(crate) fn new(responses: Vec<Pdu>) -> Self {
		Self {
			responses: Mutex::new(responses.into()),
			sent: Mutex::new(Vec::new()),
			contexts: vec![PresentationContext {
				id: MOCK_PRESENTATION_CONTEXT_ID,
				transfer_syntax: String::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
			}],
			receive_count: Mutex::new(0),
			on_receive: None,
		}
	}

	/// Registers a hook invoked with the 1-based index of each receive,
	/// before the scripted PDU is handed out. Tests use it to trip stop
	/// flags at a precise point in the exchange.
	pub(crate) fn with_receive_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
		self.on_receive = Some(Box::new(hook));
		self
	}

	pub(crate) fn sent_messages(&self) -> Vec<Pdu> {
		self.sent.lock().unwrap().clone()
	}
}

impl Association for MockAssociation {
	async fn receive(&self, _timeout: Duration) -> Result<Pdu, AssociationError> {
		let count = {
			let mut counter = self.receive_count.lock().unwrap();
			*counter += 1;
			*counter
		};
		if let Some(hook) = &self.on_receive {
			hook(count);
		}
		self.responses
			.lock()
			.unwrap()
			.pop_front()
			.ok_or(AssociationError::Channel(ChannelError::Closed))
	}

	async fn send(&self, pdu: Pdu, _timeout: Duration) -> Result<(), AssociationError> {
		self.sent.lock().unwrap().push(pdu);
		Ok(())
	}

	fn presentation_contexts(&self) -> &[PresentationContext] {
		&self.contexts
	}
}

/// What a [`MockConnector`] does when the scheduler asks for an association.
pub(crate) enum MockScript {
	/// Fail the connection attempt, as an unreachable peer would.
	Refuse,
	/// Hand out an association replaying these PDUs.
	Serve(Vec<Pdu>),
}

/// A [`Connector`] replaying one [`MockScript`] per connection attempt.
/// Served associations stay accessible through `served` so tests can
/// inspect the traffic after the exchange.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
	scripts: Arc<Mutex<VecDeque<MockScript>>>,
	pub(crate) connections: Arc<Mutex<usize>>,
	pub(crate) served: Arc<Mutex<Vec<Arc<MockAssociation>>>>,
}

impl MockConnector {
	pub(crate) fn new(scripts: Vec<MockScript>) -> Self {
		Self {
			scripts: Arc::new(Mutex::new(scripts.into())),
			connections: Arc::new(Mutex::new(0)),
			served: Arc::new(Mutex::new(Vec::new())),
		}
	}

	pub(crate) fn connection_count(&self) -> usize {
		*self.connections.lock().unwrap()
	}
}

impl Connector for MockConnector {
	type Conn = Arc<MockAssociation>;

	async fn connect(
		&self,
		_server: &ServerDescriptor,
		_presentation: Vec<PresentationParameter>,
	) -> Result<Self::Conn, AssociationError> {
		*self.connections.lock().unwrap() += 1;
		match self.scripts.lock().unwrap().pop_front() {
			Some(MockScript::Serve(responses)) => {
				let association = Arc::new(MockAssociation::new(responses));
				self.served.lock().unwrap().push(Arc::clone(&association));
				Ok(association)
			}
			Some(MockScript::Refuse) | None => {
				Err(AssociationError::Channel(ChannelError::Closed))
			}
		}
	}
}

impl Association for Arc<MockAssociation> {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.as_ref().receive(timeout).await
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.as_ref().send(pdu, timeout).await
	}

	fn presentation_contexts(&self) -> &[PresentationContext] {
		self.as_ref().presentation_contexts()
	}
}

/// Encodes a message into the P-DATA PDUs a peer would produce for it.
pub(crate) fn encode_message(message: DicomMessage) -> Vec<Pdu> {
	let mut command_buf = Vec::new();
	message
		.command
		.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
		.expect("command set should encode");

	let mut pdus = vec![Pdu::PData {
		data: vec![PDataValue {
			value_type: PDataValueType::Command,
			presentation_context_id: MOCK_PRESENTATION_CONTEXT_ID,
			is_last: true,
			data: command_buf,
		}],
	}];

	if let Some(data) = message.data {
		let mut data_buf = Vec::new();
		data.write_dataset_with_ts(&mut data_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
			.expect("data set should encode");
		pdus.push(Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Data,
				presentation_context_id: MOCK_PRESENTATION_CONTEXT_ID,
				is_last: true,
				data: data_buf,
			}],
		});
	}

	pdus
}

fn response_command(
	command_field: US,
	status: US,
	has_data: bool,
	counters: &[(dicom::core::Tag, US)],
) -> InMemDicomObject {
	let data_set_type = if has_data { 0x0102 } else { DATA_SET_MISSING };
	let mut command = InMemDicomObject::command_from_element_iter([
		DataElement::new(
			tags::AFFECTED_SOP_CLASS_UID,
			VR::UI,
			dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
		),
		DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
		DataElement::new(
			tags::MESSAGE_ID_BEING_RESPONDED_TO,
			VR::US,
			dicom_value!(U16, [1]),
		),
		DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
		DataElement::new(
			tags::COMMAND_DATA_SET_TYPE,
			VR::US,
			dicom_value!(U16, [data_set_type]),
		),
	]);
	for (tag, value) in counters {
		command.put(DataElement::new(*tag, VR::US, dicom_value!(U16, [*value])));
	}
	command
}

/// A pending C-FIND response carrying one identifier.
pub(crate) fn find_pending(identifier: InMemDicomObject) -> Vec<Pdu> {
	encode_message(DicomMessage {
		command: response_command(0x8020, 0xFF00, true, &[]),
		data: Some(identifier),
		presentation_context_id: None,
	})
}

/// The final, empty C-FIND response.
pub(crate) fn find_success() -> Vec<Pdu> {
	encode_message(DicomMessage {
		command: response_command(0x8020, 0x0000, false, &[]),
		data: None,
		presentation_context_id: None,
	})
}

/// A failed C-FIND response (refused/error status).
pub(crate) fn find_failure() -> Vec<Pdu> {
	encode_message(DicomMessage {
		command: response_command(0x8020, 0xA700, false, &[]),
		data: None,
		presentation_context_id: None,
	})
}

fn sub_operation_elements(remaining: US, completed: US) -> Vec<(dicom::core::Tag, US)> {
	vec![
		(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, remaining),
		(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, completed),
	]
}

/// A pending C-MOVE response with progress counters.
pub(crate) fn move_pending(remaining: US, completed: US) -> Vec<Pdu> {
	encode_message(DicomMessage {
		command: response_command(
			0x8021,
			0xFF00,
			false,
			&sub_operation_elements(remaining, completed),
		),
		data: None,
		presentation_context_id: None,
	})
}

/// The final successful C-MOVE response.
pub(crate) fn move_success(completed: US) -> Vec<Pdu> {
	encode_message(DicomMessage {
		command: response_command(0x8021, 0x0000, false, &sub_operation_elements(0, completed)),
		data: None,
		presentation_context_id: None,
	})
}

/// A C-STORE-RQ sub-operation as it arrives mid C-GET.
pub(crate) fn inbound_store(sop_instance_uid: &str, data: InMemDicomObject) -> Vec<Pdu> {
	let command = InMemDicomObject::command_from_element_iter([
		DataElement::new(
			tags::AFFECTED_SOP_CLASS_UID,
			VR::UI,
			dicom_value!(Str, uids::CT_IMAGE_STORAGE),
		),
		DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
		DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [7])),
		DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
		DataElement::new(
			tags::COMMAND_DATA_SET_TYPE,
			VR::US,
			dicom_value!(U16, [0x0102]),
		),
		DataElement::new(
			tags::AFFECTED_SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, sop_instance_uid),
		),
	]);

	encode_message(DicomMessage {
		command,
		data: Some(data),
		presentation_context_id: None,
	})
}

/// The final successful C-GET response.
pub(crate) fn get_success(completed: US) -> Vec<Pdu> {
	encode_message(DicomMessage {
		command: response_command(0x8010, 0x0000, false, &sub_operation_elements(0, completed)),
		data: None,
		presentation_context_id: None,
	})
}

/// A successful C-ECHO response.
pub(crate) fn echo_success() -> Vec<Pdu> {
	encode_message(DicomMessage {
		command: response_command(0x8030, 0x0000, false, &[]),
		data: None,
		presentation_context_id: None,
	})
}

/// An identifier with the attributes tests commonly assert on.
pub(crate) fn identifier_with(pairs: &[(dicom::core::Tag, &str)]) -> InMemDicomObject {
	let mut object = InMemDicomObject::new_empty();
	for (tag, value) in pairs {
		object.put(DataElement::new(*tag, VR::UI, PrimitiveValue::from(*value)));
	}
	object
}

/// Decodes the PDUs a driver sent back into messages, for assertions.
pub(crate) fn decode_sent(pdus: &[Pdu]) -> Vec<InMemDicomObject> {
	pdus.iter()
		.filter_map(|pdu| match pdu {
			Pdu::PData { data } => data.first(),
			_ => None,
		})
		.map(|pdv| {
			InMemDicomObject::read_dataset_with_ts(
				pdv.data.as_slice(),
				&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
			)
			.expect("sent PDU should decode")
		})
		.collect()
}
