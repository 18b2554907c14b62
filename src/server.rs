use crate::types::AE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol used to retrieve instances from a server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrieveProtocol {
	/// C-GET: instances arrive on the same association as the request.
	#[serde(rename = "CGET")]
	Get,
	/// C-MOVE: the peer pushes instances to a named destination AE over a
	/// separate association.
	#[serde(rename = "CMOVE")]
	Move,
}

impl Default for RetrieveProtocol {
	fn default() -> Self {
		Self::Get
	}
}

/// Immutable endpoint configuration for one remote application entity.
///
/// A descriptor never changes once registered with the scheduler; replacing
/// one requires quiescing the worker pool first (see
/// [`Scheduler::add_server`](crate::Scheduler::add_server)).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerDescriptor {
	/// Unique key of this server within the scheduler.
	pub connection_name: String,
	/// The AE title by which the peer recognizes our requests.
	pub calling_ae_title: AE,
	/// The AE title of the service we are calling on the peer.
	pub called_ae_title: AE,
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub retrieve_protocol: RetrieveProtocol,
	/// Destination AE for C-MOVE transfers. Required iff
	/// `retrieve_protocol` is [`RetrieveProtocol::Move`]; the peer must know
	/// this AE and be able to open an association towards it.
	#[serde(default)]
	pub move_destination_ae_title: Option<AE>,
	/// Reuse the association of a previous task against this server instead
	/// of negotiating a fresh one per exchange.
	#[serde(default = "default_true")]
	pub keep_association_open: bool,
	/// Whether this server participates in query/retrieve fan-out.
	#[serde(default = "default_true")]
	pub query_retrieve_enabled: bool,
	/// Whether this server accepts instances we store to it.
	#[serde(default)]
	pub storage_enabled: bool,
	/// A query/retrieve-capable proxy. When set on a C-MOVE server, the
	/// scheduler chains a follow-up C-GET against the proxy once the move
	/// completes.
	#[serde(default)]
	pub proxy_server: Option<Box<ServerDescriptor>>,
}

const fn default_true() -> bool {
	true
}

/// The longest AE title permitted by PS3.5 (VR of AE).
const MAX_AE_TITLE_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum ServerDescriptorError {
	#[error("'{0}' exceeds the 16 character limit for AE titles")]
	AeTitleTooLong(String),
	#[error("server '{0}' uses C-MOVE but has no move destination AE title")]
	MissingMoveDestination(String),
}

impl ServerDescriptor {
	/// The `host:port` form accepted by the association layer.
	pub fn address(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	pub fn validate(&self) -> Result<(), ServerDescriptorError> {
		for aet in [&self.calling_ae_title, &self.called_ae_title]
			.into_iter()
			.chain(self.move_destination_ae_title.as_ref())
		{
			if aet.len() > MAX_AE_TITLE_LENGTH {
				return Err(ServerDescriptorError::AeTitleTooLong(aet.clone()));
			}
		}

		if self.retrieve_protocol == RetrieveProtocol::Move
			&& self.move_destination_ae_title.is_none()
		{
			return Err(ServerDescriptorError::MissingMoveDestination(
				self.connection_name.clone(),
			));
		}

		if let Some(proxy) = &self.proxy_server {
			proxy.validate()?;
		}

		Ok(())
	}
}

#[cfg(test)]
pub(crate) fn test_descriptor(name: &str, protocol: RetrieveProtocol) -> ServerDescriptor {
	ServerDescriptor {
		connection_name: String::from(name),
		calling_ae_title: AE::from("SCHEDULER"),
		called_ae_title: AE::from("PACS"),
		host: String::from("pacs.example"),
		port: 11112,
		retrieve_protocol: protocol,
		move_destination_ae_title: None,
		keep_association_open: true,
		query_retrieve_enabled: true,
		storage_enabled: false,
		proxy_server: None,
	}
}
