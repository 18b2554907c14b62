use crate::types::UI;
use dicom::ul::pdu::PDataValueType;
use dicom::ul::Pdu;
use std::future::Future;
use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

/// One accepted (abstract syntax, transfer syntax) pair of an association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
	pub id: u8,
	pub transfer_syntax: UI,
}

/// A proposed presentation context: one abstract syntax with the transfer
/// syntaxes we are willing to accept for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationParameter {
	pub abstract_syntax_uid: UI,
	pub transfer_syntax_uids: Vec<UI>,
}

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error(transparent)]
	Channel(#[from] ChannelError),
	#[error("Failed to spawn association thread")]
	OsThread(std::io::Error),
	#[error("Failed to write P-DATA chunk: {0}")]
	ChunkWriter(std::io::Error),
	#[error("Timed out establishing association")]
	EstablishTimeout,
	#[error(transparent)]
	Association(#[from] dicom::ul::association::client::Error),
}

#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("Timed out")]
	Timeout,
	#[error("Channel is closed")]
	Closed,
}

/// A negotiated DIMSE session. Implementations must release the underlying
/// transport on every exit path, including drop.
pub trait Association: Send + Sync {
	fn receive(
		&self,
		timeout: Duration,
	) -> impl Future<Output = Result<Pdu, AssociationError>> + Send;

	fn send(
		&self,
		pdu: Pdu,
		timeout: Duration,
	) -> impl Future<Output = Result<(), AssociationError>> + Send;

	fn presentation_contexts(&self) -> &[PresentationContext];
}

#[derive(Debug)]
enum Command {
	Send(Pdu, oneshot::Sender<Result<(), AssociationError>>),
	Receive(oneshot::Sender<Result<Pdu, AssociationError>>),
}

/// Request/response messaging over an mpsc channel with a reply oneshot.
pub(crate) trait AskPattern<T> {
	fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T + Send,
		timeout: Duration,
	) -> impl Future<Output = Result<R, ChannelError>> + Send
	where
		R: Send;
}

impl<T: Send> AskPattern<T> for Sender<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T + Send,
		timeout: Duration,
	) -> Result<R, ChannelError>
	where
		R: Send,
	{
		let (tx, rx) = oneshot::channel();
		tokio::time::timeout(timeout, async {
			self.send(command(tx))
				.await
				.map_err(|_| ChannelError::Closed)?;

			rx.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)?
	}
}

pub struct ClientAssociationOptions {
	pub calling_ae_title: String,
	pub called_ae_title: String,
	/// `host:port` of the peer.
	pub address: String,
	pub presentation: Vec<PresentationParameter>,
	pub connection_timeout: Duration,
	pub acse_timeout: Duration,
}

/// An SCU association backed by a dedicated OS thread.
///
/// The `dicom-ul` state machine uses blocking reads and writes, so all
/// protocol I/O runs on its own thread, driven through a command channel.
/// Dropping the handle shuts down the TCP stream, which unblocks the
/// backend thread and ends the association.
pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContext>,
}

type EstablishOutcome = Result<(TcpStream, Vec<PresentationContext>), AssociationError>;

impl ClientAssociation {
	pub async fn establish(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<EstablishOutcome>();

		let negotiation_deadline = options.connection_timeout + options.acse_timeout;
		let address = options.address.clone();
		let mut scu_options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_ae_title)
			.called_ae_title(options.called_ae_title)
			.connection_timeout(options.connection_timeout);
		for parameter in options.presentation {
			scu_options = scu_options.with_presentation_context(
				parameter.abstract_syntax_uid,
				parameter.transfer_syntax_uids,
			);
		}

		thread::Builder::new()
			.name(format!("association-{uuid}"))
			.spawn(move || {
				let mut association = match scu_options.establish_with(&address) {
					Ok(mut association) => {
						let presentation_contexts = association
							.presentation_contexts()
							.iter()
							.map(|pctx| PresentationContext {
								id: pctx.id,
								transfer_syntax: UI::from(&pctx.transfer_syntax),
							})
							.collect();

						let stream = match association.inner_stream().try_clone() {
							Ok(stream) => stream,
							Err(err) => {
								let _ = connect_tx.send(Err(AssociationError::OsThread(err)));
								return;
							}
						};

						if connect_tx
							.send(Ok((stream, presentation_contexts)))
							.is_err()
						{
							// The caller gave up while we negotiated.
							let _ = association.abort();
							return;
						}

						association
					}
					Err(err) => {
						error!(association_uuid = %uuid, "Failed to establish association: {err}");
						let _ = connect_tx.send(Err(err.into()));
						return;
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let delivered = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = Self::chunked_send(&mut association, &pdu);
							reply_to.send(send_result).is_ok()
						}
						Command::Receive(reply_to) => {
							let receive_result =
								association.receive().map_err(AssociationError::from);
							reply_to.send(receive_result).is_ok()
						}
					};
					if !delivered {
						error!(association_uuid = %uuid, "Reply channel closed mid-exchange");
						break;
					}
				}

				rx.close();
				if let Err(err) = association.release() {
					debug!(association_uuid = %uuid, "Failed to release association: {err}");
				}
			})
			.map_err(AssociationError::OsThread)?;

		let established = tokio::time::timeout(negotiation_deadline, connect_result)
			.await
			.map_err(|_| AssociationError::EstablishTimeout)?
			.map_err(|_| ChannelError::Closed)
			.map_err(AssociationError::Channel)?;
		let (tcp_stream, presentation_contexts) = established?;

		debug!(association_uuid = %uuid, "Negotiated new client association");
		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			presentation_contexts,
		})
	}

	pub const fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	/// Sends a PDU, splitting oversized data sets into P-DATA chunks the
	/// acceptor's maximum PDU length allows.
	fn chunked_send(
		association: &mut dicom::ul::ClientAssociation<TcpStream>,
		pdu: &Pdu,
	) -> Result<(), AssociationError> {
		match pdu {
			Pdu::PData { data } => {
				let is_command = data
					.first()
					.is_some_and(|pdv| pdv.value_type == PDataValueType::Command);
				let data_length: usize = data.iter().map(|pdv| pdv.data.len()).sum();
				if !is_command && data_length > association.acceptor_max_pdu_length() as usize {
					for pdv in data {
						let mut writer = association.send_pdata(pdv.presentation_context_id);
						writer
							.write_all(&pdv.data)
							.map_err(AssociationError::ChunkWriter)?;
					}
					Ok(())
				} else {
					association.send(pdu).map_err(AssociationError::from)
				}
			}
			_ => association.send(pdu).map_err(AssociationError::from),
		}
	}
}

impl Association for ClientAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)?
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)?
	}

	fn presentation_contexts(&self) -> &[PresentationContext] {
		&self.presentation_contexts
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				association_uuid = %self.uuid,
				"Failed to shutdown association stream: {err}"
			);
		}
	}
}
