use crate::dimse::association::{
	Association, AssociationError, ClientAssociation, ClientAssociationOptions,
	PresentationContext, PresentationParameter,
};
use crate::dimse::cecho::EchoServiceClassUser;
use crate::server::ServerDescriptor;
use crate::types::UI;
use dicom::dictionary_std::uids;
use dicom::ul::Pdu;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Creates associations for tasks. The scheduler is generic over this seam
/// so tests can substitute scripted associations for real TCP peers.
pub trait Connector: Clone + Send + Sync + 'static {
	type Conn: Association + Send + Sync + 'static;

	fn connect(
		&self,
		server: &ServerDescriptor,
		presentation: Vec<PresentationParameter>,
	) -> impl Future<Output = Result<Self::Conn, AssociationError>> + Send;
}

/// The production connector: negotiates DIMSE associations over TCP and,
/// for servers with `keep_association_open`, parks released associations
/// for reuse by the next task against the same server and abstract syntax.
#[derive(Clone)]
pub struct DimseConnector {
	inner: Arc<InnerPool>,
}

struct InnerPool {
	connection_timeout: Duration,
	acse_timeout: Duration,
	/// Idle associations, keyed by connection name and the abstract syntax
	/// they were negotiated for.
	slots: Mutex<HashMap<SlotKey, Vec<ClientAssociation>>>,
}

type SlotKey = (String, UI);

/// How long a reused association may take to answer the C-ECHO liveness
/// probe before it is discarded.
const RECYCLE_TIMEOUT: Duration = Duration::from_secs(5);

impl DimseConnector {
	pub fn new(connection_timeout: Duration, acse_timeout: Duration) -> Self {
		Self {
			inner: Arc::new(InnerPool {
				connection_timeout,
				acse_timeout,
				slots: Mutex::new(HashMap::new()),
			}),
		}
	}

	fn take_idle(&self, key: &SlotKey) -> Option<ClientAssociation> {
		let mut slots = self.inner.slots.lock().expect("pool mutex should not be poisoned");
		slots.get_mut(key).and_then(Vec::pop)
	}

	/// Validates a parked association with a C-ECHO before handing it out.
	async fn recycle(&self, association: &ClientAssociation) -> Result<(), AssociationError> {
		let alive = EchoServiceClassUser::new(association)
			.echo(RECYCLE_TIMEOUT)
			.await
			.map_err(|err| {
				warn!("Recycling check failed: {err}");
				AssociationError::Channel(crate::dimse::association::ChannelError::Closed)
			})?;

		if alive {
			debug!(association_uuid = %association.uuid(), "Recycled idle association");
			Ok(())
		} else {
			warn!(association_uuid = %association.uuid(), "Idle association rejected C-ECHO");
			Err(AssociationError::Channel(
				crate::dimse::association::ChannelError::Closed,
			))
		}
	}
}

impl Connector for DimseConnector {
	type Conn = PooledAssociation;

	async fn connect(
		&self,
		server: &ServerDescriptor,
		mut presentation: Vec<PresentationParameter>,
	) -> Result<Self::Conn, AssociationError> {
		let abstract_syntax = presentation
			.first()
			.map_or_else(UI::new, |parameter| parameter.abstract_syntax_uid.clone());
		let key = (server.connection_name.clone(), abstract_syntax);

		if server.keep_association_open {
			// Negotiate Verification alongside the service class so that
			// reuse checks have a legitimate presentation context.
			presentation.push(PresentationParameter {
				abstract_syntax_uid: UI::from(uids::VERIFICATION),
				transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
			});

			while let Some(idle) = self.take_idle(&key) {
				if self.recycle(&idle).await.is_ok() {
					return Ok(PooledAssociation {
						inner: Some(idle),
						key,
						keep: true,
						pool: Arc::downgrade(&self.inner),
					});
				}
				// Dead slot: drop it and look at the next one.
			}
		}

		let association = ClientAssociation::establish(ClientAssociationOptions {
			calling_ae_title: server.calling_ae_title.clone(),
			called_ae_title: server.called_ae_title.clone(),
			address: server.address(),
			presentation,
			connection_timeout: self.inner.connection_timeout,
			acse_timeout: self.inner.acse_timeout,
		})
		.await?;

		info!(
			server = server.connection_name,
			association_uuid = %association.uuid(),
			"Created new client association"
		);

		Ok(PooledAssociation {
			inner: Some(association),
			key,
			keep: server.keep_association_open,
			pool: Arc::downgrade(&self.inner),
		})
	}
}

/// An association lease. Dropping it returns the association to the pool
/// when the server keeps associations open; otherwise the association is
/// dropped too, which releases it.
pub struct PooledAssociation {
	inner: Option<ClientAssociation>,
	key: SlotKey,
	keep: bool,
	pool: Weak<InnerPool>,
}

impl PooledAssociation {
	fn get(&self) -> &ClientAssociation {
		self.inner
			.as_ref()
			.expect("association is present until drop")
	}
}

impl Association for PooledAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.get().receive(timeout).await
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.get().send(pdu, timeout).await
	}

	fn presentation_contexts(&self) -> &[PresentationContext] {
		self.get().presentation_contexts()
	}
}

impl Drop for PooledAssociation {
	fn drop(&mut self) {
		if !self.keep {
			return;
		}
		if let (Some(pool), Some(association)) = (self.pool.upgrade(), self.inner.take()) {
			let mut slots = pool.slots.lock().expect("pool mutex should not be poisoned");
			slots.entry(self.key.clone()).or_default().push(association);
		}
	}
}
