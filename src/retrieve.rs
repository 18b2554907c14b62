use crate::dimse::association::Association;
use crate::dimse::cget::{
	CompositeGetRequest, CompositeGetResponse, CompositeStoreResponse, InboundStoreRequest,
	COMMAND_FIELD_COMPOSITE_GET_RESPONSE, COMMAND_FIELD_COMPOSITE_STORE_REQUEST,
};
use crate::dimse::cmove::{CompositeMoveRequest, CompositeMoveResponse};
use crate::dimse::{
	element_str, next_message_id, read_message, write_message, ReadError, StatusType, WriteError,
};
use crate::events::{EventSink, SchedulerEvent};
use crate::results::{TaskResult, TaskResultKind};
use crate::task::{RetrieveLevel, StopFlag, TaskUid};
use crate::types::{Priority, QueryRetrieveLevel, AE, US};
use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RetrieveError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error("Retrieve refused with status {status:#06x}")]
	OperationFailed { status: US },
	#[error("Received unexpected command field {0:#06x} during retrieve")]
	UnexpectedCommand(US),
	#[error("Failed to store received instance: {0}")]
	Storage(#[from] std::io::Error),
	#[error("Failed to encode received instance: {0}")]
	Encode(#[from] dicom::object::WriteError),
	#[error("Failed to assemble instance file: {0}")]
	FileMeta(#[from] dicom::object::meta::Error),
	#[error("Retrieve was canceled")]
	Canceled,
}

/// Executes one C-GET or C-MOVE transfer at a given hierarchy level over
/// an already-negotiated association.
///
/// With C-GET the driver itself receives the instances as C-STORE
/// sub-operations interleaved on the same association; each one is written
/// below `storage_directory` and reported as a stored-file result and a
/// per-instance progress event. With C-MOVE the instances travel to the
/// move destination out of band and only a level summary is produced.
pub struct RetrieveDriver<'a, A: Association> {
	pub association: &'a A,
	pub connection_name: &'a str,
	pub task_uid: TaskUid,
	pub stop: StopFlag,
	pub timeout: Duration,
	pub storage_directory: &'a Path,
	pub events: EventSink,
}

/// The retrieve identifier: QueryRetrieveLevel plus the UID path down to
/// the requested level.
pub fn retrieve_identifier(
	level: RetrieveLevel,
	study_instance_uid: &str,
	series_instance_uid: &str,
	sop_instance_uid: &str,
) -> InMemDicomObject {
	let mut identifier = InMemDicomObject::new_empty();
	let query_retrieve_level = match level {
		RetrieveLevel::Studies => QueryRetrieveLevel::Study,
		RetrieveLevel::Series => QueryRetrieveLevel::Series,
		RetrieveLevel::Instances => QueryRetrieveLevel::Image,
	};
	identifier.put_str(
		tags::QUERY_RETRIEVE_LEVEL,
		VR::CS,
		query_retrieve_level.to_string(),
	);
	identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study_instance_uid);
	if !matches!(level, RetrieveLevel::Studies) {
		identifier.put_str(tags::SERIES_INSTANCE_UID, VR::UI, series_instance_uid);
	}
	if matches!(level, RetrieveLevel::Instances) {
		identifier.put_str(tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid);
	}
	identifier
}

impl<'a, A: Association> RetrieveDriver<'a, A> {
	fn ensure_not_stopped(&self) -> Result<(), RetrieveError> {
		if self.stop.is_stopped() {
			Err(RetrieveError::Canceled)
		} else {
			Ok(())
		}
	}

	/// C-GET: requests the selection and receives every instance on this
	/// association.
	pub async fn get(
		&self,
		level: RetrieveLevel,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Result<Vec<TaskResult>, RetrieveError> {
		self.ensure_not_stopped()?;

		let request = CompositeGetRequest {
			identifier: retrieve_identifier(
				level,
				study_instance_uid,
				series_instance_uid,
				sop_instance_uid,
			),
			message_id: next_message_id(),
			priority: Priority::default() as US,
		};
		write_message(self.association, request, None, self.timeout).await?;
		debug!("Sent C-GET-RQ");

		let mut results = Vec::new();
		loop {
			let message = read_message(self.association, self.timeout).await?;

			match message.command_field()? {
				COMMAND_FIELD_COMPOSITE_STORE_REQUEST => {
					let store = InboundStoreRequest::try_from(message)?;
					let result = self
						.accept_instance(store, study_instance_uid, series_instance_uid)
						.await?;
					self.events
						.emit(SchedulerEvent::ProgressBarTaskDetail(result.clone()));
					results.push(result);
				}
				COMMAND_FIELD_COMPOSITE_GET_RESPONSE => {
					let response = CompositeGetResponse::try_from(message)?;
					match StatusType::try_from(response.status).unwrap_or(StatusType::Failure) {
						StatusType::Pending => {
							if let Some(percent) = response.sub_operations.percent() {
								self.events.progress(
									self.task_uid,
									"Receiving instances",
									percent,
								);
							}
						}
						StatusType::Success => {
							info!(
								completed = response.sub_operations.completed,
								failed = response.sub_operations.failed,
								"C-GET completed"
							);
							break;
						}
						StatusType::Cancel => return Err(RetrieveError::Canceled),
						StatusType::Failure | StatusType::Warning => {
							error!(status = response.status, "C-GET sub-operation failed");
							return Err(RetrieveError::OperationFailed {
								status: response.status,
							});
						}
					}
				}
				other => return Err(RetrieveError::UnexpectedCommand(other)),
			}

			self.ensure_not_stopped()?;
		}

		let total = results.len();
		for result in &mut results {
			result.set_number_of_total_results_for_task(total);
		}
		Ok(results)
	}

	/// Writes one received instance below the storage directory and
	/// acknowledges it to the peer.
	async fn accept_instance(
		&self,
		store: InboundStoreRequest,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Result<TaskResult, RetrieveError> {
		let study_uid = element_str(&store.data, tags::STUDY_INSTANCE_UID)
			.unwrap_or_else(|| String::from(study_instance_uid));
		let series_uid = element_str(&store.data, tags::SERIES_INSTANCE_UID)
			.unwrap_or_else(|| String::from(series_instance_uid));

		let transfer_syntax = store
			.presentation_context_id
			.and_then(|id| {
				self.association
					.presentation_contexts()
					.iter()
					.find(|pctx| pctx.id == id)
			})
			.map_or_else(
				|| String::from(dicom::dictionary_std::uids::IMPLICIT_VR_LITTLE_ENDIAN),
				|pctx| pctx.transfer_syntax.clone(),
			);

		let file_path = self.instance_path(&study_uid, &series_uid, &store.sop_instance_uid);
		let file = store.data.with_exact_meta(
			FileMetaTableBuilder::new()
				.media_storage_sop_class_uid(&store.sop_class_uid)
				.media_storage_sop_instance_uid(&store.sop_instance_uid)
				.transfer_syntax(&transfer_syntax)
				.build()?,
		);
		let mut encoded = Vec::new();
		file.write_all(&mut encoded)?;
		if let Some(parent) = file_path.parent() {
			fs_err::tokio::create_dir_all(parent).await?;
		}
		fs_err::tokio::write(&file_path, encoded).await?;
		debug!(
			sop_instance_uid = store.sop_instance_uid,
			path = %file_path.display(),
			"Stored received instance"
		);

		let acknowledgement = CompositeStoreResponse {
			message_id: store.message_id,
			sop_class_uid: store.sop_class_uid,
			sop_instance_uid: store.sop_instance_uid.clone(),
		};
		write_message(
			self.association,
			acknowledgement,
			store.presentation_context_id,
			self.timeout,
		)
		.await?;

		let mut result = TaskResult::new(
			TaskResultKind::RetrieveSopInstance,
			self.task_uid,
			self.connection_name,
		);
		result.set_study_instance_uid(study_uid);
		result.set_series_instance_uid(series_uid);
		result.set_sop_instance_uid(store.sop_instance_uid);
		result.set_stored_file(file_path, true, false);
		Ok(result)
	}

	fn instance_path(&self, study_uid: &str, series_uid: &str, sop_uid: &str) -> PathBuf {
		self.storage_directory
			.join(sanitize_component(study_uid))
			.join(sanitize_component(series_uid))
			.join(format!("{}.dcm", sanitize_component(sop_uid)))
	}

	/// C-MOVE: asks the peer to push the selection to `destination` and
	/// follows the progress responses until completion. Produces one level
	/// summary result; the instances themselves arrive out of band.
	pub async fn move_to(
		&self,
		destination: &AE,
		level: RetrieveLevel,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Result<Vec<TaskResult>, RetrieveError> {
		self.ensure_not_stopped()?;

		let request = CompositeMoveRequest {
			identifier: retrieve_identifier(
				level,
				study_instance_uid,
				series_instance_uid,
				sop_instance_uid,
			),
			message_id: next_message_id(),
			priority: Priority::default() as US,
			destination: destination.clone(),
		};
		write_message(self.association, request, None, self.timeout).await?;
		debug!("Sent C-MOVE-RQ");

		loop {
			let message = read_message(self.association, self.timeout).await?;
			let response = CompositeMoveResponse::try_from(message)?;

			match StatusType::try_from(response.status).unwrap_or(StatusType::Failure) {
				StatusType::Pending => {
					// One progress tick per acknowledged sub-operation, so
					// series progress bars advance instance by instance even
					// though the data travels out of band.
					let mut progress = TaskResult::new(
						match level {
							RetrieveLevel::Instances => TaskResultKind::RetrieveSopInstance,
							RetrieveLevel::Studies | RetrieveLevel::Series => {
								TaskResultKind::RetrieveSeries
							}
						},
						self.task_uid,
						self.connection_name,
					);
					progress.set_study_instance_uid(study_instance_uid);
					progress.set_series_instance_uid(series_instance_uid);
					progress.set_sop_instance_uid(sop_instance_uid);
					if let (Some(completed), Some(remaining)) = (
						response.sub_operations.completed,
						response.sub_operations.remaining,
					) {
						progress.set_number_of_total_results_for_task(
							usize::from(completed) + usize::from(remaining),
						);
					}
					self.events
						.emit(SchedulerEvent::ProgressBarTaskDetail(progress));

					if let Some(percent) = response.sub_operations.percent() {
						self.events
							.progress(self.task_uid, "Move in progress", percent);
					}
				}
				StatusType::Success => {
					info!(
						completed = response.sub_operations.completed,
						"C-MOVE completed"
					);
					break;
				}
				StatusType::Cancel => return Err(RetrieveError::Canceled),
				StatusType::Failure | StatusType::Warning => {
					if let Some(failed) = response.sub_operations.failed {
						warn!(failed, "C-MOVE reported failed sub-operations");
					}
					return Err(RetrieveError::OperationFailed {
						status: response.status,
					});
				}
			}

			self.ensure_not_stopped()?;
		}

		let kind = match level {
			RetrieveLevel::Instances => TaskResultKind::RetrieveSopInstance,
			RetrieveLevel::Studies | RetrieveLevel::Series => TaskResultKind::RetrieveSeries,
		};
		let mut summary = TaskResult::new(kind, self.task_uid, self.connection_name);
		summary.set_study_instance_uid(study_instance_uid);
		summary.set_series_instance_uid(series_instance_uid);
		summary.set_sop_instance_uid(sop_instance_uid);
		summary.set_number_of_total_results_for_task(1);
		Ok(vec![summary])
	}
}

/// UIDs become path components; anything outside their legal alphabet is
/// replaced so a malformed peer cannot escape the storage directory.
fn sanitize_component(uid: &str) -> String {
	uid.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '.' {
				c
			} else {
				'_'
			}
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::testing::{
		decode_sent, get_success, inbound_store, identifier_with, move_pending, move_success,
		MockAssociation,
	};
	use crate::dimse::element_u16;

	fn storage_dir() -> PathBuf {
		let dir = std::env::temp_dir().join(format!("dicom-scheduler-test-{}", uuid::Uuid::new_v4()));
		fs_err::create_dir_all(&dir).expect("temp dir");
		dir
	}

	fn driver<'a>(
		association: &'a MockAssociation,
		storage: &'a Path,
		events: EventSink,
	) -> RetrieveDriver<'a, MockAssociation> {
		RetrieveDriver {
			association,
			connection_name: "PACS1",
			task_uid: TaskUid::generate(),
			stop: StopFlag::default(),
			timeout: Duration::from_secs(5),
			storage_directory: storage,
			events,
		}
	}

	#[tokio::test]
	async fn cget_stores_each_instance_and_acknowledges() {
		let dataset = identifier_with(&[
			(tags::STUDY_INSTANCE_UID, "1.2"),
			(tags::SERIES_INSTANCE_UID, "1.2.3"),
			(tags::SOP_INSTANCE_UID, "1.2.3.1"),
		]);
		let association = MockAssociation::new(
			vec![inbound_store("1.2.3.1", dataset), get_success(1)]
				.into_iter()
				.flatten()
				.collect(),
		);
		let storage = storage_dir();
		let (events, mut rx) = EventSink::channel();

		let results = driver(&association, &storage, events)
			.get(RetrieveLevel::Series, "1.2", "1.2.3", "")
			.await
			.expect("C-GET should succeed");

		assert_eq!(results.len(), 1);
		let result = &results[0];
		assert_eq!(result.kind(), TaskResultKind::RetrieveSopInstance);
		assert_eq!(result.sop_instance_uid(), "1.2.3.1");
		let path = result.file_path().expect("stored file path");
		assert!(path.starts_with(&storage));
		assert!(path.exists(), "instance file should be written");

		// The peer got a C-STORE-RSP for the sub-operation.
		let sent = decode_sent(&association.sent_messages());
		let store_response = sent
			.iter()
			.find(|command| {
				element_u16(command, tags::COMMAND_FIELD) == Some(0x8001)
			})
			.expect("C-STORE-RSP should be sent");
		assert_eq!(element_u16(store_response, tags::STATUS), Some(0));

		// Per-instance progress was emitted for the thumbnail pipeline.
		let event = rx.try_recv().expect("progress event");
		assert!(matches!(event, SchedulerEvent::ProgressBarTaskDetail(_)));

		fs_err::remove_dir_all(&storage).ok();
	}

	#[tokio::test]
	async fn cmove_emits_summary_result_only() {
		let association = MockAssociation::new(
			vec![move_pending(2, 1), move_pending(1, 2), move_success(3)]
				.into_iter()
				.flatten()
				.collect(),
		);
		let storage = storage_dir();
		let (events, mut rx) = EventSink::channel();

		let results = driver(&association, &storage, events)
			.move_to(
				&AE::from("SCHEDSTORE"),
				RetrieveLevel::Series,
				"1.2",
				"1.2.3",
				"",
			)
			.await
			.expect("C-MOVE should succeed");

		// One per-instance progress tick per pending response.
		let mut bar_ticks = 0;
		while let Ok(event) = rx.try_recv() {
			if let SchedulerEvent::ProgressBarTaskDetail(progress) = event {
				assert_eq!(progress.series_instance_uid(), "1.2.3");
				bar_ticks += 1;
			}
		}
		assert_eq!(bar_ticks, 2);

		assert_eq!(results.len(), 1);
		assert_eq!(results[0].kind(), TaskResultKind::RetrieveSeries);
		assert_eq!(results[0].series_instance_uid(), "1.2.3");
		assert!(results[0].file_path().is_none());

		// The request carried the move destination.
		let sent = decode_sent(&association.sent_messages());
		assert_eq!(
			element_str(&sent[0], tags::MOVE_DESTINATION).as_deref(),
			Some("SCHEDSTORE")
		);

		fs_err::remove_dir_all(&storage).ok();
	}

	#[tokio::test]
	async fn identifier_narrows_with_level() {
		let study = retrieve_identifier(RetrieveLevel::Studies, "1.2", "", "");
		assert_eq!(
			element_str(&study, tags::QUERY_RETRIEVE_LEVEL).as_deref(),
			Some("STUDY")
		);
		assert!(study.get(tags::SERIES_INSTANCE_UID).is_none());

		let instance = retrieve_identifier(RetrieveLevel::Instances, "1.2", "1.2.3", "1.2.3.4");
		assert_eq!(
			element_str(&instance, tags::QUERY_RETRIEVE_LEVEL).as_deref(),
			Some("IMAGE")
		);
		assert_eq!(
			element_str(&instance, tags::SOP_INSTANCE_UID).as_deref(),
			Some("1.2.3.4")
		);
	}

	#[tokio::test]
	async fn stopped_driver_cancels_before_sending() {
		let association = MockAssociation::new(Vec::new());
		let storage = storage_dir();
		let (events, _rx) = EventSink::channel();
		let stop = StopFlag::default();
		stop.set(true);

		let driver = RetrieveDriver {
			association: &association,
			connection_name: "PACS1",
			task_uid: TaskUid::generate(),
			stop,
			timeout: Duration::from_secs(5),
			storage_directory: &storage,
			events,
		};

		let error = driver
			.get(RetrieveLevel::Series, "1.2", "1.2.3", "")
			.await
			.expect_err("stopped driver must cancel");
		assert!(matches!(error, RetrieveError::Canceled));
		assert!(association.sent_messages().is_empty());

		fs_err::remove_dir_all(&storage).ok();
	}

	#[test]
	fn path_components_are_sanitized() {
		assert_eq!(sanitize_component("1.2.840"), "1.2.840");
		assert_eq!(sanitize_component("../escape"), ".._escape");
	}
}
