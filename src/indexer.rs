use crate::database::DicomDatabase;
use crate::events::{EventSink, SchedulerEvent};
use crate::results::{ResultPayload, TaskResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// Consumes the result batches of finished tasks and writes them into the
/// database, in the order the worker appended them.
///
/// One `ProgressTaskDetail` event is emitted per committed result, and a
/// `ProgressTaskDetail(None)` when a task finished empty-handed, so UI
/// progress indicators always receive a retirement signal. A result the
/// database rejects is logged and skipped; the remaining results of the
/// batch are still committed.
#[derive(Clone)]
pub struct IndexerAdapter {
	database: Arc<dyn DicomDatabase>,
	events: EventSink,
	background_import: bool,
}

impl IndexerAdapter {
	pub(crate) fn new(database: Arc<dyn DicomDatabase>, events: EventSink) -> Self {
		Self {
			database,
			events,
			background_import: true,
		}
	}

	/// Whether batches are committed on a background task instead of
	/// inline on the coordinating task. Enabled by default.
	pub(crate) fn set_background_import(&mut self, enabled: bool) {
		self.background_import = enabled;
	}

	pub(crate) fn database(&self) -> &Arc<dyn DicomDatabase> {
		&self.database
	}

	/// Accepts the results of one finished task. With background import the
	/// commit runs on its own task and this returns immediately; otherwise
	/// the batch is committed before returning.
	pub(crate) async fn accept(&self, results: Vec<TaskResult>) {
		if self.background_import {
			let adapter = self.clone();
			tokio::spawn(async move {
				adapter.insert_task_results(results).await;
			});
		} else {
			self.insert_task_results(results).await;
		}
	}

	pub(crate) async fn insert_task_results(&self, results: Vec<TaskResult>) {
		if results.is_empty() {
			self.events.emit(SchedulerEvent::ProgressTaskDetail(None));
			return;
		}

		for result in results {
			match self.commit(&result).await {
				Ok(()) => {
					self.events
						.emit(SchedulerEvent::ProgressTaskDetail(Some(result)));
				}
				Err(err) => {
					warn!(
						task_uid = %result.task_uid(),
						"Indexer rejected a result, committing the rest: {err}"
					);
				}
			}
		}
	}

	async fn commit(&self, result: &TaskResult) -> Result<(), crate::database::IndexError> {
		match result.payload() {
			ResultPayload::Dataset(dataset) => self.database.insert_dataset(dataset).await,
			ResultPayload::Datasets(datasets) => {
				for dataset in datasets.values() {
					self.database.insert_dataset(dataset).await?;
				}
				Ok(())
			}
			ResultPayload::StoredFile {
				file_path,
				copy_file,
				overwrite_existing,
			} => {
				self.database
					.index_file(file_path, *copy_file, *overwrite_existing)
					.await
			}
			ResultPayload::None => {
				debug!(task_uid = %result.task_uid(), "Result without payload, nothing to index");
				Ok(())
			}
		}
	}
}
