use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
	#[error("Database rejected dataset: {0}")]
	Rejected(String),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Locality and ordering metadata of one instance of a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
	pub sop_instance_uid: String,
	/// InstanceNumber (0020,0013), when the instance carries one.
	pub instance_number: Option<i64>,
	/// Whether the instance file is available locally. Remote instances are
	/// known only through query metadata.
	pub is_local: bool,
}

/// The scheduler's view of the local DICOM database.
///
/// The schema and storage layout belong to the embedding application; the
/// core only needs a sink for committed results and enough metadata lookup
/// to drive thumbnail prefetching. The database must serialize its own
/// writes; the indexer adapter is its single writer within this crate.
#[async_trait]
pub trait DicomDatabase: Send + Sync {
	/// Inserts one metadata dataset (a C-FIND match) into the database.
	async fn insert_dataset(&self, dataset: &InMemDicomObject) -> Result<(), IndexError>;

	/// Indexes an instance file written by a retrieve. `copy_file` asks the
	/// database to take a copy into its own storage; `overwrite_existing`
	/// replaces a previously indexed dataset for the same SOP instance.
	async fn index_file(
		&self,
		file_path: &Path,
		copy_file: bool,
		overwrite_existing: bool,
	) -> Result<(), IndexError>;

	/// The known instances of a series, in database insertion order.
	async fn instances_for_series(&self, series_instance_uid: &str) -> Vec<InstanceRecord>;
}

#[cfg(test)]
pub(crate) mod testing {
	use super::{DicomDatabase, IndexError, InstanceRecord};
	use async_trait::async_trait;
	use dicom::object::InMemDicomObject;
	use std::path::{Path, PathBuf};
	use std::sync::Mutex;

	/// An in-memory database double recording every commit.
	#[derive(Default)]
	pub(crate) struct RecordingDatabase {
		pub(crate) datasets: Mutex<Vec<InMemDicomObject>>,
		pub(crate) files: Mutex<Vec<PathBuf>>,
		pub(crate) instances: Mutex<Vec<InstanceRecord>>,
		/// When set, `insert_dataset` rejects every dataset.
		pub(crate) reject_datasets: bool,
	}

	impl RecordingDatabase {
		pub(crate) fn with_instances(instances: Vec<InstanceRecord>) -> Self {
			Self {
				instances: Mutex::new(instances),
				..Self::default()
			}
		}

		pub(crate) fn dataset_count(&self) -> usize {
			self.datasets.lock().unwrap().len()
		}

		pub(crate) fn file_count(&self) -> usize {
			self.files.lock().unwrap().len()
		}
	}

	#[async_trait]
	impl DicomDatabase for RecordingDatabase {
		async fn insert_dataset(&self, dataset: &InMemDicomObject) -> Result<(), IndexError> {
			if self.reject_datasets {
				return Err(IndexError::Rejected(String::from("rejected by test")));
			}
			self.datasets.lock().unwrap().push(dataset.clone());
			Ok(())
		}

		async fn index_file(
			&self,
			file_path: &Path,
			_copy_file: bool,
			_overwrite_existing: bool,
		) -> Result<(), IndexError> {
			self.files.lock().unwrap().push(file_path.to_path_buf());
			Ok(())
		}

		async fn instances_for_series(&self, _series_instance_uid: &str) -> Vec<InstanceRecord> {
			self.instances.lock().unwrap().clone()
		}
	}
}
