use crate::task::TaskUid;
use crate::types::UI;
use dicom::object::InMemDicomObject;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Discriminates what a [`TaskResult`] carries and which task produced it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskResultKind {
	/// A file discovered outside of query/retrieve, handed straight to the
	/// indexer.
	FileIndex,
	QueryPatients,
	QueryStudies,
	QuerySeries,
	QueryInstances,
	RetrieveSopInstance,
	RetrieveSeries,
}

/// The payload of a result.
///
/// Payloads are immutable once the result has been handed over to the
/// scheduler; cross-thread handoff transfers ownership (or clones, which is
/// a deep copy for every payload variant).
#[derive(Debug, Clone, Default)]
pub enum ResultPayload {
	#[default]
	None,
	/// One metadata dataset, as returned by a C-FIND response.
	Dataset(InMemDicomObject),
	/// All instance datasets of one series, keyed by SOPInstanceUID, so the
	/// UI can update atomically from a single result.
	Datasets(BTreeMap<UI, InMemDicomObject>),
	/// A reference to an instance file written by a retrieve.
	StoredFile {
		file_path: PathBuf,
		copy_file: bool,
		overwrite_existing: bool,
	},
}

/// Value object produced by query/retrieve drivers and consumed by the
/// indexer and the UI progress surface.
#[derive(Debug, Clone)]
pub struct TaskResult {
	kind: TaskResultKind,
	task_uid: TaskUid,
	connection_name: String,
	patient_id: String,
	study_instance_uid: UI,
	series_instance_uid: UI,
	sop_instance_uid: UI,
	number_of_total_results_for_task: usize,
	payload: ResultPayload,
}

impl TaskResult {
	pub fn new(kind: TaskResultKind, task_uid: TaskUid, connection_name: &str) -> Self {
		Self {
			kind,
			task_uid,
			connection_name: String::from(connection_name),
			patient_id: String::new(),
			study_instance_uid: UI::new(),
			series_instance_uid: UI::new(),
			sop_instance_uid: UI::new(),
			number_of_total_results_for_task: 0,
			payload: ResultPayload::None,
		}
	}

	pub const fn kind(&self) -> TaskResultKind {
		self.kind
	}

	pub const fn task_uid(&self) -> TaskUid {
		self.task_uid
	}

	pub fn connection_name(&self) -> &str {
		&self.connection_name
	}

	pub fn patient_id(&self) -> &str {
		&self.patient_id
	}

	pub fn set_patient_id(&mut self, patient_id: impl Into<String>) {
		self.patient_id = patient_id.into();
	}

	pub fn study_instance_uid(&self) -> &str {
		&self.study_instance_uid
	}

	pub fn set_study_instance_uid(&mut self, uid: impl Into<UI>) {
		self.study_instance_uid = uid.into();
	}

	pub fn series_instance_uid(&self) -> &str {
		&self.series_instance_uid
	}

	pub fn set_series_instance_uid(&mut self, uid: impl Into<UI>) {
		self.series_instance_uid = uid.into();
	}

	pub fn sop_instance_uid(&self) -> &str {
		&self.sop_instance_uid
	}

	pub fn set_sop_instance_uid(&mut self, uid: impl Into<UI>) {
		self.sop_instance_uid = uid.into();
	}

	pub const fn number_of_total_results_for_task(&self) -> usize {
		self.number_of_total_results_for_task
	}

	pub fn set_number_of_total_results_for_task(&mut self, count: usize) {
		self.number_of_total_results_for_task = count;
	}

	pub const fn payload(&self) -> &ResultPayload {
		&self.payload
	}

	pub fn set_dataset(&mut self, dataset: InMemDicomObject) {
		self.payload = ResultPayload::Dataset(dataset);
	}

	pub fn set_datasets_map(&mut self, datasets: BTreeMap<UI, InMemDicomObject>) {
		self.payload = ResultPayload::Datasets(datasets);
	}

	pub fn set_stored_file(&mut self, file_path: PathBuf, copy_file: bool, overwrite_existing: bool) {
		self.payload = ResultPayload::StoredFile {
			file_path,
			copy_file,
			overwrite_existing,
		};
	}

	pub fn dataset(&self) -> Option<&InMemDicomObject> {
		match &self.payload {
			ResultPayload::Dataset(dataset) => Some(dataset),
			_ => None,
		}
	}

	pub fn datasets_map(&self) -> Option<&BTreeMap<UI, InMemDicomObject>> {
		match &self.payload {
			ResultPayload::Datasets(datasets) => Some(datasets),
			_ => None,
		}
	}

	pub fn file_path(&self) -> Option<&std::path::Path> {
		match &self.payload {
			ResultPayload::StoredFile { file_path, .. } => Some(file_path),
			_ => None,
		}
	}
}
