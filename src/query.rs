use crate::dimse::association::Association;
use crate::dimse::cfind::{CompositeFindRequest, CompositeFindResponse};
use crate::dimse::{
	element_str, next_message_id, read_message, write_message, ReadError, StatusType, WriteError,
};
use crate::events::EventSink;
use crate::filters::QueryFilters;
use crate::results::{TaskResult, TaskResultKind};
use crate::task::{StopFlag, TaskUid};
use crate::types::{Priority, QueryRetrieveLevel, UI, US};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error("C-FIND exchange refused with status {status:#06x}")]
	OperationFailed { status: US },
	#[error("Query was canceled")]
	Canceled,
}

/// The character set all outgoing identifiers declare (ISO Latin 1; the
/// default would be plain ASCII).
const SPECIFIC_CHARACTER_SET: &str = "ISO_IR 100";

/// Return keys requested at each query level; values arrive in the
/// matching C-FIND responses.
const PATIENT_RETURN_KEYS: [Tag; 4] = [
	tags::PATIENT_ID,
	tags::PATIENT_NAME,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_SEX,
];

const STUDY_RETURN_KEYS: [Tag; 9] = [
	tags::STUDY_INSTANCE_UID,
	tags::STUDY_ID,
	tags::STUDY_DESCRIPTION,
	tags::STUDY_DATE,
	tags::STUDY_TIME,
	tags::MODALITIES_IN_STUDY,
	tags::ACCESSION_NUMBER,
	tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
	tags::NUMBER_OF_STUDY_RELATED_SERIES,
];

const SERIES_RETURN_KEYS: [Tag; 9] = [
	tags::SERIES_NUMBER,
	tags::SERIES_DESCRIPTION,
	tags::SERIES_INSTANCE_UID,
	tags::SERIES_DATE,
	tags::SERIES_TIME,
	tags::MODALITY,
	tags::ROWS,
	tags::COLUMNS,
	tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
];

const INSTANCE_RETURN_KEYS: [Tag; 4] = [
	tags::INSTANCE_NUMBER,
	tags::SOP_INSTANCE_UID,
	tags::ROWS,
	tags::COLUMNS,
];

/// Executes C-FIND exchanges at one hierarchy level against one
/// already-negotiated association.
///
/// The driver polls its stop flag before the request, after every received
/// response and between per-study iterations of the study/series walk; a
/// stop observed at any of these points releases the association (by
/// returning, which drops the caller's lease) and surfaces as
/// [`FindError::Canceled`].
pub struct QueryDriver<'a, A: Association> {
	pub association: &'a A,
	pub connection_name: &'a str,
	pub task_uid: TaskUid,
	pub stop: StopFlag,
	pub filters: &'a QueryFilters,
	pub timeout: Duration,
	/// Cap on patient-level result cardinality.
	pub maximum_patients_query: usize,
	pub events: EventSink,
}

impl<'a, A: Association> QueryDriver<'a, A> {
	fn ensure_not_stopped(&self) -> Result<(), FindError> {
		if self.stop.is_stopped() {
			Err(FindError::Canceled)
		} else {
			Ok(())
		}
	}

	fn progress(&self, message: &str, percent: u8) {
		self.events.progress(self.task_uid, message, percent);
	}

	fn base_identifier(&self, level: QueryRetrieveLevel, return_keys: &[Tag]) -> InMemDicomObject {
		let mut identifier = InMemDicomObject::new_empty();
		for tag in return_keys {
			identifier.put(DataElement::new(*tag, vr_of(*tag), PrimitiveValue::Empty));
		}
		identifier.put_str(
			tags::SPECIFIC_CHARACTER_SET,
			VR::CS,
			SPECIFIC_CHARACTER_SET,
		);
		identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.to_string());
		identifier
	}

	/// One complete C-FIND exchange. Pending responses accumulate until the
	/// final response closes the exchange; the final response never carries
	/// an identifier and is discarded.
	async fn find(
		&self,
		identifier: InMemDicomObject,
		limit: Option<usize>,
	) -> Result<Vec<InMemDicomObject>, FindError> {
		self.ensure_not_stopped()?;

		let request = CompositeFindRequest {
			message_id: next_message_id(),
			priority: Priority::default() as US,
			affected_sop_class_uid: UI::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
			identifier,
		};
		write_message(self.association, request, None, self.timeout).await?;
		self.progress("Find request sent", 40);

		let mut datasets = Vec::new();
		let mut over_limit = 0usize;
		loop {
			let message = read_message(self.association, self.timeout).await?;
			let response = CompositeFindResponse::try_from(message)?;
			let status_type =
				StatusType::try_from(response.status).unwrap_or(StatusType::Failure);

			match status_type {
				StatusType::Pending => {
					if let Some(data) = response.data {
						if limit.is_some_and(|limit| datasets.len() >= limit) {
							over_limit += 1;
						} else {
							datasets.push(data);
						}
					}
				}
				StatusType::Success => break,
				StatusType::Cancel => return Err(FindError::Canceled),
				StatusType::Failure | StatusType::Warning => {
					return Err(FindError::OperationFailed {
						status: response.status,
					});
				}
			}

			self.ensure_not_stopped()?;
		}

		if over_limit > 0 {
			warn!(
				dropped = over_limit,
				"Query returned more matches than the configured cap, truncating"
			);
		}
		self.progress("Find succeeded", 50);
		Ok(datasets)
	}

	/// Patient-level query. Result cardinality is capped by
	/// `maximum_patients_query`.
	pub async fn query_patients(&self) -> Result<Vec<TaskResult>, FindError> {
		self.progress("Querying patients", 0);
		let mut identifier = self.base_identifier(QueryRetrieveLevel::Patient, &PATIENT_RETURN_KEYS);
		self.filters.apply_to(&mut identifier);
		self.progress("Filters applied", 30);

		let datasets = self
			.find(identifier, Some(self.maximum_patients_query))
			.await?;

		let mut results = Vec::with_capacity(datasets.len());
		for dataset in datasets {
			let mut result = TaskResult::new(
				TaskResultKind::QueryPatients,
				self.task_uid,
				self.connection_name,
			);
			if let Some(patient_id) = element_str(&dataset, tags::PATIENT_ID) {
				result.set_patient_id(patient_id);
			}
			result.set_dataset(dataset);
			results.push(result);
		}
		finalize(&mut results);
		self.progress("Patient query complete", 100);
		Ok(results)
	}

	/// Study-level query, optionally scoped to one patient.
	pub async fn query_studies(&self, patient_id: &str) -> Result<Vec<TaskResult>, FindError> {
		self.progress("Querying studies", 0);
		let mut identifier = self.study_identifier(patient_id);
		self.filters.apply_to(&mut identifier);
		self.progress("Filters applied", 30);

		let datasets = self.find(identifier, None).await?;

		let mut results = Vec::with_capacity(datasets.len());
		for dataset in datasets {
			results.push(self.study_result(patient_id, dataset));
		}
		finalize(&mut results);
		self.progress("Study query complete", 100);
		Ok(results)
	}

	fn study_identifier(&self, patient_id: &str) -> InMemDicomObject {
		let mut identifier = self.base_identifier(QueryRetrieveLevel::Study, &STUDY_RETURN_KEYS);
		for tag in [tags::PATIENT_NAME, tags::PATIENT_BIRTH_DATE] {
			identifier.put(DataElement::new(tag, vr_of(tag), PrimitiveValue::Empty));
		}
		if patient_id.is_empty() {
			identifier.put(DataElement::new(
				tags::PATIENT_ID,
				VR::LO,
				PrimitiveValue::Empty,
			));
		} else {
			identifier.put_str(tags::PATIENT_ID, VR::LO, patient_id);
		}
		identifier
	}

	fn study_result(&self, patient_id: &str, dataset: InMemDicomObject) -> TaskResult {
		let mut result = TaskResult::new(
			TaskResultKind::QueryStudies,
			self.task_uid,
			self.connection_name,
		);
		result.set_patient_id(
			element_str(&dataset, tags::PATIENT_ID).unwrap_or_else(|| String::from(patient_id)),
		);
		if let Some(study_uid) = element_str(&dataset, tags::STUDY_INSTANCE_UID) {
			debug!(study_instance_uid = study_uid, "Processing study match");
			result.set_study_instance_uid(study_uid);
		}
		result.set_dataset(dataset);
		result
	}

	/// Series-level query within one study.
	pub async fn query_series(
		&self,
		patient_id: &str,
		study_instance_uid: &str,
	) -> Result<Vec<TaskResult>, FindError> {
		self.progress("Querying series", 0);
		let identifier = self.series_identifier(study_instance_uid);
		self.progress("Filters applied", 30);

		let datasets = self.find(identifier, None).await?;

		let mut results = Vec::with_capacity(datasets.len());
		for dataset in datasets {
			results.push(self.series_result(patient_id, study_instance_uid, dataset));
		}
		finalize(&mut results);
		self.progress("Series query complete", 100);
		Ok(results)
	}

	fn series_identifier(&self, study_instance_uid: &str) -> InMemDicomObject {
		let mut identifier = self.base_identifier(QueryRetrieveLevel::Series, &SERIES_RETURN_KEYS);
		identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study_instance_uid);
		if let Some(description) = self.filters.series_description_wildcard() {
			identifier.put_str(tags::SERIES_DESCRIPTION, VR::LO, description);
		}
		identifier
	}

	fn series_result(
		&self,
		patient_id: &str,
		study_instance_uid: &str,
		dataset: InMemDicomObject,
	) -> TaskResult {
		let mut result = TaskResult::new(
			TaskResultKind::QuerySeries,
			self.task_uid,
			self.connection_name,
		);
		result.set_patient_id(patient_id);
		result.set_study_instance_uid(study_instance_uid);
		if let Some(series_uid) = element_str(&dataset, tags::SERIES_INSTANCE_UID) {
			result.set_series_instance_uid(series_uid);
		}
		result.set_dataset(dataset);
		result
	}

	/// Instance-level query within one series. All matching instances are
	/// batched into a single result so the UI can update atomically.
	pub async fn query_instances(
		&self,
		patient_id: &str,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Result<Vec<TaskResult>, FindError> {
		self.progress("Querying instances", 0);
		let mut identifier =
			self.base_identifier(QueryRetrieveLevel::Image, &INSTANCE_RETURN_KEYS);
		identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study_instance_uid);
		identifier.put_str(tags::SERIES_INSTANCE_UID, VR::UI, series_instance_uid);
		self.progress("Filters applied", 30);

		let datasets = self.find(identifier, None).await?;

		let mut datasets_map = BTreeMap::new();
		for dataset in datasets {
			if let Some(sop_instance_uid) = element_str(&dataset, tags::SOP_INSTANCE_UID) {
				datasets_map.insert(sop_instance_uid, dataset);
			}
		}

		let mut result = TaskResult::new(
			TaskResultKind::QueryInstances,
			self.task_uid,
			self.connection_name,
		);
		result.set_patient_id(patient_id);
		result.set_study_instance_uid(study_instance_uid);
		result.set_series_instance_uid(series_instance_uid);
		result.set_number_of_total_results_for_task(1);
		result.set_datasets_map(datasets_map);

		self.progress("Instance query complete", 100);
		Ok(vec![result])
	}

	/// The hierarchical walk: queries studies, then iterates a series-level
	/// C-FIND per matched study on the same association. Patient identity
	/// attributes of the study are carried into each series dataset, which
	/// series-level responses do not repeat.
	pub async fn query_studies_and_series(
		&self,
		patient_id: &str,
	) -> Result<Vec<TaskResult>, FindError> {
		self.progress("Querying studies", 0);
		let mut identifier = self.study_identifier(patient_id);
		self.filters.apply_to(&mut identifier);
		self.progress("Filters applied", 30);

		let study_datasets = self.find(identifier, None).await?;

		let mut results = Vec::new();
		for dataset in &study_datasets {
			results.push(self.study_result(patient_id, dataset.clone()));
		}

		let study_count = study_datasets.len();
		for (index, study_dataset) in study_datasets.into_iter().enumerate() {
			// Suspension point between per-study iterations.
			self.ensure_not_stopped()?;

			let Some(study_uid) = element_str(&study_dataset, tags::STUDY_INSTANCE_UID) else {
				continue;
			};
			let percent = 50 + ratio(index, study_count, 50);
			self.progress(&format!("Series query for study {study_uid}"), percent);

			let identifier = self.series_identifier(&study_uid);
			let series_datasets = self.find(identifier, None).await?;

			for mut series_dataset in series_datasets {
				for tag in [tags::PATIENT_NAME, tags::PATIENT_ID] {
					if let Some(value) = element_str(&study_dataset, tag) {
						series_dataset.put_str(tag, vr_of(tag), value);
					}
				}
				results.push(self.series_result(patient_id, &study_uid, series_dataset));
			}
		}

		finalize(&mut results);
		self.progress("Hierarchical query complete", 100);
		Ok(results)
	}
}

fn finalize(results: &mut [TaskResult]) {
	let total = results.len();
	for result in results {
		result.set_number_of_total_results_for_task(total);
	}
}

fn ratio(index: usize, count: usize, span: u8) -> u8 {
	if count == 0 {
		return span;
	}
	u8::try_from(index * usize::from(span) / count).unwrap_or(span)
}

fn vr_of(tag: Tag) -> VR {
	match tag {
		tags::PATIENT_NAME => VR::PN,
		tags::PATIENT_ID | tags::STUDY_DESCRIPTION | tags::SERIES_DESCRIPTION => VR::LO,
		tags::PATIENT_BIRTH_DATE | tags::STUDY_DATE | tags::SERIES_DATE => VR::DA,
		tags::STUDY_TIME | tags::SERIES_TIME => VR::TM,
		tags::PATIENT_SEX | tags::MODALITY | tags::MODALITIES_IN_STUDY => VR::CS,
		tags::STUDY_ID | tags::ACCESSION_NUMBER => VR::SH,
		tags::STUDY_INSTANCE_UID | tags::SERIES_INSTANCE_UID | tags::SOP_INSTANCE_UID => VR::UI,
		tags::SERIES_NUMBER
		| tags::INSTANCE_NUMBER
		| tags::NUMBER_OF_STUDY_RELATED_INSTANCES
		| tags::NUMBER_OF_STUDY_RELATED_SERIES
		| tags::NUMBER_OF_SERIES_RELATED_INSTANCES => VR::IS,
		tags::ROWS | tags::COLUMNS => VR::US,
		_ => VR::LO,
	}
}
