use crate::database::InstanceRecord;
use crate::dimse::pool::Connector;
use crate::scheduler::Scheduler;
use crate::types::{TaskPriority, UI};
use std::collections::HashMap;
use tracing::debug;

/// Prefetches the frames a series thumbnail needs: the central frame first
/// at normal priority, the remaining instances as a low-priority backfill.
///
/// When the UI focuses a series, the coordinator elevates its queued
/// retrieves to high priority and pushes everything else down, so the
/// frames under the user's cursor arrive first.
pub struct ThumbnailCoordinator<C: Connector> {
	scheduler: Scheduler<C>,
	/// Chosen central frame per (study, series).
	central_frames: HashMap<(UI, UI), UI>,
}

/// Priority of the backfill retrieve that fetches the rest of a series
/// once its central frame is on its way.
const BACKFILL_PRIORITY: TaskPriority = TaskPriority::Low;

impl<C: Connector> ThumbnailCoordinator<C> {
	pub fn new(scheduler: Scheduler<C>) -> Self {
		Self {
			scheduler,
			central_frames: HashMap::new(),
		}
	}

	/// The central frame of a series: instances sorted ascending by
	/// InstanceNumber, the element at `⌊count/2⌋`. Instances without an
	/// InstanceNumber sort first (as number 0); ties keep database
	/// insertion order.
	///
	/// Sorting by InstanceNumber is best-effort. When the chosen frame is
	/// still remote but other frames of the series are already local, the
	/// first local instance substitutes so a thumbnail can render now.
	pub fn central_frame(instances: &[InstanceRecord]) -> Option<&InstanceRecord> {
		if instances.is_empty() {
			return None;
		}
		if instances.len() == 1 {
			return instances.first();
		}

		let mut ordered: Vec<&InstanceRecord> = instances.iter().collect();
		ordered.sort_by_key(|instance| instance.instance_number.unwrap_or(0));
		let chosen = ordered[ordered.len() / 2];

		if !chosen.is_local {
			if let Some(local) = instances.iter().find(|instance| instance.is_local) {
				debug!(
					substitute = local.sop_instance_uid,
					"Central frame still remote, using first local instance"
				);
				return Some(local);
			}
		}
		Some(chosen)
	}

	/// Ensures the frames for a series thumbnail get fetched. Returns the
	/// SOP instance UID of the chosen central frame, if the series has any
	/// known instances.
	pub async fn request_series_thumbnail(
		&mut self,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Option<UI> {
		let instances = self
			.scheduler
			.dicom_database()
			.instances_for_series(series_instance_uid)
			.await;

		let central = Self::central_frame(&instances)?.clone();
		self.central_frames.insert(
			(
				UI::from(study_instance_uid),
				UI::from(series_instance_uid),
			),
			central.sop_instance_uid.clone(),
		);

		if !central.is_local {
			self.scheduler.retrieve_sop_instance(
				study_instance_uid,
				series_instance_uid,
				&central.sop_instance_uid,
				TaskPriority::Normal,
			);
		}

		let remote_remainder = instances.iter().any(|instance| {
			!instance.is_local && instance.sop_instance_uid != central.sop_instance_uid
		});
		if instances.len() > 1 && remote_remainder {
			// The series-level retrieve backfills everything the central
			// frame fetch did not cover.
			self.scheduler.retrieve_series(
				study_instance_uid,
				series_instance_uid,
				BACKFILL_PRIORITY,
			);
		}

		Some(central.sop_instance_uid)
	}

	/// The central frame previously chosen for a series.
	pub fn central_frame_for(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Option<&UI> {
		self.central_frames.get(&(
			UI::from(study_instance_uid),
			UI::from(series_instance_uid),
		))
	}

	/// Called when the UI focuses a series: its retrieves jump the queue,
	/// everything else drops to low priority.
	pub fn focus_series(&self, study_instance_uid: &str, series_instance_uid: &str) {
		self.scheduler.raise_retrieve_frames_tasks_priority_for_series(
			study_instance_uid,
			series_instance_uid,
			TaskPriority::High,
		);
	}
}
