use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables of the [`Scheduler`](crate::Scheduler).
///
/// All durations are given in milliseconds. The parent application decides
/// where these values come from (settings dialog, persisted profile, ...);
/// this crate only consumes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedulerConfig {
	/// Number of worker tasks pulling from the priority queue.
	pub maximum_worker_count: usize,
	/// Retry budget per logical query/retrieve operation.
	pub maximum_number_of_retry: u32,
	/// Delay before a failed task is re-enqueued.
	pub retry_delay: u64,
	/// Cap on the number of results materialized by a patient-level query.
	pub maximum_patients_query: usize,
	/// Association negotiation timeout.
	pub acse_timeout: u64,
	/// TCP connect timeout.
	pub connection_timeout: u64,
	/// Per-message bound on DIMSE reads and writes once a transfer runs.
	pub dimse_timeout: u64,
	/// Directory that C-GET writes received instances into, before the
	/// indexer takes ownership of them.
	pub storage_directory: PathBuf,
	/// Commit result batches on a background task instead of inline on the
	/// coordinating task.
	pub background_import: bool,
}

impl SchedulerConfig {
	pub const fn default_maximum_number_of_retry() -> u32 {
		3
	}

	pub const fn default_retry_delay() -> u64 {
		100
	}

	pub const fn default_maximum_patients_query() -> usize {
		25
	}

	pub const fn default_acse_timeout() -> u64 {
		2_000
	}

	pub const fn default_connection_timeout() -> u64 {
		2_000
	}

	pub const fn default_dimse_timeout() -> u64 {
		30_000
	}

	pub fn default_maximum_worker_count() -> usize {
		std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
	}

	pub const fn retry_delay(&self) -> Duration {
		Duration::from_millis(self.retry_delay)
	}

	pub const fn acse_timeout(&self) -> Duration {
		Duration::from_millis(self.acse_timeout)
	}

	pub const fn connection_timeout(&self) -> Duration {
		Duration::from_millis(self.connection_timeout)
	}

	pub const fn dimse_timeout(&self) -> Duration {
		Duration::from_millis(self.dimse_timeout)
	}
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			maximum_worker_count: Self::default_maximum_worker_count(),
			maximum_number_of_retry: Self::default_maximum_number_of_retry(),
			retry_delay: Self::default_retry_delay(),
			maximum_patients_query: Self::default_maximum_patients_query(),
			acse_timeout: Self::default_acse_timeout(),
			connection_timeout: Self::default_connection_timeout(),
			dimse_timeout: Self::default_dimse_timeout(),
			storage_directory: PathBuf::from("dicom-storage"),
			background_import: true,
		}
	}
}
