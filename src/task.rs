use crate::filters::QueryFilters;
use crate::server::ServerDescriptor;
use crate::types::QueryRetrieveLevel;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Identity of one task *attempt*.
///
/// A retried operation gets a fresh `TaskUid`; consumers that need to
/// correlate the attempts of a logical operation must use the
/// `{study, series, sop, connection name}` tuple instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskUid(Uuid);

impl TaskUid {
	pub fn generate() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Display for TaskUid {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

/// Cooperative cancellation flag, polled by drivers at their suspension
/// points. Setting it is idempotent and thread-safe.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
	pub fn set(&self, stopped: bool) {
		self.0.store(stopped, Ordering::SeqCst);
	}

	pub fn is_stopped(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

const RUNNING: u8 = 0b01;
const FINISHED: u8 = 0b10;

/// Running/finished lifecycle flags.
///
/// Invariant: `finished` implies not `running`; marking a task finished
/// clears the running bit in the same atomic update.
#[derive(Debug, Default)]
pub struct TaskState(AtomicU8);

impl TaskState {
	pub fn is_running(&self) -> bool {
		self.0.load(Ordering::SeqCst) & RUNNING != 0
	}

	pub fn is_finished(&self) -> bool {
		self.0.load(Ordering::SeqCst) & FINISHED != 0
	}

	pub fn set_running(&self, running: bool) {
		let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
			Some(if running {
				(state & !FINISHED) | RUNNING
			} else {
				state & !RUNNING
			})
		});
	}

	pub fn set_finished(&self, finished: bool) {
		let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
			Some(if finished {
				(state & !RUNNING) | FINISHED
			} else {
				state & !FINISHED
			})
		});
	}
}

/// Hierarchy level of a query task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueryLevel {
	Patients,
	Studies,
	Series,
	Instances,
}

impl QueryLevel {
	pub const fn query_retrieve_level(self) -> QueryRetrieveLevel {
		match self {
			Self::Patients => QueryRetrieveLevel::Patient,
			Self::Studies => QueryRetrieveLevel::Study,
			Self::Series => QueryRetrieveLevel::Series,
			Self::Instances => QueryRetrieveLevel::Image,
		}
	}
}

/// Hierarchy level of a retrieve task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetrieveLevel {
	Studies,
	Series,
	Instances,
}

/// Parameters of one C-FIND exchange.
#[derive(Debug, Clone)]
pub struct QuerySpec {
	pub level: QueryLevel,
	pub patient_id: String,
	pub study_instance_uid: String,
	pub series_instance_uid: String,
	pub filters: QueryFilters,
}

/// Parameters of one C-GET/C-MOVE exchange.
#[derive(Debug, Clone)]
pub struct RetrieveSpec {
	pub level: RetrieveLevel,
	pub study_instance_uid: String,
	pub series_instance_uid: String,
	pub sop_instance_uid: String,
}

/// The work a task performs, as a tagged variant so that result fan-in can
/// dispatch without downcasting.
#[derive(Debug, Clone)]
pub enum TaskKind {
	Query(QuerySpec),
	Retrieve(RetrieveSpec),
}

/// One unit of work owned by the scheduler registry.
///
/// Workers hold a non-owning [`Arc`] for the duration of their run; all
/// registry bookkeeping happens on the coordinating task.
#[derive(Debug)]
pub struct Task {
	uid: TaskUid,
	kind: TaskKind,
	server: Arc<ServerDescriptor>,
	number_of_retry: u32,
	stop: StopFlag,
	state: TaskState,
}

impl Task {
	pub fn new(kind: TaskKind, server: Arc<ServerDescriptor>) -> Self {
		Self {
			uid: TaskUid::generate(),
			kind,
			server,
			number_of_retry: 0,
			stop: StopFlag::default(),
			state: TaskState::default(),
		}
	}

	/// A new attempt for the same logical operation: same server, level and
	/// UIDs, fresh task UID and lifecycle state, retry counter advanced.
	pub fn retry(&self) -> Self {
		Self {
			uid: TaskUid::generate(),
			kind: self.kind.clone(),
			server: Arc::clone(&self.server),
			number_of_retry: self.number_of_retry + 1,
			stop: StopFlag::default(),
			state: TaskState::default(),
		}
	}

	/// The follow-up C-GET against a proxy server after a completed C-MOVE,
	/// inheriting the UIDs and bumping the retry counter.
	pub fn chain_to_proxy(&self, proxy: Arc<ServerDescriptor>) -> Self {
		Self {
			uid: TaskUid::generate(),
			kind: self.kind.clone(),
			server: proxy,
			number_of_retry: self.number_of_retry + 1,
			stop: StopFlag::default(),
			state: TaskState::default(),
		}
	}

	pub const fn uid(&self) -> TaskUid {
		self.uid
	}

	pub const fn kind(&self) -> &TaskKind {
		&self.kind
	}

	pub fn server(&self) -> &Arc<ServerDescriptor> {
		&self.server
	}

	pub const fn number_of_retry(&self) -> u32 {
		self.number_of_retry
	}

	pub const fn stop_flag(&self) -> &StopFlag {
		&self.stop
	}

	pub fn is_stopped(&self) -> bool {
		self.stop.is_stopped()
	}

	pub const fn state(&self) -> &TaskState {
		&self.state
	}

	/// Whether this task belongs to the `{study, series, sop}` selection of
	/// a stop request. An empty selector component matches anything, so
	/// `stop_tasks("S", "", "")` stops every task of study `S`.
	pub fn matches_selection(&self, study: &str, series: &str, sop: &str) -> bool {
		let (task_study, task_series, task_sop) = match &self.kind {
			TaskKind::Query(spec) => (
				spec.study_instance_uid.as_str(),
				spec.series_instance_uid.as_str(),
				"",
			),
			TaskKind::Retrieve(spec) => (
				spec.study_instance_uid.as_str(),
				spec.series_instance_uid.as_str(),
				spec.sop_instance_uid.as_str(),
			),
		};

		task_study == study
			&& (task_series.is_empty() || series.is_empty() || task_series == series)
			&& (task_sop.is_empty() || sop.is_empty() || task_sop == sop)
	}

	/// Whether this is a series- or instance-level retrieve of the given
	/// series, the set whose priority a focused thumbnail raises.
	pub fn is_series_retrieve_for(&self, study: &str, series: &str) -> bool {
		match &self.kind {
			TaskKind::Retrieve(spec) => {
				matches!(spec.level, RetrieveLevel::Series | RetrieveLevel::Instances)
					&& spec.study_instance_uid == study
					&& spec.series_instance_uid == series
			}
			TaskKind::Query(_) => false,
		}
	}

	pub const fn is_retrieve(&self) -> bool {
		matches!(self.kind, TaskKind::Retrieve(_))
	}
}
