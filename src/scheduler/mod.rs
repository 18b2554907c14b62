//! The task pool: a bounded worker pool with per-task priority, retry and
//! cancellation, fanning results into the indexer and progress events to
//! the UI.

mod queue;

use crate::config::SchedulerConfig;
use crate::database::DicomDatabase;
use crate::dimse::association::PresentationParameter;
use crate::dimse::cecho::EchoServiceClassUser;
use crate::dimse::cget::storage_presentation_parameters;
use crate::dimse::pool::{Connector, DimseConnector};
use crate::dimse::standard_transfer_syntaxes;
use crate::events::{EventSink, SchedulerEvent};
use crate::filters::QueryFilters;
use crate::indexer::IndexerAdapter;
use crate::query::QueryDriver;
use crate::results::TaskResult;
use crate::retrieve::RetrieveDriver;
use crate::server::{RetrieveProtocol, ServerDescriptor, ServerDescriptorError};
use crate::task::{
	QueryLevel, QuerySpec, RetrieveLevel, RetrieveSpec, Task, TaskKind, TaskUid,
};
use crate::types::{TaskPriority, UI};
use dicom::dictionary_std::uids;
use queue::TaskQueue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ScheduleError {
	#[error(transparent)]
	InvalidServer(#[from] ServerDescriptorError),
	#[error("a server named '{0}' is already registered")]
	DuplicateServer(String),
	#[error("no server named '{0}' is registered")]
	UnknownServer(String),
	#[error("the scheduler is shutting down")]
	Closed,
}

/// Runtime-settable knobs shared between the handle, the coordinator and
/// the workers.
struct Settings {
	/// How many workers should be pulling from the queue.
	worker_target: AtomicUsize,
	/// How many workers currently are. Excess workers retire between tasks.
	live_workers: AtomicUsize,
	maximum_number_of_retry: AtomicU32,
	retry_delay_ms: AtomicU64,
	maximum_patients_query: AtomicUsize,
	dimse_timeout: Duration,
	storage_directory: PathBuf,
	filters: Mutex<QueryFilters>,
}

enum Command {
	Query {
		level: QueryLevel,
		patient_id: String,
		study_instance_uid: String,
		series_instance_uid: String,
		priority: TaskPriority,
	},
	Retrieve {
		level: RetrieveLevel,
		study_instance_uid: String,
		series_instance_uid: String,
		sop_instance_uid: String,
		priority: TaskPriority,
	},
	AddServer {
		server: Box<ServerDescriptor>,
		reply: oneshot::Sender<Result<(), ScheduleError>>,
	},
	RemoveServer {
		connection_name: String,
		reply: oneshot::Sender<Result<(), ScheduleError>>,
	},
	Servers {
		reply: oneshot::Sender<Vec<Arc<ServerDescriptor>>>,
	},
	StopTasks {
		study_instance_uid: String,
		series_instance_uid: String,
		sop_instance_uid: String,
	},
	StopAllTasks,
	StopAllTasksNotStarted,
	RaiseRetrieveFramesTasksPriorityForSeries {
		study_instance_uid: String,
		series_instance_uid: String,
		priority: TaskPriority,
	},
	LowerPriorityToAllTasks,
	EnqueueRetry {
		uid: TaskUid,
	},
	Started {
		uid: TaskUid,
	},
	Finished {
		uid: TaskUid,
		results: Vec<TaskResult>,
	},
	Canceled {
		uid: TaskUid,
	},
	Shutdown,
}

/// The DICOM task scheduler.
///
/// `Scheduler` is a cloneable handle; the actual state lives on a
/// coordinating task that serializes every registry mutation and result
/// fan-in, mirroring queued signal delivery onto a single thread. Query and
/// retrieve operations enqueue work and return immediately; one task is
/// created per query/retrieve-enabled server.
///
/// Construction spawns the coordinator and the worker pool onto the
/// current tokio runtime.
#[derive(Clone)]
pub struct Scheduler<C: Connector = DimseConnector> {
	commands: UnboundedSender<Command>,
	outstanding: watch::Receiver<usize>,
	settings: Arc<Settings>,
	database: Arc<dyn DicomDatabase>,
	connector: C,
	queue: Arc<TaskQueue>,
	events: EventSink,
}

impl Scheduler<DimseConnector> {
	pub fn new(
		config: SchedulerConfig,
		database: Arc<dyn DicomDatabase>,
	) -> (Self, UnboundedReceiver<SchedulerEvent>) {
		let connector = DimseConnector::new(config.connection_timeout(), config.acse_timeout());
		Self::with_connector(config, database, connector)
	}
}

impl<C: Connector> Scheduler<C> {
	/// Builds a scheduler on top of a custom association [`Connector`].
	pub fn with_connector(
		config: SchedulerConfig,
		database: Arc<dyn DicomDatabase>,
		connector: C,
	) -> (Self, UnboundedReceiver<SchedulerEvent>) {
		let (events, events_rx) = EventSink::channel();
		let (commands, commands_rx) = mpsc::unbounded_channel();
		let (outstanding_tx, outstanding) = watch::channel(0usize);

		let settings = Arc::new(Settings {
			worker_target: AtomicUsize::new(config.maximum_worker_count),
			live_workers: AtomicUsize::new(0),
			maximum_number_of_retry: AtomicU32::new(config.maximum_number_of_retry),
			retry_delay_ms: AtomicU64::new(config.retry_delay),
			maximum_patients_query: AtomicUsize::new(config.maximum_patients_query),
			dimse_timeout: config.dimse_timeout(),
			storage_directory: config.storage_directory.clone(),
			filters: Mutex::new(QueryFilters::default()),
		});

		let queue = Arc::new(TaskQueue::new());
		let mut indexer = IndexerAdapter::new(Arc::clone(&database), events.clone());
		indexer.set_background_import(config.background_import);

		let coordinator = Coordinator {
			registry: HashMap::new(),
			servers: Vec::new(),
			queue: Arc::clone(&queue),
			events: events.clone(),
			indexer,
			settings: Arc::clone(&settings),
			outstanding: outstanding_tx,
			commands: commands.clone(),
		};
		tokio::spawn(coordinator.run(commands_rx));

		let scheduler = Self {
			commands,
			outstanding,
			settings,
			database,
			connector,
			queue,
			events,
		};
		scheduler.spawn_missing_workers();

		(scheduler, events_rx)
	}

	/// Brings the live worker count up to the configured target.
	fn spawn_missing_workers(&self) {
		loop {
			let live = self.settings.live_workers.load(Ordering::SeqCst);
			if live >= self.settings.worker_target.load(Ordering::SeqCst) {
				break;
			}
			if self
				.settings
				.live_workers
				.compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
				.is_err()
			{
				continue;
			}
			let context = WorkerContext {
				connector: self.connector.clone(),
				settings: Arc::clone(&self.settings),
				events: self.events.clone(),
				commands: self.commands.clone(),
			};
			tokio::spawn(worker_loop(Arc::clone(&self.queue), context));
		}
	}

	fn send(&self, command: Command) {
		if self.commands.send(command).is_err() {
			warn!("Scheduler coordinator is gone, dropping command");
		}
	}

	async fn ask<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Option<R> {
		let (tx, rx) = oneshot::channel();
		self.send(make(tx));
		rx.await.ok()
	}

	/// Registers a server. The pool is quiesced first: every task is
	/// stopped and awaited, so no task can observe a half-updated server
	/// registry.
	pub async fn add_server(&self, server: ServerDescriptor) -> Result<(), ScheduleError> {
		server.validate()?;
		self.stop_all_tasks();
		self.wait_for_finish(None).await;
		self.ask(|reply| Command::AddServer {
			server: Box::new(server),
			reply,
		})
		.await
		.unwrap_or(Err(ScheduleError::Closed))
	}

	/// Removes a server by connection name, quiescing the pool first so no
	/// registered task can outlive the descriptor it references.
	pub async fn remove_server(&self, connection_name: &str) -> Result<(), ScheduleError> {
		self.stop_all_tasks();
		self.wait_for_finish(None).await;
		self.ask(|reply| Command::RemoveServer {
			connection_name: String::from(connection_name),
			reply,
		})
		.await
		.unwrap_or(Err(ScheduleError::Closed))
	}

	pub async fn servers(&self) -> Vec<Arc<ServerDescriptor>> {
		self.ask(|reply| Command::Servers { reply })
			.await
			.unwrap_or_default()
	}

	pub async fn server(&self, connection_name: &str) -> Option<Arc<ServerDescriptor>> {
		self.servers()
			.await
			.into_iter()
			.find(|server| server.connection_name == connection_name)
	}

	pub async fn server_names(&self) -> Vec<String> {
		self.servers()
			.await
			.iter()
			.map(|server| server.connection_name.clone())
			.collect()
	}

	pub async fn server_count(&self) -> usize {
		self.servers().await.len()
	}

	pub async fn query_retrieve_server_count(&self) -> usize {
		self.servers()
			.await
			.iter()
			.filter(|server| server.query_retrieve_enabled)
			.count()
	}

	pub async fn storage_server_count(&self) -> usize {
		self.servers()
			.await
			.iter()
			.filter(|server| server.storage_enabled)
			.count()
	}

	/// Verifies a server with a C-ECHO.
	pub async fn echo_server(&self, server: &ServerDescriptor) -> bool {
		let presentation = vec![PresentationParameter {
			abstract_syntax_uid: UI::from(uids::VERIFICATION),
			transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		}];
		match self.connector.connect(server, presentation).await {
			Ok(association) => EchoServiceClassUser::new(&association)
				.echo(self.settings.dimse_timeout)
				.await
				.unwrap_or(false),
			Err(err) => {
				debug!(
					server = server.connection_name,
					"C-ECHO connect failed: {err}"
				);
				false
			}
		}
	}

	pub fn query_patients(&self, priority: TaskPriority) {
		self.send(Command::Query {
			level: QueryLevel::Patients,
			patient_id: String::new(),
			study_instance_uid: String::new(),
			series_instance_uid: String::new(),
			priority,
		});
	}

	pub fn query_studies(&self, patient_id: &str, priority: TaskPriority) {
		self.send(Command::Query {
			level: QueryLevel::Studies,
			patient_id: String::from(patient_id),
			study_instance_uid: String::new(),
			series_instance_uid: String::new(),
			priority,
		});
	}

	pub fn query_series(&self, patient_id: &str, study_instance_uid: &str, priority: TaskPriority) {
		self.send(Command::Query {
			level: QueryLevel::Series,
			patient_id: String::from(patient_id),
			study_instance_uid: String::from(study_instance_uid),
			series_instance_uid: String::new(),
			priority,
		});
	}

	pub fn query_instances(
		&self,
		patient_id: &str,
		study_instance_uid: &str,
		series_instance_uid: &str,
		priority: TaskPriority,
	) {
		self.send(Command::Query {
			level: QueryLevel::Instances,
			patient_id: String::from(patient_id),
			study_instance_uid: String::from(study_instance_uid),
			series_instance_uid: String::from(series_instance_uid),
			priority,
		});
	}

	pub fn retrieve_study(&self, study_instance_uid: &str, priority: TaskPriority) {
		self.send(Command::Retrieve {
			level: RetrieveLevel::Studies,
			study_instance_uid: String::from(study_instance_uid),
			series_instance_uid: String::new(),
			sop_instance_uid: String::new(),
			priority,
		});
	}

	pub fn retrieve_series(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
		priority: TaskPriority,
	) {
		self.send(Command::Retrieve {
			level: RetrieveLevel::Series,
			study_instance_uid: String::from(study_instance_uid),
			series_instance_uid: String::from(series_instance_uid),
			sop_instance_uid: String::new(),
			priority,
		});
	}

	pub fn retrieve_sop_instance(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
		priority: TaskPriority,
	) {
		self.send(Command::Retrieve {
			level: RetrieveLevel::Instances,
			study_instance_uid: String::from(study_instance_uid),
			series_instance_uid: String::from(series_instance_uid),
			sop_instance_uid: String::from(sop_instance_uid),
			priority,
		});
	}

	/// Stops the not-yet-finished tasks matching the selection. Queued
	/// matches are withdrawn immediately; running matches observe their
	/// stop flag at the next suspension point. Stopped tasks are not
	/// retried.
	pub fn stop_tasks(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) {
		self.send(Command::StopTasks {
			study_instance_uid: String::from(study_instance_uid),
			series_instance_uid: String::from(series_instance_uid),
			sop_instance_uid: String::from(sop_instance_uid),
		});
	}

	pub fn stop_all_tasks(&self) {
		self.send(Command::StopAllTasks);
	}

	pub fn stop_all_tasks_not_started(&self) {
		self.send(Command::StopAllTasksNotStarted);
	}

	/// Re-prioritizes queued retrieve tasks for a focused series: matching
	/// series/instance retrieves are re-enqueued at `priority`, every other
	/// queued retrieve drops to low. Running tasks are left untouched.
	pub fn raise_retrieve_frames_tasks_priority_for_series(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
		priority: TaskPriority,
	) {
		self.send(Command::RaiseRetrieveFramesTasksPriorityForSeries {
			study_instance_uid: String::from(study_instance_uid),
			series_instance_uid: String::from(series_instance_uid),
			priority,
		});
	}

	pub fn lower_priority_to_all_tasks(&self) {
		self.send(Command::LowerPriorityToAllTasks);
	}

	/// Waits until the registry is empty and the pool is idle.
	///
	/// With `timeout = None` this waits indefinitely. A timeout bounds the
	/// total wait to five times its duration, leaving headroom for queued
	/// tasks that start only after running ones drain. Returns whether the
	/// pool emptied.
	pub async fn wait_for_finish(&self, timeout: Option<Duration>) -> bool {
		let mut outstanding = self.outstanding.clone();
		let drained = async move {
			loop {
				if *outstanding.borrow() == 0 {
					return;
				}
				if outstanding.changed().await.is_err() {
					return;
				}
			}
		};

		match timeout {
			None => {
				drained.await;
				true
			}
			Some(timeout) => tokio::time::timeout(timeout * 5, drained).await.is_ok(),
		}
	}

	/// Stops everything and shuts the pool down. The handle (and its
	/// clones) must not be used afterwards.
	pub async fn shutdown(&self) {
		self.stop_all_tasks();
		self.wait_for_finish(None).await;
		self.send(Command::Shutdown);
	}

	/// Number of live tasks in the registry (queued, running, or waiting
	/// for a retry slot).
	pub fn total_tasks(&self) -> usize {
		*self.outstanding.borrow()
	}

	pub fn maximum_thread_count(&self) -> usize {
		self.settings.worker_target.load(Ordering::SeqCst)
	}

	/// Resizes the worker pool. Growth spawns workers immediately; excess
	/// workers retire between tasks, never mid-exchange.
	pub fn set_maximum_thread_count(&self, count: usize) {
		self.settings.worker_target.store(count, Ordering::SeqCst);
		self.spawn_missing_workers();
	}

	pub fn maximum_number_of_retry(&self) -> u32 {
		self.settings.maximum_number_of_retry.load(Ordering::SeqCst)
	}

	pub fn set_maximum_number_of_retry(&self, retries: u32) {
		self.settings
			.maximum_number_of_retry
			.store(retries, Ordering::SeqCst);
	}

	pub fn retry_delay(&self) -> Duration {
		Duration::from_millis(self.settings.retry_delay_ms.load(Ordering::SeqCst))
	}

	pub fn set_retry_delay(&self, delay: Duration) {
		self.settings
			.retry_delay_ms
			.store(delay.as_millis().try_into().unwrap_or(u64::MAX), Ordering::SeqCst);
	}

	pub fn maximum_patients_query(&self) -> usize {
		self.settings.maximum_patients_query.load(Ordering::SeqCst)
	}

	pub fn set_maximum_patients_query(&self, cap: usize) {
		self.settings
			.maximum_patients_query
			.store(cap, Ordering::SeqCst);
	}

	pub fn filters(&self) -> QueryFilters {
		self.settings
			.filters
			.lock()
			.expect("filters mutex should not be poisoned")
			.clone()
	}

	/// Filters applied to every subsequently created query task.
	pub fn set_filters(&self, filters: QueryFilters) {
		*self
			.settings
			.filters
			.lock()
			.expect("filters mutex should not be poisoned") = filters;
	}

	pub fn dicom_database(&self) -> Arc<dyn DicomDatabase> {
		Arc::clone(&self.database)
	}

	#[cfg(test)]
	pub(crate) fn queue(&self) -> &Arc<TaskQueue> {
		&self.queue
	}
}

struct Coordinator {
	registry: HashMap<TaskUid, Arc<Task>>,
	servers: Vec<Arc<ServerDescriptor>>,
	queue: Arc<TaskQueue>,
	events: EventSink,
	indexer: IndexerAdapter,
	settings: Arc<Settings>,
	outstanding: watch::Sender<usize>,
	commands: UnboundedSender<Command>,
}

impl Coordinator {
	async fn run(mut self, mut commands: UnboundedReceiver<Command>) {
		while let Some(command) = commands.recv().await {
			match command {
				Command::Query {
					level,
					patient_id,
					study_instance_uid,
					series_instance_uid,
					priority,
				} => self.enqueue_queries(
					level,
					patient_id,
					study_instance_uid,
					series_instance_uid,
					priority,
				),
				Command::Retrieve {
					level,
					study_instance_uid,
					series_instance_uid,
					sop_instance_uid,
					priority,
				} => self.enqueue_retrieves(
					level,
					study_instance_uid,
					series_instance_uid,
					sop_instance_uid,
					priority,
				),
				Command::AddServer { server, reply } => {
					let _ = reply.send(self.add_server(*server));
				}
				Command::RemoveServer {
					connection_name,
					reply,
				} => {
					let _ = reply.send(self.remove_server(&connection_name));
				}
				Command::Servers { reply } => {
					let _ = reply.send(self.servers.clone());
				}
				Command::StopTasks {
					study_instance_uid,
					series_instance_uid,
					sop_instance_uid,
				} => self.stop_tasks(
					&study_instance_uid,
					&series_instance_uid,
					&sop_instance_uid,
				),
				Command::StopAllTasks => self.stop_all_tasks(),
				Command::StopAllTasksNotStarted => self.stop_all_tasks_not_started(),
				Command::RaiseRetrieveFramesTasksPriorityForSeries {
					study_instance_uid,
					series_instance_uid,
					priority,
				} => self.raise_series_priority(
					&study_instance_uid,
					&series_instance_uid,
					priority,
				),
				Command::LowerPriorityToAllTasks => self.queue.demote_all(),
				Command::EnqueueRetry { uid } => self.enqueue_retry(uid),
				Command::Started { uid } => self.task_started(uid),
				Command::Finished { uid, results } => self.task_finished(uid, results).await,
				Command::Canceled { uid } => self.task_canceled(uid),
				Command::Shutdown => break,
			}
		}
		self.queue.close();
	}

	fn publish_count(&self) {
		let _ = self.outstanding.send(self.registry.len());
	}

	fn add_server(&mut self, server: ServerDescriptor) -> Result<(), ScheduleError> {
		if self
			.servers
			.iter()
			.any(|existing| existing.connection_name == server.connection_name)
		{
			return Err(ScheduleError::DuplicateServer(server.connection_name));
		}
		debug!(server = server.connection_name, "Registered server");
		self.servers.push(Arc::new(server));
		Ok(())
	}

	fn remove_server(&mut self, connection_name: &str) -> Result<(), ScheduleError> {
		let before = self.servers.len();
		self.servers
			.retain(|server| server.connection_name != connection_name);
		if self.servers.len() == before {
			return Err(ScheduleError::UnknownServer(String::from(connection_name)));
		}
		debug!(server = connection_name, "Removed server");
		Ok(())
	}

	fn register_and_start(&mut self, task: Task, priority: TaskPriority) {
		let task = Arc::new(task);
		debug!(
			task_uid = %task.uid(),
			server = task.server().connection_name,
			retries = task.number_of_retry(),
			"Task registered"
		);
		self.registry.insert(task.uid(), Arc::clone(&task));
		self.queue.push(task, priority);
		self.publish_count();
	}

	fn enqueue_queries(
		&mut self,
		level: QueryLevel,
		patient_id: String,
		study_instance_uid: String,
		series_instance_uid: String,
		priority: TaskPriority,
	) {
		let filters = self
			.settings
			.filters
			.lock()
			.expect("filters mutex should not be poisoned")
			.clone();
		let servers: Vec<_> = self
			.servers
			.iter()
			.filter(|server| server.query_retrieve_enabled)
			.cloned()
			.collect();
		for server in servers {
			let task = Task::new(
				TaskKind::Query(QuerySpec {
					level,
					patient_id: patient_id.clone(),
					study_instance_uid: study_instance_uid.clone(),
					series_instance_uid: series_instance_uid.clone(),
					filters: filters.clone(),
				}),
				server,
			);
			self.register_and_start(task, priority);
		}
	}

	fn enqueue_retrieves(
		&mut self,
		level: RetrieveLevel,
		study_instance_uid: String,
		series_instance_uid: String,
		sop_instance_uid: String,
		priority: TaskPriority,
	) {
		let servers: Vec<_> = self
			.servers
			.iter()
			.filter(|server| server.query_retrieve_enabled)
			.cloned()
			.collect();
		for server in servers {
			let task = Task::new(
				TaskKind::Retrieve(RetrieveSpec {
					level,
					study_instance_uid: study_instance_uid.clone(),
					series_instance_uid: series_instance_uid.clone(),
					sop_instance_uid: sop_instance_uid.clone(),
				}),
				server,
			);
			self.register_and_start(task, priority);
		}
	}

	/// Retires a task that was withdrawn from the queue before any worker
	/// picked it up: it goes straight from queued to canceled.
	fn cancel_queued(&mut self, task: &Arc<Task>) {
		task.state().set_finished(true);
		self.events.emit(SchedulerEvent::TaskCanceled {
			task_uid: task.uid(),
		});
		self.registry.remove(&task.uid());
		self.publish_count();
	}

	fn stop_tasks(&mut self, study: &str, series: &str, sop: &str) {
		let matching: Vec<_> = self
			.registry
			.values()
			.filter(|task| !task.state().is_finished() && task.matches_selection(study, series, sop))
			.cloned()
			.collect();
		for task in matching {
			task.stop_flag().set(true);
			if let Some((queued, _)) = self.queue.take(task.uid()) {
				self.cancel_queued(&queued);
			}
			// Running tasks observe the flag at their next suspension point.
		}
	}

	fn stop_all_tasks(&mut self) {
		for task in self.registry.values() {
			task.stop_flag().set(true);
		}
		for task in self.queue.take_all() {
			self.cancel_queued(&task);
		}
	}

	fn stop_all_tasks_not_started(&mut self) {
		for task in self.queue.take_all() {
			task.stop_flag().set(true);
			self.cancel_queued(&task);
		}
	}

	/// Queued retrieves for the focused series move to `priority`; all
	/// other queued retrieves drop to low. Each task is touched at most
	/// once, and running tasks keep their in-flight priority.
	fn raise_series_priority(&mut self, study: &str, series: &str, priority: TaskPriority) {
		let retrieves: Vec<_> = self
			.registry
			.values()
			.filter(|task| {
				task.is_retrieve()
					&& !task.state().is_running()
					&& !task.state().is_finished()
			})
			.cloned()
			.collect();

		for task in retrieves {
			let target = if task.is_series_retrieve_for(study, series) {
				priority
			} else {
				TaskPriority::Low
			};
			if let Some((queued, _)) = self.queue.take(task.uid()) {
				self.queue.push(queued, target);
			}
		}
	}

	fn enqueue_retry(&mut self, uid: TaskUid) {
		let Some(task) = self.registry.get(&uid).cloned() else {
			return;
		};
		if task.is_stopped() {
			self.cancel_queued(&task);
			return;
		}
		// Retries always re-enter at low priority.
		self.queue.push(task, TaskPriority::Low);
	}

	fn task_started(&self, uid: TaskUid) {
		debug!(task_uid = %uid, "Task started");
		self.events.emit(SchedulerEvent::TaskStarted { task_uid: uid });
	}

	async fn task_finished(&mut self, uid: TaskUid, results: Vec<TaskResult>) {
		let Some(task) = self.registry.remove(&uid) else {
			return;
		};
		debug!(task_uid = %uid, results = results.len(), "Task finished");
		self.events.emit(SchedulerEvent::TaskFinished { task_uid: uid });

		match task.kind() {
			TaskKind::Query(_) => {
				if !results.is_empty() && !task.is_stopped() {
					// The results were handed over by the worker; from here
					// on they are scheduler-owned and immutable.
					self.indexer.accept(results).await;
				} else {
					self.events.emit(SchedulerEvent::ProgressTaskDetail(None));
				}
			}
			TaskKind::Retrieve(spec) => {
				let server = task.server();
				if server.retrieve_protocol == RetrieveProtocol::Move && !task.is_stopped() {
					for result in &results {
						self.events
							.emit(SchedulerEvent::ProgressTaskDetail(Some(result.clone())));
					}

					let proxy = server
						.proxy_server
						.as_deref()
						.filter(|proxy| proxy.query_retrieve_enabled);
					if let Some(proxy) = proxy {
						// The datasets went to the move destination; fetch
						// them into the local store through the proxy.
						let chained = task.chain_to_proxy(Arc::new(proxy.clone()));
						let priority = if matches!(spec.level, RetrieveLevel::Instances) {
							TaskPriority::Normal
						} else {
							TaskPriority::Low
						};
						debug!(
							task_uid = %chained.uid(),
							proxy = proxy.connection_name,
							"Chaining C-GET against proxy after C-MOVE"
						);
						self.register_and_start(chained, priority);
					}
				} else if !results.is_empty() && !task.is_stopped() {
					self.indexer.accept(results).await;
				} else {
					self.events.emit(SchedulerEvent::ProgressTaskDetail(None));
				}
			}
		}

		// Published only after a possible chained task is registered, so a
		// concurrent wait_for_finish never observes a transient empty pool.
		self.publish_count();
	}

	fn task_canceled(&mut self, uid: TaskUid) {
		let Some(task) = self.registry.remove(&uid) else {
			return;
		};
		self.events.emit(SchedulerEvent::TaskCanceled { task_uid: uid });

		if task.is_stopped() {
			debug!(task_uid = %uid, "Task stopped by user, not retrying");
			self.publish_count();
			return;
		}

		let budget = self.settings.maximum_number_of_retry.load(Ordering::SeqCst);
		if task.number_of_retry() < budget {
			let attempt = task.retry();
			let attempt_uid = attempt.uid();
			debug!(
				task_uid = %uid,
				retry_uid = %attempt_uid,
				attempt = attempt.number_of_retry(),
				"Scheduling retry"
			);
			// Register immediately so wait_for_finish keeps covering the
			// logical operation across the retry delay.
			self.registry.insert(attempt_uid, Arc::new(attempt));

			let delay = Duration::from_millis(self.settings.retry_delay_ms.load(Ordering::SeqCst));
			let commands = self.commands.clone();
			tokio::spawn(async move {
				tokio::time::sleep(delay).await;
				let _ = commands.send(Command::EnqueueRetry { uid: attempt_uid });
			});
		} else {
			warn!(task_uid = %uid, "Retry budget exhausted, giving up");
			self.events.emit(SchedulerEvent::ProgressTaskDetail(None));
		}
		self.publish_count();
	}
}

struct WorkerContext<C: Connector> {
	connector: C,
	settings: Arc<Settings>,
	events: EventSink,
	commands: UnboundedSender<Command>,
}

async fn worker_loop<C: Connector>(queue: Arc<TaskQueue>, context: WorkerContext<C>) {
	loop {
		// Retire if the pool shrank below the number of live workers.
		let live = context.settings.live_workers.load(Ordering::SeqCst);
		if live > context.settings.worker_target.load(Ordering::SeqCst) {
			if context
				.settings
				.live_workers
				.compare_exchange(live, live - 1, Ordering::SeqCst, Ordering::SeqCst)
				.is_ok()
			{
				return;
			}
			continue;
		}

		let Some(task) = queue.next().await else {
			context.settings.live_workers.fetch_sub(1, Ordering::SeqCst);
			return;
		};
		run_task(&context, task).await;
	}
}

async fn run_task<C: Connector>(context: &WorkerContext<C>, task: Arc<Task>) {
	if task.is_stopped() {
		task.state().set_finished(true);
		let _ = context.commands.send(Command::Canceled { uid: task.uid() });
		return;
	}

	task.state().set_running(true);
	let _ = context.commands.send(Command::Started { uid: task.uid() });

	let outcome = execute_task(context, &task).await;
	task.state().set_finished(true);

	match outcome {
		Ok(results) => {
			let _ = context.commands.send(Command::Finished {
				uid: task.uid(),
				results,
			});
		}
		Err(err) => {
			debug!(task_uid = %task.uid(), "Task failed: {err}");
			let _ = context.commands.send(Command::Canceled { uid: task.uid() });
		}
	}
}

#[derive(Debug, Error)]
enum TaskError {
	#[error(transparent)]
	Association(#[from] crate::dimse::association::AssociationError),
	#[error(transparent)]
	Find(#[from] crate::query::FindError),
	#[error(transparent)]
	Retrieve(#[from] crate::retrieve::RetrieveError),
	#[error("Task was stopped")]
	Stopped,
}

async fn execute_task<C: Connector>(
	context: &WorkerContext<C>,
	task: &Arc<Task>,
) -> Result<Vec<TaskResult>, TaskError> {
	let server = task.server();
	let events = context.events.clone();
	events.progress(task.uid(), "Negotiating association", 10);

	match task.kind() {
		TaskKind::Query(spec) => {
			let presentation = vec![PresentationParameter {
				abstract_syntax_uid: UI::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
				transfer_syntax_uids: standard_transfer_syntaxes(),
			}];
			let association = context.connector.connect(server, presentation).await?;
			events.progress(task.uid(), "Association negotiated", 20);
			if task.is_stopped() {
				return Err(TaskError::Stopped);
			}

			let driver = QueryDriver {
				association: &association,
				connection_name: &server.connection_name,
				task_uid: task.uid(),
				stop: task.stop_flag().clone(),
				filters: &spec.filters,
				timeout: context.settings.dimse_timeout,
				maximum_patients_query: context
					.settings
					.maximum_patients_query
					.load(Ordering::SeqCst),
				events,
			};

			let results = match spec.level {
				QueryLevel::Patients => driver.query_patients().await?,
				QueryLevel::Studies => driver.query_studies(&spec.patient_id).await?,
				QueryLevel::Series => {
					driver
						.query_series(&spec.patient_id, &spec.study_instance_uid)
						.await?
				}
				QueryLevel::Instances => {
					driver
						.query_instances(
							&spec.patient_id,
							&spec.study_instance_uid,
							&spec.series_instance_uid,
						)
						.await?
				}
			};
			Ok(results)
		}
		TaskKind::Retrieve(spec) => {
			let (abstract_syntax, mut presentation) = match server.retrieve_protocol {
				RetrieveProtocol::Get => (
					uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
					storage_presentation_parameters(),
				),
				RetrieveProtocol::Move => (
					uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
					Vec::new(),
				),
			};
			presentation.insert(
				0,
				PresentationParameter {
					abstract_syntax_uid: UI::from(abstract_syntax),
					transfer_syntax_uids: standard_transfer_syntaxes(),
				},
			);

			let association = context.connector.connect(server, presentation).await?;
			events.progress(task.uid(), "Association negotiated", 20);
			if task.is_stopped() {
				return Err(TaskError::Stopped);
			}

			let driver = RetrieveDriver {
				association: &association,
				connection_name: &server.connection_name,
				task_uid: task.uid(),
				stop: task.stop_flag().clone(),
				timeout: context.settings.dimse_timeout,
				storage_directory: &context.settings.storage_directory,
				events,
			};

			let results = match server.retrieve_protocol {
				RetrieveProtocol::Get => {
					driver
						.get(
							spec.level,
							&spec.study_instance_uid,
							&spec.series_instance_uid,
							&spec.sop_instance_uid,
						)
						.await?
				}
				RetrieveProtocol::Move => {
					let destination = server
						.move_destination_ae_title
						.clone()
						.unwrap_or_default();
					driver
						.move_to(
							&destination,
							spec.level,
							&spec.study_instance_uid,
							&spec.series_instance_uid,
							&spec.sop_instance_uid,
						)
						.await?
				}
			};
			Ok(results)
		}
	}
}

#[cfg(test)]
mod tests;
