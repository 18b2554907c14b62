use super::*;
use crate::database::testing::RecordingDatabase;
use crate::dimse::testing::{
	find_pending, find_success, get_success, identifier_with, inbound_store, move_pending,
	move_success, MockConnector, MockScript,
};
use crate::server::test_descriptor;
use dicom::dictionary_std::tags;
use dicom::ul::Pdu;

fn test_config(workers: usize) -> SchedulerConfig {
	SchedulerConfig {
		maximum_worker_count: workers,
		retry_delay: 5,
		storage_directory: std::env::temp_dir().join(format!(
			"dicom-scheduler-test-{}",
			uuid::Uuid::new_v4()
		)),
		..SchedulerConfig::default()
	}
}

fn scheduler_with(
	workers: usize,
	scripts: Vec<MockScript>,
) -> (
	Scheduler<MockConnector>,
	UnboundedReceiver<SchedulerEvent>,
	Arc<RecordingDatabase>,
	MockConnector,
) {
	let database = Arc::new(RecordingDatabase::default());
	let connector = MockConnector::new(scripts);
	let (scheduler, events) = Scheduler::with_connector(
		test_config(workers),
		Arc::clone(&database) as Arc<dyn DicomDatabase>,
		connector.clone(),
	);
	(scheduler, events, database, connector)
}

async fn register(scheduler: &Scheduler<MockConnector>, server: ServerDescriptor) {
	scheduler
		.add_server(server)
		.await
		.expect("server should register");
}

async fn drain_events(events: &mut UnboundedReceiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
	// Let detached indexer tasks finish before collecting.
	tokio::time::sleep(Duration::from_millis(50)).await;
	let mut seen = Vec::new();
	while let Ok(event) = events.try_recv() {
		seen.push(event);
	}
	seen
}

fn study_responses(uids_found: &[&str]) -> Vec<Pdu> {
	let mut pdus = Vec::new();
	for uid in uids_found {
		pdus.extend(find_pending(identifier_with(&[(
			tags::STUDY_INSTANCE_UID,
			uid,
		)])));
	}
	pdus.extend(find_success());
	pdus
}

#[tokio::test]
async fn zero_enabled_servers_is_a_noop() {
	let (scheduler, mut events, database, connector) = scheduler_with(1, Vec::new());

	scheduler.query_patients(TaskPriority::Normal);
	scheduler.retrieve_series("1.2", "1.2.3", TaskPriority::Normal);
	tokio::time::sleep(Duration::from_millis(20)).await;

	assert_eq!(scheduler.total_tasks(), 0);
	assert_eq!(connector.connection_count(), 0);
	assert_eq!(database.dataset_count(), 0);
	assert!(drain_events(&mut events).await.is_empty());
}

#[tokio::test]
async fn disabled_servers_are_skipped() {
	let (scheduler, _events, _database, connector) = scheduler_with(1, Vec::new());
	let mut server = test_descriptor("PACS1", RetrieveProtocol::Get);
	server.query_retrieve_enabled = false;
	register(&scheduler, server).await;

	scheduler.query_patients(TaskPriority::Normal);
	tokio::time::sleep(Duration::from_millis(20)).await;

	assert_eq!(scheduler.total_tasks(), 0);
	assert_eq!(connector.connection_count(), 0);
}

#[tokio::test]
async fn patient_query_flows_to_indexer() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
	let (scheduler, mut events, database, _connector) = scheduler_with(
		1,
		vec![MockScript::Serve(study_responses(&["1.2.1", "1.2.2"]))],
	);
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	scheduler.query_patients(TaskPriority::Normal);
	assert!(scheduler.wait_for_finish(Some(Duration::from_secs(2))).await);

	let seen = drain_events(&mut events).await;
	assert!(seen
		.iter()
		.any(|event| matches!(event, SchedulerEvent::TaskStarted { .. })));
	assert!(seen
		.iter()
		.any(|event| matches!(event, SchedulerEvent::TaskFinished { .. })));
	let committed = seen
		.iter()
		.filter(|event| matches!(event, SchedulerEvent::ProgressTaskDetail(Some(_))))
		.count();
	assert_eq!(committed, 2);
	assert_eq!(database.dataset_count(), 2);
	assert_eq!(scheduler.total_tasks(), 0);
}

#[tokio::test]
async fn failed_attempts_retry_with_fresh_identity() {
	let (scheduler, mut events, _database, connector) = scheduler_with(
		1,
		vec![
			MockScript::Refuse,
			MockScript::Refuse,
			MockScript::Serve(study_responses(&["1.2.1"])),
		],
	);
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	scheduler.query_studies("P1", TaskPriority::Normal);
	assert!(scheduler.wait_for_finish(Some(Duration::from_secs(2))).await);

	// Two refused attempts, then the third succeeded.
	assert_eq!(connector.connection_count(), 3);

	let seen = drain_events(&mut events).await;
	let mut attempt_uids = Vec::new();
	for event in &seen {
		match event {
			SchedulerEvent::TaskCanceled { task_uid } | SchedulerEvent::TaskFinished { task_uid } => {
				attempt_uids.push(*task_uid);
			}
			_ => {}
		}
	}
	assert_eq!(attempt_uids.len(), 3);
	attempt_uids.dedup();
	assert_eq!(attempt_uids.len(), 3, "each attempt gets a fresh task UID");
	assert!(seen
		.iter()
		.any(|event| matches!(event, SchedulerEvent::TaskFinished { .. })));
}

#[tokio::test]
async fn retries_stop_at_the_budget() {
	let (scheduler, mut events, database, connector) = scheduler_with(
		1,
		vec![
			MockScript::Refuse,
			MockScript::Refuse,
			MockScript::Refuse,
			MockScript::Refuse,
			MockScript::Refuse,
		],
	);
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	scheduler.query_studies("P1", TaskPriority::Normal);
	assert!(scheduler.wait_for_finish(Some(Duration::from_secs(2))).await);

	// The first attempt plus maximum_number_of_retry (3) retries.
	assert_eq!(connector.connection_count(), 4);
	assert_eq!(database.dataset_count(), 0);

	let seen = drain_events(&mut events).await;
	assert!(
		seen.iter()
			.any(|event| matches!(event, SchedulerEvent::ProgressTaskDetail(None))),
		"exhausted retries retire the progress indicator"
	);
}

#[tokio::test]
async fn stopping_before_start_leaves_database_unchanged() {
	let (scheduler, mut events, database, connector) = scheduler_with(0, Vec::new());
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	scheduler.retrieve_series("1.2", "1.2.3", TaskPriority::Normal);
	scheduler.retrieve_series("1.2", "1.2.4", TaskPriority::Normal);
	scheduler.query_studies("P1", TaskPriority::Normal);
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert_eq!(scheduler.total_tasks(), 3);

	scheduler.stop_all_tasks();
	assert!(scheduler.wait_for_finish(Some(Duration::from_secs(1))).await);

	assert_eq!(connector.connection_count(), 0);
	assert_eq!(database.dataset_count(), 0);
	assert_eq!(database.file_count(), 0);
	let seen = drain_events(&mut events).await;
	let canceled = seen
		.iter()
		.filter(|event| matches!(event, SchedulerEvent::TaskCanceled { .. }))
		.count();
	assert_eq!(canceled, 3, "withdrawn tasks are canceled, never retried");
}

#[tokio::test]
async fn stop_tasks_withdraws_only_the_selection() {
	let (scheduler, _events, _database, _connector) = scheduler_with(0, Vec::new());
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	scheduler.retrieve_series("1.2", "1.2.3", TaskPriority::Normal);
	scheduler.retrieve_series("9.9", "9.9.1", TaskPriority::Normal);
	tokio::time::sleep(Duration::from_millis(20)).await;

	scheduler.stop_tasks("1.2", "", "");
	tokio::time::sleep(Duration::from_millis(20)).await;

	assert_eq!(scheduler.total_tasks(), 1, "unrelated task keeps waiting");

	scheduler.stop_all_tasks();
	scheduler.wait_for_finish(None).await;
}

#[tokio::test]
async fn stop_all_not_started_spares_nothing_queued() {
	let (scheduler, _events, _database, _connector) = scheduler_with(0, Vec::new());
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	scheduler.retrieve_series("1.2", "1.2.3", TaskPriority::Normal);
	scheduler.retrieve_series("1.2", "1.2.4", TaskPriority::Low);
	tokio::time::sleep(Duration::from_millis(20)).await;

	scheduler.stop_all_tasks_not_started();
	assert!(scheduler.wait_for_finish(Some(Duration::from_secs(1))).await);
	assert_eq!(scheduler.total_tasks(), 0);
}

#[tokio::test]
async fn raising_series_priority_reorders_the_queue() {
	let (scheduler, _events, _database, _connector) = scheduler_with(0, Vec::new());
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	for series in ["1.2.1", "1.2.2", "1.2.3", "1.2.4"] {
		scheduler.retrieve_series("1.2", series, TaskPriority::Low);
	}
	scheduler.retrieve_series("1.2", "1.2.5", TaskPriority::Low);
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert_eq!(scheduler.queue().len(), 5);

	scheduler.raise_retrieve_frames_tasks_priority_for_series("1.2", "1.2.3", TaskPriority::High);
	tokio::time::sleep(Duration::from_millis(20)).await;

	// Priority order: the focused series first, the other four at low.
	let drained = scheduler.queue().take_all();
	assert_eq!(drained.len(), 5);
	assert!(drained[0].is_series_retrieve_for("1.2", "1.2.3"));
	assert!(drained[1..]
		.iter()
		.all(|task| !task.is_series_retrieve_for("1.2", "1.2.3")));
}

#[tokio::test]
async fn cmove_completion_chains_a_proxy_cget() {
	let mut proxy = test_descriptor("PACS2_GET", RetrieveProtocol::Get);
	proxy.keep_association_open = false;
	let mut server = test_descriptor("PACS2", RetrieveProtocol::Move);
	server.move_destination_ae_title = Some(String::from("SCHEDSTORE"));
	server.proxy_server = Some(Box::new(proxy));

	let instance = identifier_with(&[
		(tags::STUDY_INSTANCE_UID, "1.2"),
		(tags::SERIES_INSTANCE_UID, "1.2.3"),
		(tags::SOP_INSTANCE_UID, "1.2.3.1"),
	]);
	let mut move_script = Vec::new();
	move_script.extend(move_pending(1, 0));
	move_script.extend(move_success(1));
	let mut get_script = Vec::new();
	get_script.extend(inbound_store("1.2.3.1", instance));
	get_script.extend(get_success(1));

	let (scheduler, mut events, database, connector) = scheduler_with(
		1,
		vec![MockScript::Serve(move_script), MockScript::Serve(get_script)],
	);
	register(&scheduler, server).await;

	scheduler.retrieve_series("1.2", "1.2.3", TaskPriority::Normal);
	assert!(scheduler.wait_for_finish(Some(Duration::from_secs(2))).await);

	// One association for the C-MOVE, a second against the proxy.
	assert_eq!(connector.connection_count(), 2);
	assert_eq!(connector.served.lock().unwrap().len(), 2);

	let seen = drain_events(&mut events).await;
	let finished = seen
		.iter()
		.filter(|event| matches!(event, SchedulerEvent::TaskFinished { .. }))
		.count();
	assert_eq!(finished, 2, "the move task and the chained get task");
	// The chained C-GET stored and indexed the instance.
	assert_eq!(database.file_count(), 1);
}

#[tokio::test]
async fn canceled_task_results_are_discarded() {
	// The association dies after the first pending response, so the task
	// cancels with partial results which must never reach the indexer.
	let mut script = Vec::new();
	script.extend(find_pending(identifier_with(&[(
		tags::STUDY_INSTANCE_UID,
		"1.2.1",
	)])));

	let (scheduler, mut events, database, _connector) =
		scheduler_with(1, vec![MockScript::Serve(script)]);
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;
	scheduler.set_maximum_number_of_retry(0);

	scheduler.query_studies("P1", TaskPriority::Normal);
	assert!(scheduler.wait_for_finish(Some(Duration::from_secs(2))).await);

	assert_eq!(database.dataset_count(), 0);
	let seen = drain_events(&mut events).await;
	assert!(seen
		.iter()
		.any(|event| matches!(event, SchedulerEvent::TaskCanceled { .. })));
	assert!(!seen
		.iter()
		.any(|event| matches!(event, SchedulerEvent::ProgressTaskDetail(Some(_)))));
}

#[tokio::test]
async fn empty_query_result_retires_progress() {
	let (scheduler, mut events, database, _connector) =
		scheduler_with(1, vec![MockScript::Serve(find_success())]);
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	scheduler.query_studies("P1", TaskPriority::Normal);
	assert!(scheduler.wait_for_finish(Some(Duration::from_secs(2))).await);

	assert_eq!(database.dataset_count(), 0);
	let seen = drain_events(&mut events).await;
	assert!(seen
		.iter()
		.any(|event| matches!(event, SchedulerEvent::ProgressTaskDetail(None))));
}

#[tokio::test]
async fn wait_for_finish_times_out_while_tasks_wait() {
	let (scheduler, _events, _database, _connector) = scheduler_with(0, Vec::new());
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	scheduler.query_patients(TaskPriority::Normal);
	tokio::time::sleep(Duration::from_millis(20)).await;

	assert!(
		!scheduler
			.wait_for_finish(Some(Duration::from_millis(10)))
			.await
	);

	scheduler.stop_all_tasks();
	scheduler.wait_for_finish(None).await;
}

#[tokio::test]
async fn duplicate_server_names_are_rejected() {
	let (scheduler, _events, _database, _connector) = scheduler_with(1, Vec::new());
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	let duplicate = scheduler
		.add_server(test_descriptor("PACS1", RetrieveProtocol::Get))
		.await;
	assert!(matches!(duplicate, Err(ScheduleError::DuplicateServer(_))));

	let missing = scheduler.remove_server("NOPE").await;
	assert!(matches!(missing, Err(ScheduleError::UnknownServer(_))));

	assert_eq!(scheduler.server_count().await, 1);
	assert!(scheduler.server("PACS1").await.is_some());
}

#[tokio::test]
async fn invalid_move_server_is_rejected_before_registration() {
	let (scheduler, _events, _database, _connector) = scheduler_with(1, Vec::new());
	let server = test_descriptor("PACS2", RetrieveProtocol::Move);

	let result = scheduler.add_server(server).await;
	assert!(matches!(result, Err(ScheduleError::InvalidServer(_))));
	assert_eq!(scheduler.server_count().await, 0);
}

#[tokio::test]
async fn filters_snapshot_applies_to_new_tasks() {
	let (scheduler, _events, _database, _connector) = scheduler_with(0, Vec::new());
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	scheduler.set_filters(QueryFilters::from_pairs([("Name", "DOE")]));
	scheduler.query_patients(TaskPriority::Normal);
	tokio::time::sleep(Duration::from_millis(20)).await;

	let queued = scheduler.queue().take_all();
	assert_eq!(queued.len(), 1);
	match queued[0].kind() {
		TaskKind::Query(spec) => {
			assert_eq!(spec.filters.name.as_deref(), Some("DOE"));
		}
		TaskKind::Retrieve(_) => panic!("expected a query task"),
	}
}

#[tokio::test]
async fn property_accessors_round_trip() {
	let (scheduler, _events, _database, _connector) = scheduler_with(2, Vec::new());

	assert_eq!(scheduler.maximum_thread_count(), 2);

	scheduler.set_maximum_number_of_retry(7);
	assert_eq!(scheduler.maximum_number_of_retry(), 7);

	scheduler.set_retry_delay(Duration::from_millis(250));
	assert_eq!(scheduler.retry_delay(), Duration::from_millis(250));

	scheduler.set_maximum_patients_query(5);
	assert_eq!(scheduler.maximum_patients_query(), 5);
}

#[tokio::test]
async fn growing_the_pool_picks_up_waiting_tasks() {
	let (scheduler, _events, database, _connector) = scheduler_with(
		0,
		vec![MockScript::Serve(study_responses(&["1.2.1"]))],
	);
	register(&scheduler, test_descriptor("PACS1", RetrieveProtocol::Get)).await;

	scheduler.query_studies("P1", TaskPriority::Normal);
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert_eq!(scheduler.total_tasks(), 1, "no workers, the task waits");

	scheduler.set_maximum_thread_count(1);
	assert_eq!(scheduler.maximum_thread_count(), 1);
	assert!(scheduler.wait_for_finish(Some(Duration::from_secs(2))).await);

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(database.dataset_count(), 1);
}
