use crate::results::TaskResult;
use crate::task::TaskUid;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// Textual progress emitted by drivers at fixed breakpoints, so progress
/// dialogs can show both a message and a bar position.
#[derive(Debug, Clone)]
pub struct ProgressMessage {
	pub task_uid: TaskUid,
	pub message: String,
	pub percent: u8,
}

/// The outbound notification surface of the scheduler.
///
/// Events are delivered in the order the coordinating task produced them.
/// UI layers consume them from the receiver returned by
/// [`Scheduler::new`](crate::Scheduler::new).
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
	TaskStarted { task_uid: TaskUid },
	TaskFinished { task_uid: TaskUid },
	TaskCanceled { task_uid: TaskUid },
	/// One per result committed by the indexer; `None` retires the progress
	/// indicator of a task that finished without results.
	ProgressTaskDetail(Option<TaskResult>),
	/// Per-instance progress during a retrieve, for series progress bars.
	ProgressBarTaskDetail(TaskResult),
	Progress(ProgressMessage),
}

/// Cloneable emitter handed to drivers and the indexer. A dropped receiver
/// only downgrades emission to a no-op; the pipeline keeps running.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
	tx: UnboundedSender<SchedulerEvent>,
}

impl EventSink {
	pub(crate) fn channel() -> (Self, UnboundedReceiver<SchedulerEvent>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}

	pub(crate) fn emit(&self, event: SchedulerEvent) {
		if self.tx.send(event).is_err() {
			trace!("No event receiver attached, dropping scheduler event");
		}
	}

	pub(crate) fn progress(&self, task_uid: TaskUid, message: impl Into<String>, percent: u8) {
		self.emit(SchedulerEvent::Progress(ProgressMessage {
			task_uid,
			message: message.into(),
			percent,
		}));
	}
}
