use crate::task::{Task, TaskUid};
use crate::types::TaskPriority;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// The pending-task queue of the worker pool: one FIFO lane per priority,
/// drained high to low.
///
/// Tasks can be taken back out while still queued (`take`), which is how
/// priority re-queueing and stop-before-start work; a task that has been
/// popped by a worker is beyond the queue's reach.
pub(crate) struct TaskQueue {
	lanes: Mutex<Lanes>,
	notify: Notify,
}

#[derive(Default)]
struct Lanes {
	high: VecDeque<Arc<Task>>,
	normal: VecDeque<Arc<Task>>,
	low: VecDeque<Arc<Task>>,
	closed: bool,
}

impl Lanes {
	fn lane_mut(&mut self, priority: TaskPriority) -> &mut VecDeque<Arc<Task>> {
		match priority {
			TaskPriority::High => &mut self.high,
			TaskPriority::Normal => &mut self.normal,
			TaskPriority::Low => &mut self.low,
		}
	}

	fn pop(&mut self) -> Option<Arc<Task>> {
		self.high
			.pop_front()
			.or_else(|| self.normal.pop_front())
			.or_else(|| self.low.pop_front())
	}

	fn len(&self) -> usize {
		self.high.len() + self.normal.len() + self.low.len()
	}
}

impl TaskQueue {
	pub(crate) fn new() -> Self {
		Self {
			lanes: Mutex::new(Lanes::default()),
			notify: Notify::new(),
		}
	}

	pub(crate) fn push(&self, task: Arc<Task>, priority: TaskPriority) {
		{
			let mut lanes = self.lanes.lock().expect("queue mutex should not be poisoned");
			if lanes.closed {
				return;
			}
			lanes.lane_mut(priority).push_back(task);
		}
		self.notify.notify_one();
	}

	/// The next task in priority order. Returns `None` once the queue is
	/// closed and drained; workers use that as their shutdown signal.
	pub(crate) async fn next(&self) -> Option<Arc<Task>> {
		loop {
			let notified = self.notify.notified();
			{
				let mut lanes = self.lanes.lock().expect("queue mutex should not be poisoned");
				if let Some(task) = lanes.pop() {
					// Wake another worker in case more tasks are pending.
					self.notify.notify_one();
					return Some(task);
				}
				if lanes.closed {
					self.notify.notify_one();
					return None;
				}
			}
			notified.await;
		}
	}

	/// Removes a still-queued task, reporting the lane it sat in.
	pub(crate) fn take(&self, uid: TaskUid) -> Option<(Arc<Task>, TaskPriority)> {
		let mut lanes = self.lanes.lock().expect("queue mutex should not be poisoned");
		for priority in [TaskPriority::High, TaskPriority::Normal, TaskPriority::Low] {
			let lane = lanes.lane_mut(priority);
			if let Some(position) = lane.iter().position(|task| task.uid() == uid) {
				let task = lane.remove(position).expect("position was just found");
				return Some((task, priority));
			}
		}
		None
	}

	/// Empties the queue, returning the tasks in priority order.
	pub(crate) fn take_all(&self) -> Vec<Arc<Task>> {
		let mut lanes = self.lanes.lock().expect("queue mutex should not be poisoned");
		let mut tasks = Vec::with_capacity(lanes.len());
		tasks.extend(lanes.high.drain(..));
		tasks.extend(lanes.normal.drain(..));
		tasks.extend(lanes.low.drain(..));
		tasks
	}

	/// Moves every queued task to the low lane, preserving relative order.
	pub(crate) fn demote_all(&self) {
		let mut lanes = self.lanes.lock().expect("queue mutex should not be poisoned");
		let mut demoted: Vec<_> = lanes.high.drain(..).collect();
		demoted.extend(lanes.normal.drain(..));
		for task in demoted {
			lanes.low.push_back(task);
		}
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.lanes
			.lock()
			.expect("queue mutex should not be poisoned")
			.len()
	}

	/// The lane a task currently waits in, if it is still queued.
	#[cfg(test)]
	pub(crate) fn queued_priority(&self, uid: TaskUid) -> Option<TaskPriority> {
		let mut lanes = self.lanes.lock().expect("queue mutex should not be poisoned");
		for priority in [TaskPriority::High, TaskPriority::Normal, TaskPriority::Low] {
			if lanes
				.lane_mut(priority)
				.iter()
				.any(|task| task.uid() == uid)
			{
				return Some(priority);
			}
		}
		None
	}

	/// Closes the queue: pending pushes are rejected and workers drain out.
	pub(crate) fn close(&self) {
		{
			let mut lanes = self.lanes.lock().expect("queue mutex should not be poisoned");
			lanes.closed = true;
		}
		self.notify.notify_waiters();
		self.notify.notify_one();
	}
}
