//! Waking protocol.
//!
//! Every task owns one [`Waker`] that pushes the task's id onto the agent's
//! [`WakeQueue`]. The queue is drained into the engine's ready queue at the
//! start of every cycle. Wakes coming from other threads also notify the I/O
//! driver's poller so that a blocked agent returns from `poll` promptly.
//!
//! Drivers do not hold wakers for the common case. They store a
//! [`WakeTarget`]: the task id plus, only when the future was polled through
//! a combinator with its own waker, that foreign waker.

use std::sync::Arc;
use std::task::{Wake, Waker};

use concurrent_queue::ConcurrentQueue;

use crate::agent::AgentId;
use crate::context;
use crate::io::Notifier;
use crate::task::TaskId;

pub(crate) struct WakeQueue {
    ids: ConcurrentQueue<TaskId>,
    agent: AgentId,
    notifier: Notifier,
}

impl WakeQueue {
    pub(crate) fn new(agent: AgentId, notifier: Notifier) -> Self {
        Self {
            ids: ConcurrentQueue::unbounded(),
            agent,
            notifier,
        }
    }

    pub(crate) fn push(&self, id: TaskId) {
        // Closed only after the agent stopped; nobody is left to wake.
        if self.ids.push(id).is_err() {
            return;
        }
        if !context::is_agent_thread(self.agent) {
            self.notifier.notify();
        }
    }

    /// Pops at most the number of ids queued at the time of the call.
    pub(crate) fn drain_snapshot(&self) -> Vec<TaskId> {
        let pending = self.ids.len();
        let mut ids = Vec::with_capacity(pending);
        for _ in 0..pending {
            match self.ids.pop() {
                Ok(id) => ids.push(id),
                Err(_) => break,
            }
        }
        ids
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub(crate) fn close(&self) {
        self.ids.close();
    }
}

struct TaskWaker {
    id: TaskId,
    queue: Arc<WakeQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        log::trace!("wake {}", self.id);
        self.queue.push(self.id);
    }
}

pub(crate) fn task_waker(id: TaskId, queue: Arc<WakeQueue>) -> Waker {
    Waker::from(Arc::new(TaskWaker { id, queue }))
}

/// What a driver wakes when an interest fires.
#[derive(Clone, Debug)]
pub(crate) struct WakeTarget {
    pub(crate) task: TaskId,
    pub(crate) foreign: Option<Waker>,
}

impl WakeTarget {
    /// Whether both targets would deliver the same wake.
    pub(crate) fn same_as(&self, other: &WakeTarget) -> bool {
        self.task == other.task
            && match (&self.foreign, &other.foreign) {
                (None, None) => true,
                (Some(a), Some(b)) => a.will_wake(b),
                _ => false,
            }
    }

    /// Wakes the foreign waker, if any, and returns the task to mark ready.
    pub(crate) fn fire(self) -> TaskId {
        if let Some(waker) = self.foreign {
            waker.wake();
        }
        self.task
    }
}

impl From<TaskId> for WakeTarget {
    fn from(task: TaskId) -> Self {
        Self {
            task,
            foreign: None,
        }
    }
}
