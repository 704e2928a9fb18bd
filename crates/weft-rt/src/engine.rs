//! The async task engine: live tasks keyed by id plus a FIFO ready queue.
//!
//! # Borrow discipline
//!
//! Engine state sits in a `RefCell` that is never borrowed while a task is
//! polled or dropped. Task code and task destructors call back into the
//! agent (spawn, abort, sleep, fd registration), so every step takes the
//! future out of its entry, releases the borrow, polls, and only then
//! re-borrows to put it back or retire the task.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::error::TaskError;
use crate::stats::{Counter, Counters};
use crate::task::{Completion, LocalWork, TaskId, TaskSpec};
use crate::waker::{task_waker, WakeQueue, WakeTarget};

/// Releases the driver registrations a task holds. Called before a task is
/// retired so no interest outlives its task.
pub(crate) trait Interests {
    fn release(&self, task: TaskId);
}

struct Task {
    /// `None` while the task is being polled.
    work: Option<Pin<Box<LocalWork>>>,
    completion: Arc<dyn Completion>,
    waker: Waker,
    queued: bool,
    /// Abort requested while the task was being polled.
    aborted: bool,
}

#[derive(Default)]
struct EngineState {
    tasks: HashMap<TaskId, Task>,
    ready: VecDeque<TaskId>,
}

enum Exit {
    Completed,
    Faulted(String),
    Cancelled,
}

pub(crate) struct Engine {
    state: RefCell<EngineState>,
    current: Cell<Option<TaskId>>,
    wakes: Arc<WakeQueue>,
    counters: Arc<Counters>,
}

impl Engine {
    pub(crate) fn new(wakes: Arc<WakeQueue>, counters: Arc<Counters>) -> Self {
        Self {
            state: RefCell::new(EngineState::default()),
            current: Cell::new(None),
            wakes,
            counters,
        }
    }

    /// Inserts the task and queues it for its first step.
    pub(crate) fn register(&self, spec: TaskSpec) -> TaskId {
        let id = spec.id;
        let task = Task {
            work: Some(spec.work),
            completion: spec.completion,
            waker: task_waker(id, Arc::clone(&self.wakes)),
            queued: true,
            aborted: false,
        };
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            debug_assert!(!state.tasks.contains_key(&id), "{id} registered twice");
            state.tasks.insert(id, task);
            state.ready.push_back(id);
        }
        self.counters.bump(Counter::Spawned);
        log::trace!("registered {id}");
        id
    }

    /// Queues a live task for its next step. Returns whether it was queued by
    /// this call; unknown, finished and already-queued ids are ignored.
    pub(crate) fn mark_ready(&self, id: TaskId) -> bool {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let Some(task) = state.tasks.get_mut(&id) else {
            return false;
        };
        if task.queued || task.aborted {
            return false;
        }
        task.queued = true;
        state.ready.push_back(id);
        true
    }

    /// Steps every task that was ready when the call began, once each.
    /// Tasks made ready during the pass wait for the next cycle. Returns
    /// whether any task was stepped.
    pub(crate) fn drive_ready(&self, interests: &dyn Interests) -> bool {
        let batch: Vec<TaskId> = self.state.borrow_mut().ready.drain(..).collect();
        let mut progressed = false;

        for id in batch {
            let taken = {
                let mut guard = self.state.borrow_mut();
                guard.tasks.get_mut(&id).and_then(|task| {
                    task.queued = false;
                    task.work.take().map(|work| (work, task.waker.clone()))
                })
            };
            let Some((mut work, waker)) = taken else {
                continue;
            };
            progressed = true;

            match self.step(id, &mut work, &waker) {
                Ok(Poll::Pending) => {
                    let leftover = {
                        let mut guard = self.state.borrow_mut();
                        match guard.tasks.get_mut(&id) {
                            Some(task) if !task.aborted => {
                                task.work = Some(work);
                                None
                            }
                            _ => Some(work),
                        }
                    };
                    if let Some(work) = leftover {
                        log::trace!("{id} aborted during its own step");
                        self.retire(id, work, Exit::Cancelled, interests);
                    }
                }
                Ok(Poll::Ready(())) => {
                    log::trace!("{id} completed");
                    self.retire(id, work, Exit::Completed, interests);
                }
                Err(message) => {
                    log::warn!("{id} faulted: {message}");
                    self.retire(id, work, Exit::Faulted(message), interests);
                }
            }
        }

        progressed
    }

    fn step(
        &self,
        id: TaskId,
        work: &mut Pin<Box<LocalWork>>,
        waker: &Waker,
    ) -> Result<Poll<()>, String> {
        let mut cx = Context::from_waker(waker);
        let outer = self.current.replace(Some(id));
        let polled = panic::catch_unwind(AssertUnwindSafe(|| work.as_mut().poll(&mut cx)));
        self.current.set(outer);
        polled.map_err(panic_message)
    }

    /// Cancels a live task. A task aborted while it is being polled is
    /// retired once its step returns. Returns whether the abort took.
    pub(crate) fn abort(&self, id: TaskId, interests: &dyn Interests) -> bool {
        let work = {
            let mut guard = self.state.borrow_mut();
            let Some(task) = guard.tasks.get_mut(&id) else {
                return false;
            };
            if task.aborted {
                return false;
            }
            match task.work.take() {
                Some(work) => work,
                None => {
                    task.aborted = true;
                    return true;
                }
            }
        };
        log::trace!("aborting {id}");
        self.retire(id, work, Exit::Cancelled, interests);
        true
    }

    /// Cancels every live task. Returns how many were cancelled.
    pub(crate) fn teardown(&self, interests: &dyn Interests) -> usize {
        let ids: Vec<TaskId> = self.state.borrow().tasks.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.abort(*id, interests))
            .count()
    }

    /// Removes the task and settles its outcome. Counters are bumped before
    /// the outcome becomes visible to handles; the work is dropped last.
    fn retire(&self, id: TaskId, work: Pin<Box<LocalWork>>, exit: Exit, interests: &dyn Interests) {
        interests.release(id);
        let task = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let task = state.tasks.remove(&id);
            if task.as_ref().is_some_and(|t| t.queued) {
                state.ready.retain(|queued| *queued != id);
            }
            task
        };

        if let Some(task) = task {
            match exit {
                Exit::Completed => {
                    self.counters.bump(Counter::Completed);
                    task.completion.publish();
                }
                Exit::Faulted(message) => {
                    self.counters.bump(Counter::Faulted);
                    task.completion.fail(TaskError::Fault(message));
                }
                Exit::Cancelled => {
                    self.counters.bump(Counter::Cancelled);
                    task.completion.fail(TaskError::Cancelled);
                }
            }
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(work))) {
            log::warn!("{id} panicked while dropped: {}", panic_message(payload));
        }
    }

    /// The task being polled right now, if any.
    pub(crate) fn current_task(&self) -> Option<TaskId> {
        self.current.get()
    }

    /// What a driver should wake for the task being polled with `waker`.
    /// The waker is kept only when it is not the task's own, i.e. the future
    /// is polled through a combinator.
    pub(crate) fn wake_target(&self, waker: &Waker) -> Option<WakeTarget> {
        let task = self.current.get()?;
        let state = self.state.borrow();
        let own = state
            .tasks
            .get(&task)
            .is_some_and(|entry| entry.waker.will_wake(waker));
        Some(WakeTarget {
            task,
            foreign: (!own).then(|| waker.clone()),
        })
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.state.borrow().tasks.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.borrow().tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.borrow().tasks.is_empty()
    }

    pub(crate) fn has_ready(&self) -> bool {
        !self.state.borrow().ready.is_empty()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked with a non-string payload".to_owned()
    }
}
