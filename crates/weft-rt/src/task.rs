//! Tasks as seen from outside the engine: identity, the completion slot a
//! task fills exactly once, the work package carried into the engine, and
//! the [`TaskHandle`] returned to whoever spawned it.

use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use crate::client::RuntimeClient;
use crate::context;
use crate::error::{Outcome, TaskError};

/// Identity of a task. Minted from a process-wide counter, so an id is never
/// reused and a stale wake can only ever miss.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Type-erased access to a completion slot, used by the engine to deliver
/// outcomes without knowing the task's output type.
pub(crate) trait Completion: Send + Sync {
    /// Makes a staged output visible. Returns whether there was one.
    fn publish(&self) -> bool;

    fn fail(&self, error: TaskError);
}

enum SlotState<T> {
    Empty(Vec<Waker>),
    Filled(Outcome<T>),
    Taken,
}

/// Single-assignment cell shared between a task and its handle.
///
/// A finished future stages its output first. Handles only see it after the
/// engine has accounted for the task and published it.
pub(crate) struct Slot<T> {
    state: Mutex<SlotState<T>>,
    staged: Mutex<Option<T>>,
    filled: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty(Vec::new())),
            staged: Mutex::new(None),
            filled: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stage(&self, value: T) {
        *self.staged.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    /// Stores the outcome unless one is already present. Returns whether this
    /// call filled the slot.
    pub(crate) fn fill(&self, outcome: Outcome<T>) -> bool {
        let waiters = {
            let mut state = self.lock();
            let waiters = match &mut *state {
                SlotState::Empty(waiters) => mem::take(waiters),
                _ => return false,
            };
            *state = SlotState::Filled(outcome);
            waiters
        };

        self.filled.notify_all();
        for waker in waiters {
            waker.wake();
        }
        true
    }

    pub(crate) fn is_filled(&self) -> bool {
        !matches!(*self.lock(), SlotState::Empty(_))
    }

    pub(crate) fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Outcome<T>> {
        let mut state = self.lock();
        match mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Filled(outcome) => Poll::Ready(outcome),
            SlotState::Empty(mut waiters) => {
                if !waiters.iter().any(|w| w.will_wake(cx.waker())) {
                    waiters.push(cx.waker().clone());
                }
                *state = SlotState::Empty(waiters);
                Poll::Pending
            }
            SlotState::Taken => panic!("TaskHandle polled after its outcome was taken"),
        }
    }

    pub(crate) fn wait_take(&self) -> Outcome<T> {
        let mut state = self.lock();
        loop {
            match mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Filled(outcome) => return outcome,
                SlotState::Empty(waiters) => {
                    *state = SlotState::Empty(waiters);
                    state = self
                        .filled
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                SlotState::Taken => panic!("task outcome already taken"),
            }
        }
    }
}

impl<T: Send> Completion for Slot<T> {
    fn publish(&self) -> bool {
        let staged = self
            .staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match staged {
            Some(value) => self.fill(Ok(value)),
            None => false,
        }
    }

    fn fail(&self, error: TaskError) {
        self.fill(Err(error));
    }
}

pub(crate) type LocalWork = dyn Future<Output = ()>;
pub(crate) type SendWork = dyn Future<Output = ()> + Send;

/// Everything the engine needs to register a task. The user future is
/// wrapped so that its output is staged in the slot when it resolves.
pub(crate) struct TaskSpec<W: ?Sized = LocalWork> {
    pub(crate) id: TaskId,
    pub(crate) work: Pin<Box<W>>,
    pub(crate) completion: Arc<dyn Completion>,
}

/// Wraps `future` so that its output is staged in the returned slot. The
/// engine publishes it once the task is retired.
fn package<F>(future: F) -> (impl Future<Output = ()>, Arc<Slot<F::Output>>)
where
    F: Future + 'static,
    F::Output: Send + 'static,
{
    let slot = Arc::new(Slot::new());
    let stager = Arc::clone(&slot);
    let work = async move {
        let value = future.await;
        stager.stage(value);
    };
    (work, slot)
}

impl TaskSpec<SendWork> {
    pub(crate) fn new<F>(future: F) -> (Self, Arc<Slot<F::Output>>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (work, slot) = package(future);
        let work: Pin<Box<SendWork>> = Box::pin(work);
        (Self::with_work(work, slot.clone()), slot)
    }

    pub(crate) fn into_local(self) -> TaskSpec {
        let work: Pin<Box<LocalWork>> = self.work;
        TaskSpec {
            id: self.id,
            work,
            completion: self.completion,
        }
    }
}

impl TaskSpec {
    pub(crate) fn new_local<F>(future: F) -> (Self, Arc<Slot<F::Output>>)
    where
        F: Future + 'static,
        F::Output: Send + 'static,
    {
        let (work, slot) = package(future);
        let work: Pin<Box<LocalWork>> = Box::pin(work);
        (Self::with_work(work, slot.clone()), slot)
    }
}

impl<W: ?Sized> TaskSpec<W> {
    fn with_work(work: Pin<Box<W>>, completion: Arc<dyn Completion>) -> Self {
        TaskSpec {
            id: TaskId::next(),
            work,
            completion,
        }
    }
}

/// Observer of a spawned task's outcome.
///
/// Awaiting the handle from inside a task suspends that task until the
/// outcome is available. From a plain thread, use [`TaskHandle::join`].
/// Dropping the handle detaches the task; it keeps running.
pub struct TaskHandle<T> {
    id: TaskId,
    slot: Arc<Slot<T>>,
    client: RuntimeClient,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(id: TaskId, slot: Arc<Slot<T>>, client: RuntimeClient) -> Self {
        Self { id, slot, client }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the completion slot has been filled.
    pub fn is_finished(&self) -> bool {
        self.slot.is_filled()
    }

    /// Requests cancellation. The task's I/O and timer interests are released
    /// and its outcome becomes [`TaskError::Cancelled`] unless it finished
    /// first. On the owning agent's thread this takes effect immediately, or
    /// as soon as the task's queued Spawn is handled. Elsewhere it travels
    /// through the command queue.
    pub fn abort(&self) {
        if self.is_finished() {
            return;
        }
        match context::current_agent() {
            Some(agent) if agent.id() == self.client.agent_id() => {
                agent.abort(self.id);
            }
            _ => {
                if let Err(err) = self.client.abort(self.id) {
                    log::debug!("abort of {} not delivered: {err}", self.id);
                }
            }
        }
    }

    /// Blocks the calling thread until the task finishes.
    ///
    /// # Panics
    ///
    /// Panics when called on an agent thread, where blocking would stall
    /// every task including the one being waited for. Await the handle
    /// instead.
    pub fn join(self) -> Outcome<T> {
        if context::current_agent().is_some() {
            panic!("TaskHandle::join called on an agent thread; await the handle instead");
        }
        self.slot.wait_take()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.slot.poll_take(cx)
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;
    use std::thread;
    use std::time::Duration;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn task_ids_are_unique_and_increasing() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert!(b > a);
        assert_eq!(format!("{a}"), format!("task#{}", a.as_u64()));
    }

    #[test]
    fn slot_fills_exactly_once() {
        let slot = Slot::new();
        assert!(!slot.is_filled());
        assert!(slot.fill(Ok(1)));
        assert!(!slot.fill(Ok(2)));
        assert!(slot.is_filled());
        assert_eq!(slot.wait_take(), Ok(1));
    }

    #[test]
    fn staged_output_stays_hidden_until_published() {
        let slot = Arc::new(Slot::new());
        let completion: Arc<dyn Completion> = slot.clone();
        slot.stage(3u8);
        assert!(!slot.is_filled());

        assert!(completion.publish());
        assert!(!completion.publish());
        assert_eq!(slot.wait_take(), Ok(3));
    }

    #[test]
    fn failure_through_completion_trait() {
        let slot = Arc::new(Slot::<u32>::new());
        let completion: Arc<dyn Completion> = slot.clone();
        completion.fail(TaskError::Cancelled);
        assert_eq!(slot.wait_take(), Err(TaskError::Cancelled));
    }

    #[test]
    fn pending_poll_registers_waker_once_and_fill_wakes_it() {
        let slot = Slot::<&str>::new();
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut cx = Context::from_waker(&waker);

        assert!(slot.poll_take(&mut cx).is_pending());
        assert!(slot.poll_take(&mut cx).is_pending());
        slot.fill(Ok("done"));

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(slot.poll_take(&mut cx), Poll::Ready(Ok("done")));
    }

    #[test]
    fn wait_take_blocks_until_another_thread_fills() {
        let slot = Arc::new(Slot::new());
        let filler = slot.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            filler.fill(Ok(7u8));
        });

        assert_eq!(slot.wait_take(), Ok(7));
        worker.join().unwrap();
    }
}
