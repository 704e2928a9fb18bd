//! The runtime agent: owns the engine and both drivers on one thread and
//! runs the worker loop.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use crate::client::{RuntimeClient, Shared};
use crate::command::Command;
use crate::context;
use crate::engine::{Engine, Interests};
use crate::error::{RuntimeError, TaskError};
use crate::io::{Interest, IoDriver, SourceKey};
use crate::stats::Counter;
use crate::task::{TaskId, TaskSpec};
use crate::timer::{TimerDriver, TimerId};
use crate::waker::{WakeQueue, WakeTarget};

/// Identity of an agent, unique within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AgentId(u64);

impl AgentId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        AgentId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AgentState {
    Running,
    /// Shutdown received: no new spawns, live tasks run to completion.
    Draining,
    Stopped,
}

/// Everything built on the caller's thread and moved into the agent thread.
pub(crate) struct AgentParts {
    pub(crate) shared: Arc<Shared>,
    pub(crate) wakes: Arc<WakeQueue>,
    pub(crate) io: IoDriver,
    pub(crate) drain_timeout: Option<Duration>,
}

pub(crate) struct Agent {
    id: AgentId,
    shared: Arc<Shared>,
    wakes: Arc<WakeQueue>,
    engine: Engine,
    io: RefCell<IoDriver>,
    timers: RefCell<TimerDriver>,
    state: Cell<AgentState>,
    drain_timeout: Option<Duration>,
    drain_deadline: Cell<Option<Instant>>,
    /// Aborts requested on this thread for tasks whose Spawn is still queued.
    pending_aborts: RefCell<HashSet<TaskId>>,
}

impl Agent {
    pub(crate) fn new(parts: AgentParts) -> Self {
        let AgentParts {
            shared,
            wakes,
            io,
            drain_timeout,
        } = parts;
        Self {
            id: shared.agent,
            engine: Engine::new(Arc::clone(&wakes), Arc::clone(&shared.counters)),
            shared,
            wakes,
            io: RefCell::new(io),
            timers: RefCell::new(TimerDriver::new()),
            state: Cell::new(AgentState::Running),
            drain_timeout,
            drain_deadline: Cell::new(None),
            pending_aborts: RefCell::new(HashSet::new()),
        }
    }

    pub(crate) fn id(&self) -> AgentId {
        self.id
    }

    pub(crate) fn client(&self) -> RuntimeClient {
        RuntimeClient::new(Arc::clone(&self.shared))
    }

    /// Runs the worker loop on the current thread until the agent stops.
    ///
    /// A fatal poller failure ends the loop early; live tasks are still torn
    /// down before the error is returned.
    pub(crate) fn run(self: Rc<Self>) -> io::Result<()> {
        let _guard = context::enter(Rc::clone(&self));
        log::debug!("{} running", self.id);

        let result = self.run_loop();
        if let Err(err) = &result {
            log::error!("{} poller failed: {err}", self.id);
        }
        self.finish();

        log::debug!("{} stopped", self.id);
        result
    }

    fn run_loop(&self) -> io::Result<()> {
        loop {
            let mut progressed = self.drain_commands();
            self.drain_wakes();
            progressed |= self.engine.drive_ready(self);

            if self.state.get() == AgentState::Draining {
                if !progressed && self.is_idle() {
                    return Ok(());
                }
                if self
                    .drain_deadline
                    .get()
                    .is_some_and(|deadline| Instant::now() >= deadline)
                {
                    let cancelled = self.engine.teardown(self);
                    log::debug!("{} drain timed out, cancelled {cancelled} tasks", self.id);
                    return Ok(());
                }
            }

            let timeout = self.next_timeout(progressed);
            let fired = self.io.borrow_mut().poll(timeout)?;
            self.wake_all(fired);
            let due = self.timers.borrow_mut().fire_due();
            self.wake_all(due);
        }
    }

    /// Handles the commands queued when the cycle began. Returns whether
    /// there were any.
    fn drain_commands(&self) -> bool {
        let commands = self.shared.commands.drain_snapshot();
        let received = !commands.is_empty();
        for command in commands {
            self.shared.counters.bump(Counter::CommandReceived);
            log::trace!("{} received {command:?}", self.id);
            match command {
                Command::Spawn(spec) => {
                    let spec = spec.into_local();
                    if self.state.get() != AgentState::Running {
                        self.reject(spec);
                        continue;
                    }
                    let id = self.engine.register(spec);
                    if self.pending_aborts.borrow_mut().remove(&id) {
                        log::trace!("{} applying deferred abort of {id}", self.id);
                        self.engine.abort(id, self);
                    }
                }
                Command::Abort(id) => {
                    self.engine.abort(id, self);
                }
                Command::Shutdown => self.begin_drain(),
            }
        }
        received
    }

    fn drain_wakes(&self) {
        for id in self.wakes.drain_snapshot() {
            self.engine.mark_ready(id);
        }
    }

    fn begin_drain(&self) {
        if self.state.get() != AgentState::Running {
            return;
        }
        self.state.set(AgentState::Draining);
        self.shared.stop_accepting();
        self.drain_deadline
            .set(self.drain_timeout.map(|timeout| Instant::now() + timeout));
        log::debug!(
            "{} draining with {} live tasks",
            self.id,
            self.engine.len()
        );
    }

    fn reject(&self, spec: TaskSpec) {
        self.pending_aborts.borrow_mut().remove(&spec.id);
        log::debug!("{} rejected {}: no longer accepting work", self.id, spec.id);
        self.shared.counters.bump(Counter::Rejected);
        spec.completion.fail(TaskError::Cancelled);
    }

    fn is_idle(&self) -> bool {
        self.engine.is_empty() && !self.io.borrow().has_interests() && self.timers.borrow().is_empty()
    }

    /// Zero when there is work left for the next cycle, otherwise up to the
    /// nearest timer or drain deadline. `None` blocks until readiness or a
    /// notification.
    fn next_timeout(&self, progressed: bool) -> Option<Duration> {
        if progressed
            || self.engine.has_ready()
            || !self.wakes.is_empty()
            || !self.shared.commands.is_empty()
        {
            return Some(Duration::ZERO);
        }
        let timer = self.timers.borrow().next_deadline();
        let deadline = match (timer, self.drain_deadline.get()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn wake_all(&self, targets: Vec<WakeTarget>) {
        for target in targets {
            let id = target.fire();
            self.engine.mark_ready(id);
        }
    }

    fn finish(&self) {
        self.state.set(AgentState::Stopped);
        self.shared.stop_accepting();

        for command in self.shared.commands.close() {
            if let Command::Spawn(spec) = command {
                self.reject(spec.into_local());
            }
        }

        let cancelled = self.engine.teardown(self);
        if cancelled > 0 {
            log::debug!("{} cancelled {cancelled} tasks at stop", self.id);
        }
        let waiting = self.io.borrow_mut().teardown();
        self.wake_all(waiting);
        self.wakes.close();
        context::uninstall(self.id);
    }

    /// Registers a task created on this thread. Fails with
    /// [`RuntimeError::ShuttingDown`] once Shutdown was requested.
    pub(crate) fn spawn(&self, spec: TaskSpec) -> Result<TaskId, RuntimeError> {
        if self.state.get() != AgentState::Running || !self.shared.is_accepting() {
            return Err(RuntimeError::ShuttingDown);
        }
        Ok(self.engine.register(spec))
    }

    /// Aborts a task from this thread. An id the engine does not know yet
    /// belongs to a Spawn still in the command queue; the abort is applied
    /// when that Spawn is handled.
    pub(crate) fn abort(&self, id: TaskId) -> bool {
        if self.engine.contains(id) {
            return self.engine.abort(id, self);
        }
        log::trace!("{} deferring abort of queued {id}", self.id);
        self.pending_aborts.borrow_mut().insert(id);
        true
    }

    pub(crate) fn current_task(&self) -> Option<TaskId> {
        self.engine.current_task()
    }

    pub(crate) fn add_source(&self, fd: RawFd) -> Result<SourceKey, RuntimeError> {
        self.io.borrow_mut().add_source(fd)
    }

    pub(crate) fn remove_source(&self, key: SourceKey) {
        let waiting = self.io.borrow_mut().remove_source(key);
        self.wake_all(waiting);
    }

    /// Consumes readiness for `interest`, or registers the polling task to be
    /// woken when it arrives.
    pub(crate) fn poll_io(
        &self,
        key: SourceKey,
        interest: Interest,
        waker: &Waker,
    ) -> Poll<Result<(), RuntimeError>> {
        let mut io = self.io.borrow_mut();
        match io.take_readiness(key, interest) {
            Ok(true) => return Poll::Ready(Ok(())),
            Ok(false) => {}
            Err(err) => return Poll::Ready(Err(err)),
        }
        let Some(target) = self.engine.wake_target(waker) else {
            return Poll::Ready(Err(RuntimeError::NoRuntime));
        };
        match io.register_interest(key, interest, target) {
            Ok(()) => Poll::Pending,
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    /// Schedules a wake for the polling task at `deadline`.
    pub(crate) fn schedule_timer(
        &self,
        deadline: Instant,
        waker: &Waker,
    ) -> Result<TimerId, RuntimeError> {
        let target = self
            .engine
            .wake_target(waker)
            .ok_or(RuntimeError::NoRuntime)?;
        Ok(self.timers.borrow_mut().schedule(deadline, target))
    }

    pub(crate) fn cancel_timer(&self, timer: TimerId) -> bool {
        self.timers.borrow_mut().cancel(timer)
    }

    pub(crate) fn timer_pending(&self, timer: TimerId) -> bool {
        self.timers.borrow().is_pending(timer)
    }
}

impl Interests for Agent {
    fn release(&self, task: TaskId) {
        let stranded = self.io.borrow_mut().cancel_task(task);
        self.timers.borrow_mut().cancel_task(task);
        self.wake_all(stranded);
    }
}
