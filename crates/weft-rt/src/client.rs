use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::agent::AgentId;
use crate::command::{Command, CommandQueue};
use crate::context;
use crate::error::RuntimeError;
use crate::stats::{Counter, Counters, Stats};
use crate::task::{TaskHandle, TaskId, TaskSpec};

/// State shared by an agent and every client pointing at it.
pub(crate) struct Shared {
    pub(crate) agent: AgentId,
    pub(crate) commands: CommandQueue,
    /// Cleared once Shutdown has been requested.
    pub(crate) accepting: AtomicBool,
    pub(crate) counters: Arc<Counters>,
}

impl Shared {
    pub(crate) fn new(agent: AgentId, commands: CommandQueue, counters: Arc<Counters>) -> Self {
        Self {
            agent,
            commands,
            accepting: AtomicBool::new(true),
            counters,
        }
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }
}

/// Cloneable, thread-safe handle to a runtime's command queue.
///
/// Every operation goes through the queue, even when called on the agent's
/// own thread. Use the free [`spawn`](crate::spawn) for the same-thread fast
/// path.
#[derive(Clone)]
pub struct RuntimeClient {
    shared: Arc<Shared>,
}

impl RuntimeClient {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// The client installed in the process-wide slot, if any.
    pub fn current() -> Option<RuntimeClient> {
        context::installed()
    }

    /// Submits `future` to the agent.
    ///
    /// Fails with [`RuntimeError::ShuttingDown`] once Shutdown was requested
    /// and with [`RuntimeError::QueueExhausted`] if the queue is full. Neither
    /// is retried.
    pub fn spawn<F>(&self, future: F) -> Result<TaskHandle<F::Output>, RuntimeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.shared.is_accepting() {
            return Err(RuntimeError::ShuttingDown);
        }
        let (spec, slot) = TaskSpec::new(future);
        let id = spec.id;
        self.send(Command::Spawn(spec))?;
        Ok(TaskHandle::new(id, slot, self.clone()))
    }

    /// Asks the agent to stop accepting work and wind down once every live
    /// task has finished.
    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        self.shared.stop_accepting();
        self.send(Command::Shutdown)
    }

    pub(crate) fn abort(&self, id: TaskId) -> Result<(), RuntimeError> {
        self.send(Command::Abort(id))
    }

    fn send(&self, command: Command) -> Result<(), RuntimeError> {
        self.shared.commands.send(command).map_err(|(err, command)| {
            log::debug!("{command:?} not delivered to {}: {err}", self.shared.agent);
            err
        })?;
        self.shared.counters.bump(Counter::CommandSent);
        Ok(())
    }

    pub fn agent_id(&self) -> AgentId {
        self.shared.agent
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.is_accepting()
    }

    pub fn stats(&self) -> Stats {
        self.shared.counters.snapshot()
    }
}

impl fmt::Debug for RuntimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeClient")
            .field("agent", &self.shared.agent)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}
