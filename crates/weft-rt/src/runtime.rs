use std::fmt;
use std::future::Future;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::agent::{Agent, AgentId, AgentParts};
use crate::builder::Builder;
use crate::client::{RuntimeClient, Shared};
use crate::command::CommandQueue;
use crate::config::Config;
use crate::context;
use crate::error::RuntimeError;
use crate::io::IoDriver;
use crate::stats::{Counters, Stats};
use crate::task::TaskHandle;
use crate::waker::WakeQueue;

/// Owning handle of an agent thread.
///
/// Dropping the runtime (or calling [`Runtime::shutdown`]) sends Shutdown,
/// waits for live tasks to finish and joins the agent thread.
pub struct Runtime {
    client: RuntimeClient,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl Runtime {
    /// Starts a runtime with the default configuration.
    pub fn new() -> Result<Self, RuntimeError> {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn start(config: Config) -> Result<Self, RuntimeError> {
        // Created here so that poller failures surface to the caller.
        let io = IoDriver::new(config.event_batch)?;
        let notifier = io.notifier();
        let agent = AgentId::next();

        let commands = CommandQueue::new(config.command_capacity, notifier.clone());
        let shared = Arc::new(Shared::new(agent, commands, Arc::new(Counters::default())));
        let wakes = Arc::new(WakeQueue::new(agent, notifier));
        let client = RuntimeClient::new(Arc::clone(&shared));

        if config.install_global {
            context::install(client.clone())?;
        }

        let parts = AgentParts {
            shared,
            wakes,
            io,
            drain_timeout: config.drain_timeout,
        };
        let spawned = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || Rc::new(Agent::new(parts)).run());
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                context::uninstall(agent);
                return Err(RuntimeError::Io(err));
            }
        };

        log::debug!("{agent} started on thread {:?}", config.thread_name);
        Ok(Runtime {
            client,
            thread: Some(thread),
        })
    }

    /// A cloneable handle for submitting work from other threads.
    pub fn client(&self) -> RuntimeClient {
        self.client.clone()
    }

    pub fn agent_id(&self) -> AgentId {
        self.client.agent_id()
    }

    /// Submits `future` through the command queue.
    pub fn spawn<F>(&self, future: F) -> Result<TaskHandle<F::Output>, RuntimeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.client.spawn(future)
    }

    pub fn stats(&self) -> Stats {
        self.client.stats()
    }

    /// Sends Shutdown and blocks until the agent thread exits.
    ///
    /// Returns the agent's fatal error, if it had one.
    pub fn shutdown(mut self) -> Result<(), RuntimeError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), RuntimeError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let agent = self.client.agent_id();

        loop {
            match self.client.shutdown() {
                Ok(()) | Err(RuntimeError::ShuttingDown) => break,
                Err(RuntimeError::QueueExhausted { .. }) => thread::yield_now(),
                Err(err) => {
                    log::warn!("sending shutdown to {agent}: {err}");
                    break;
                }
            }
        }

        if context::is_agent_thread(agent) {
            // Joining from inside the agent would never return; it stops on
            // its own once drained.
            log::warn!("{agent} shut down from its own thread, not joining");
            return Ok(());
        }

        let joined = thread.join();
        context::uninstall(agent);
        match joined {
            Ok(result) => result.map_err(RuntimeError::Io),
            Err(_) => Err(RuntimeError::Io(io::Error::other("agent thread panicked"))),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("runtime shutdown failed: {err}");
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("agent", &self.client.agent_id())
            .field("running", &self.thread.is_some())
            .finish()
    }
}
