//! weft-rt: a single-threaded agent runtime.
//!
//! One dedicated thread (the *agent*) owns every task, an OS readiness
//! poller and a timer queue, and steps ready tasks cooperatively. Other
//! threads submit work through a bounded command queue.
//!
//! Code does not need to carry a handle around. Inside a task the agent is
//! found through a thread-local, so [`spawn`] registers the new task directly
//! without touching the command queue. Elsewhere [`spawn`] falls back to the
//! runtime installed in the process-wide slot.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//!
//! let rt = weft_rt::Runtime::new()?;
//! let handle = rt.spawn(async {
//!     weft_rt::sleep(Duration::from_millis(50)).await;
//!     let child = weft_rt::spawn(async { 21 * 2 }).unwrap();
//!     child.await
//! })?;
//! assert_eq!(handle.join(), Ok(Ok(42)));
//! rt.shutdown()?;
//! ```

mod agent;
mod builder;
mod client;
mod command;
mod config;
mod context;
mod engine;
mod error;
mod io;
mod runtime;
mod stats;
mod task;
mod time;
mod timer;
mod waker;

pub use agent::AgentId;
pub use builder::Builder;
pub use client::RuntimeClient;
pub use config::{Config, DEFAULT_COMMAND_CAPACITY, DEFAULT_EVENT_BATCH};
pub use error::{Outcome, RuntimeError, TaskError};
pub use io::AsyncFd;
pub use runtime::Runtime;
pub use stats::Stats;
pub use task::{TaskHandle, TaskId};
pub use time::{sleep, sleep_until, yield_now, Sleep};

use std::future::Future;

use task::TaskSpec;

/// Spawns `future` on the nearest runtime.
///
/// Inside a task the current agent registers it directly. On any other
/// thread it is sent to the runtime in the process-wide slot.
///
/// Fails with [`RuntimeError::NoRuntime`] when neither is reachable and with
/// [`RuntimeError::ShuttingDown`] once that runtime stopped accepting work.
pub fn spawn<F>(future: F) -> Result<TaskHandle<F::Output>, RuntimeError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    if let Some(agent) = context::current_agent() {
        let (spec, slot) = TaskSpec::new(future);
        let id = agent.spawn(spec.into_local())?;
        return Ok(TaskHandle::new(id, slot, agent.client()));
    }
    match context::installed() {
        Some(client) => client.spawn(future),
        None => Err(RuntimeError::NoRuntime),
    }
}

/// Spawns a `!Send` future on the current agent.
///
/// Only available inside a task; elsewhere fails with
/// [`RuntimeError::NoRuntime`].
pub fn spawn_local<F>(future: F) -> Result<TaskHandle<F::Output>, RuntimeError>
where
    F: Future + 'static,
    F::Output: Send + 'static,
{
    let agent = context::current_agent().ok_or(RuntimeError::NoRuntime)?;
    let (spec, slot) = TaskSpec::new_local(future);
    let id = agent.spawn(spec)?;
    Ok(TaskHandle::new(id, slot, agent.client()))
}
