//! Discovery state.
//!
//! Two slots let code find a runtime without threading a handle through:
//!
//! - a thread-local agent slot, set only while an agent's own thread is
//!   inside its run loop. Code running in a task reaches the agent directly.
//! - a process-wide client slot holding the runtime that claimed it at
//!   construction. Any thread can submit work through it.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::agent::{Agent, AgentId};
use crate::client::RuntimeClient;
use crate::error::RuntimeError;

thread_local! {
    static CURRENT_AGENT: RefCell<Option<Rc<Agent>>> = const { RefCell::new(None) };
}

static CURRENT_RUNTIME: Mutex<Option<RuntimeClient>> = Mutex::new(None);

/// Restores the previous thread-local agent when dropped.
pub(crate) struct AgentGuard {
    previous: Option<Rc<Agent>>,
}

/// Makes `agent` the current agent of this thread until the guard drops.
pub(crate) fn enter(agent: Rc<Agent>) -> AgentGuard {
    let previous = CURRENT_AGENT.with(|slot| slot.replace(Some(agent)));
    AgentGuard { previous }
}

impl Drop for AgentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // The replaced agent is dropped after the slot is released.
        let _outgoing = CURRENT_AGENT.try_with(|slot| slot.replace(previous));
    }
}

pub(crate) fn current_agent() -> Option<Rc<Agent>> {
    CURRENT_AGENT
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

pub(crate) fn is_agent_thread(agent: AgentId) -> bool {
    CURRENT_AGENT
        .try_with(|slot| slot.borrow().as_ref().is_some_and(|current| current.id() == agent))
        .unwrap_or(false)
}

fn runtime_slot() -> MutexGuard<'static, Option<RuntimeClient>> {
    CURRENT_RUNTIME
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Claims the process-wide slot for `client`.
pub(crate) fn install(client: RuntimeClient) -> Result<(), RuntimeError> {
    let mut slot = runtime_slot();
    if slot.is_some() {
        return Err(RuntimeError::AlreadyInstalled);
    }
    log::debug!("{} installed as the process runtime", client.agent_id());
    *slot = Some(client);
    Ok(())
}

/// Clears the process-wide slot if it still belongs to `agent`.
pub(crate) fn uninstall(agent: AgentId) {
    let removed = {
        let mut slot = runtime_slot();
        match slot.as_ref() {
            Some(client) if client.agent_id() == agent => slot.take(),
            _ => None,
        }
    };
    if removed.is_some() {
        log::debug!("{agent} removed from the process runtime slot");
    }
}

pub(crate) fn installed() -> Option<RuntimeClient> {
    runtime_slot().clone()
}
