//! Error types.
//!
//! Two families: [`RuntimeError`] is returned synchronously by the operation
//! that failed (discovery, driver registration, command submission), while
//! [`TaskError`] only ever reaches a task's completion slot and is observed
//! through its [`TaskHandle`](crate::TaskHandle).

use std::io;

use thiserror::Error;

/// Failure of a runtime-level operation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Neither the calling thread's agent nor a process-wide runtime is
    /// reachable.
    #[error("no runtime is reachable from this thread")]
    NoRuntime,

    /// The OS poller refused the resource, or the source is unknown to this
    /// agent.
    #[error("resource cannot be polled for readiness: {0}")]
    InvalidResource(#[source] io::Error),

    /// The command queue is full. This signals systemic overload and is not
    /// retried by the runtime.
    #[error("command queue exhausted ({capacity} commands pending)")]
    QueueExhausted { capacity: usize },

    /// The runtime received Shutdown (or has stopped) and no longer accepts
    /// new work.
    #[error("runtime is shutting down")]
    ShuttingDown,

    /// Another runtime already occupies the process-wide discovery slot.
    #[error("a runtime is already installed for this process")]
    AlreadyInstalled,

    /// Agent thread creation failed, the poller failed fatally, or the agent
    /// thread panicked.
    #[error("runtime I/O failure: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    pub(crate) fn unknown_source() -> Self {
        RuntimeError::InvalidResource(io::Error::new(
            io::ErrorKind::NotFound,
            "source is not registered with this agent",
        ))
    }
}

impl From<RuntimeError> for io::Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Io(inner) | RuntimeError::InvalidResource(inner) => inner,
            other => io::Error::other(other),
        }
    }
}

/// Failure outcome of a single task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task's work panicked. Carries the panic message when it was a
    /// string.
    #[error("task faulted: {0}")]
    Fault(String),

    /// The task was aborted, rejected while the runtime was draining, or torn
    /// down at shutdown.
    #[error("task was cancelled")]
    Cancelled,
}

/// What a [`TaskHandle`](crate::TaskHandle) eventually yields.
pub type Outcome<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    const EPERM: i32 = 1;

    #[test]
    fn invalid_resource_converts_back_to_inner_io_error() {
        let err = RuntimeError::InvalidResource(io::Error::from_raw_os_error(EPERM));
        let io_err: io::Error = err.into();
        assert_eq!(io_err.raw_os_error(), Some(EPERM));
    }

    #[test]
    fn other_variants_become_opaque_io_errors() {
        let io_err: io::Error = RuntimeError::NoRuntime.into();
        assert_eq!(io_err.kind(), io::ErrorKind::Other);
        assert!(io_err.to_string().contains("no runtime"));
    }

    #[test]
    fn fault_message_is_displayed() {
        let err = TaskError::Fault("boom".into());
        assert_eq!(err.to_string(), "task faulted: boom");
    }
}
