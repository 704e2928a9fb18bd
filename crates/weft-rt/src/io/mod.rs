//! Readiness-based I/O: the agent's [`IoDriver`](driver::IoDriver) and the
//! task-facing [`AsyncFd`].

mod async_fd;
mod driver;

pub use async_fd::AsyncFd;
pub(crate) use driver::{IoDriver, Notifier};

/// Direction of readiness a task waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

/// Agent-local handle of a registered fd.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceKey(pub(crate) usize);
