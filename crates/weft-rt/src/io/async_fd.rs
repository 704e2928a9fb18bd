use std::fmt;
use std::future::poll_fn;
use std::io;
use std::os::fd::RawFd;
use std::task::{Context, Poll};

use super::{Interest, SourceKey};
use crate::agent::AgentId;
use crate::context;
use crate::error::RuntimeError;

/// A file descriptor registered with the current agent's I/O driver.
///
/// `AsyncFd` does NOT own the file descriptor, it only manages the poller
/// registration. The caller closes the fd (e.g. via `OwnedFd`) after
/// dropping the `AsyncFd`.
///
/// The registration belongs to the agent that created it. Polling from any
/// other thread fails with [`RuntimeError::InvalidResource`].
pub struct AsyncFd {
    fd: RawFd,
    key: SourceKey,
    agent: AgentId,
}

impl AsyncFd {
    /// Registers `fd` with the agent running the calling task.
    ///
    /// Fails with [`RuntimeError::NoRuntime`] off an agent thread and with
    /// [`RuntimeError::InvalidResource`] if the poller rejects the fd.
    pub fn new(fd: RawFd) -> Result<Self, RuntimeError> {
        let agent = context::current_agent().ok_or(RuntimeError::NoRuntime)?;
        let key = agent.add_source(fd)?;
        Ok(AsyncFd {
            fd,
            key,
            agent: agent.id(),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<Result<(), RuntimeError>> {
        self.poll_ready(Interest::Readable, cx)
    }

    pub fn poll_writable(&self, cx: &mut Context<'_>) -> Poll<Result<(), RuntimeError>> {
        self.poll_ready(Interest::Writable, cx)
    }

    /// Wait until the fd is readable.
    ///
    /// After this returns `Ok(())`, attempt the read. If it returns
    /// `WouldBlock`, call `readable()` again.
    pub async fn readable(&self) -> io::Result<()> {
        poll_fn(|cx| self.poll_readable(cx)).await?;
        Ok(())
    }

    /// Wait until the fd is writable.
    ///
    /// After this returns `Ok(())`, attempt the write. If it returns
    /// `WouldBlock`, call `writable()` again.
    pub async fn writable(&self) -> io::Result<()> {
        poll_fn(|cx| self.poll_writable(cx)).await?;
        Ok(())
    }

    fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<Result<(), RuntimeError>> {
        match context::current_agent() {
            Some(agent) if agent.id() == self.agent => agent.poll_io(self.key, interest, cx.waker()),
            _ => Poll::Ready(Err(RuntimeError::unknown_source())),
        }
    }
}

impl Drop for AsyncFd {
    fn drop(&mut self) {
        match context::current_agent() {
            Some(agent) if agent.id() == self.agent => agent.remove_source(self.key),
            // The kernel drops a closed fd from the poller on its own; the
            // slab entry goes at agent teardown.
            _ => log::debug!("fd {} released off its agent thread", self.fd),
        }
    }
}

impl fmt::Debug for AsyncFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFd")
            .field("fd", &self.fd)
            .field("agent", &self.agent)
            .finish()
    }
}
