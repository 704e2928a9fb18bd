use std::collections::{HashMap, HashSet};
use std::io;
use std::mem;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Duration;

use polling::{Event, Events, Poller};
use slab::Slab;

use super::{Interest, SourceKey};
use crate::error::RuntimeError;
use crate::task::TaskId;
use crate::waker::WakeTarget;

/// An fd registered with the poller.
struct Source {
    fd: RawFd,
    readers: Vec<WakeTarget>,
    writers: Vec<WakeTarget>,
    /// Set when the OS reports readable; consumed by the next readiness check.
    read_ready: bool,
    write_ready: bool,
}

impl Source {
    fn waiters_mut(&mut self, interest: Interest) -> &mut Vec<WakeTarget> {
        match interest {
            Interest::Readable => &mut self.readers,
            Interest::Writable => &mut self.writers,
        }
    }

    fn ready_mut(&mut self, interest: Interest) -> &mut bool {
        match interest {
            Interest::Readable => &mut self.read_ready,
            Interest::Writable => &mut self.write_ready,
        }
    }

    fn is_waiting(&self) -> bool {
        !self.readers.is_empty() || !self.writers.is_empty()
    }

    fn has_task(&self, task: TaskId) -> bool {
        self.readers.iter().chain(&self.writers).any(|w| w.task == task)
    }

    fn event(&self, key: usize) -> Event {
        Event::new(key, !self.readers.is_empty(), !self.writers.is_empty())
    }

    fn into_waiters(self) -> impl Iterator<Item = WakeTarget> {
        self.readers.into_iter().chain(self.writers)
    }
}

/// Readiness driver: owns the OS poller and the registered sources.
///
/// Interests are one-shot. When an event fires, the waiters for that
/// direction are handed back to the caller and the source is re-armed only
/// for the directions that still have waiters.
pub(crate) struct IoDriver {
    poller: Arc<Poller>,
    sources: Slab<Source>,
    /// Source keys each task is waiting on, so a task's interests can be
    /// released without scanning every source.
    owned: HashMap<TaskId, HashSet<usize>>,
    events: Events,
}

impl IoDriver {
    pub(crate) fn new(event_batch: NonZeroUsize) -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            sources: Slab::new(),
            owned: HashMap::new(),
            events: Events::with_capacity(event_batch),
        })
    }

    pub(crate) fn notifier(&self) -> Notifier {
        Notifier {
            poller: Arc::downgrade(&self.poller),
        }
    }

    /// Adds `fd` to the poller with no interest armed yet.
    pub(crate) fn add_source(&mut self, fd: RawFd) -> Result<SourceKey, RuntimeError> {
        let entry = self.sources.vacant_entry();
        let key = entry.key();
        // SAFETY: the fd is deleted from the poller in `remove_source` or
        // `teardown`; `AsyncFd` owners drop their registration before closing.
        unsafe { self.poller.add(fd, Event::none(key)) }.map_err(RuntimeError::InvalidResource)?;
        entry.insert(Source {
            fd,
            readers: Vec::new(),
            writers: Vec::new(),
            read_ready: false,
            write_ready: false,
        });
        log::trace!("io source {key} added for fd {fd}");
        Ok(SourceKey(key))
    }

    /// Removes the source. Tasks still waiting on it are returned so the
    /// caller can wake them; their next readiness check fails.
    pub(crate) fn remove_source(&mut self, key: SourceKey) -> Vec<WakeTarget> {
        if !self.sources.contains(key.0) {
            return Vec::new();
        }
        let source = self.sources.remove(key.0);
        self.delete_fd(source.fd);
        let waiters: Vec<WakeTarget> = source.into_waiters().collect();
        self.disown(key.0, &waiters);
        waiters
    }

    /// Consumes a readiness flag previously set by [`IoDriver::poll`].
    pub(crate) fn take_readiness(
        &mut self,
        key: SourceKey,
        interest: Interest,
    ) -> Result<bool, RuntimeError> {
        let source = self
            .sources
            .get_mut(key.0)
            .ok_or_else(RuntimeError::unknown_source)?;
        Ok(mem::take(source.ready_mut(interest)))
    }

    /// Arms `interest` on the source and records who to wake when it fires.
    pub(crate) fn register_interest(
        &mut self,
        key: SourceKey,
        interest: Interest,
        target: WakeTarget,
    ) -> Result<(), RuntimeError> {
        let source = self
            .sources
            .get_mut(key.0)
            .ok_or_else(RuntimeError::unknown_source)?;

        let waiters = source.waiters_mut(interest);
        if let Some(existing) = waiters.iter_mut().find(|w| w.same_as(&target)) {
            *existing = target;
            return Ok(());
        }

        let task = target.task;
        waiters.push(target);
        if let Err(err) = self.rearm(key.0) {
            if let Some(source) = self.sources.get_mut(key.0) {
                source.waiters_mut(interest).retain(|w| w.task != task);
            }
            return Err(RuntimeError::InvalidResource(err));
        }
        self.owned.entry(task).or_default().insert(key.0);
        Ok(())
    }

    /// Forgets every interest registered on behalf of `task`. Returns the
    /// waiters of other tasks stranded on a source that could not be
    /// re-armed; the caller wakes them so they observe the failure.
    pub(crate) fn cancel_task(&mut self, task: TaskId) -> Vec<WakeTarget> {
        let Some(keys) = self.owned.remove(&task) else {
            return Vec::new();
        };
        let mut stranded = Vec::new();
        for key in keys {
            let Some(source) = self.sources.get_mut(key) else {
                continue;
            };
            source.readers.retain(|w| w.task != task);
            source.writers.retain(|w| w.task != task);
            if let Err(err) = self.rearm(key) {
                log::debug!("re-arming io source {key} after cancelling {task}: {err}");
                stranded.extend(self.strand(key));
            }
        }
        stranded
    }

    pub(crate) fn has_interests(&self) -> bool {
        self.sources.iter().any(|(_, source)| source.is_waiting())
    }

    /// Blocks up to `timeout` for readiness and returns the targets whose
    /// interests fired. An interrupted wait counts as a spurious wakeup.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<WakeTarget>> {
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                log::trace!("io poll interrupted");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        }

        let ready: Vec<(usize, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.key, event.readable, event.writable))
            .collect();

        let mut fired = Vec::new();
        for (key, readable, writable) in ready {
            let Some(source) = self.sources.get_mut(key) else {
                continue;
            };
            let mut woken = Vec::new();
            if readable {
                source.read_ready = true;
                woken.append(&mut source.readers);
            }
            if writable {
                source.write_ready = true;
                woken.append(&mut source.writers);
            }
            let waiting = source.is_waiting();
            self.disown(key, &woken);
            fired.append(&mut woken);

            if waiting {
                if let Err(err) = self.rearm(key) {
                    log::warn!("re-arming io source {key}: {err}");
                    fired.extend(self.strand(key));
                }
            }
        }
        Ok(fired)
    }

    /// Removes every source and returns every target still waiting.
    pub(crate) fn teardown(&mut self) -> Vec<WakeTarget> {
        let sources: Vec<Source> = self.sources.drain().collect();
        self.owned.clear();
        let mut waiting = Vec::new();
        for source in sources {
            self.delete_fd(source.fd);
            waiting.extend(source.into_waiters());
        }
        waiting
    }

    /// Takes every waiter off a source the poller will no longer report.
    fn strand(&mut self, key: usize) -> Vec<WakeTarget> {
        let Some(source) = self.sources.get_mut(key) else {
            return Vec::new();
        };
        let mut waiters = mem::take(&mut source.readers);
        waiters.append(&mut source.writers);
        self.disown(key, &waiters);
        waiters
    }

    /// Drops `key` from the owned set of every target no longer waiting on it.
    fn disown(&mut self, key: usize, targets: &[WakeTarget]) {
        for target in targets {
            if self
                .sources
                .get(key)
                .is_some_and(|source| source.has_task(target.task))
            {
                continue;
            }
            if let Some(keys) = self.owned.get_mut(&target.task) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.owned.remove(&target.task);
                }
            }
        }
    }

    fn rearm(&self, key: usize) -> io::Result<()> {
        let source = &self.sources[key];
        // SAFETY: registered fds stay open until their source is removed.
        let borrowed = unsafe { BorrowedFd::borrow_raw(source.fd) };
        self.poller.modify(&borrowed, source.event(key))
    }

    fn delete_fd(&self, fd: RawFd) {
        // SAFETY: see `rearm`. The owner may already have closed the fd, in
        // which case the kernel dropped it from the poller and delete fails.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(err) = self.poller.delete(&borrowed) {
            log::debug!("deleting fd {fd} from poller: {err}");
        }
    }
}

/// Cross-thread handle that interrupts a blocking [`IoDriver::poll`].
///
/// Holds the poller weakly: notifying after the driver is gone is a no-op.
#[derive(Clone)]
pub(crate) struct Notifier {
    poller: Weak<Poller>,
}

impl Notifier {
    pub(crate) fn notify(&self) {
        let Some(poller) = self.poller.upgrade() else {
            return;
        };
        if let Err(err) = poller.notify() {
            log::warn!("failed to notify agent poller: {err}");
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self { poller: Weak::new() }
    }
}
