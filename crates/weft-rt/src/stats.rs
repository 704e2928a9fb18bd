use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time counters of a runtime, readable from any thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Tasks registered with the engine, through either path.
    pub spawned: u64,
    pub completed: u64,
    /// Tasks whose work panicked.
    pub faulted: u64,
    /// Tasks aborted or torn down.
    pub cancelled: u64,
    /// Spawn commands refused because the agent was draining.
    pub rejected: u64,
    /// Successful command queue sends.
    pub commands_sent: u64,
    /// Commands consumed by the agent.
    pub commands_received: u64,
}

impl Stats {
    /// Registered tasks that have not finished yet.
    pub fn live_tasks(&self) -> u64 {
        self.spawned
            .saturating_sub(self.completed + self.faulted + self.cancelled)
    }
}

/// Shared counters behind [`Stats`]. Relaxed ordering throughout: the values
/// are monotonic and only read for reporting.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    faulted: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    commands_sent: AtomicU64,
    commands_received: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Counter {
    Spawned,
    Completed,
    Faulted,
    Cancelled,
    Rejected,
    CommandSent,
    CommandReceived,
}

impl Counters {
    pub(crate) fn bump(&self, counter: Counter) {
        let cell = match counter {
            Counter::Spawned => &self.spawned,
            Counter::Completed => &self.completed,
            Counter::Faulted => &self.faulted,
            Counter::Cancelled => &self.cancelled,
            Counter::Rejected => &self.rejected,
            Counter::CommandSent => &self.commands_sent,
            Counter::CommandReceived => &self.commands_received,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            spawned: self.spawned.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_tasks_excludes_every_finished_kind() {
        let counters = Counters::default();
        for _ in 0..5 {
            counters.bump(Counter::Spawned);
        }
        counters.bump(Counter::Completed);
        counters.bump(Counter::Faulted);
        counters.bump(Counter::Cancelled);
        counters.bump(Counter::Rejected);

        let stats = counters.snapshot();
        assert_eq!(stats.live_tasks(), 2);
        assert_eq!(stats.rejected, 1);
    }
}
