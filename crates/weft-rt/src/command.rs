//! Cross-thread command channel into an agent.

use std::fmt;

use concurrent_queue::{ConcurrentQueue, PushError};

use crate::error::RuntimeError;
use crate::io::Notifier;
use crate::task::{SendWork, TaskId, TaskSpec};

pub(crate) enum Command {
    Spawn(TaskSpec<SendWork>),
    Abort(TaskId),
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Spawn(spec) => f.debug_tuple("Spawn").field(&spec.id).finish(),
            Command::Abort(id) => f.debug_tuple("Abort").field(id).finish(),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Bounded multi-producer queue consumed by one agent.
///
/// Sends never block. Commands from one producer are received in the order
/// they were sent.
pub(crate) struct CommandQueue {
    queue: ConcurrentQueue<Command>,
    notifier: Notifier,
}

impl CommandQueue {
    pub(crate) fn new(capacity: usize, notifier: Notifier) -> Self {
        Self {
            queue: ConcurrentQueue::bounded(capacity.max(1)),
            notifier,
        }
    }

    /// Enqueues `command` and wakes the agent. On failure the command is
    /// handed back alongside the error so the caller can settle it.
    pub(crate) fn send(&self, command: Command) -> Result<(), (RuntimeError, Command)> {
        match self.queue.push(command) {
            Ok(()) => {
                self.notifier.notify();
                Ok(())
            }
            Err(PushError::Full(command)) => Err((
                RuntimeError::QueueExhausted {
                    capacity: self.capacity(),
                },
                command,
            )),
            Err(PushError::Closed(command)) => Err((RuntimeError::ShuttingDown, command)),
        }
    }

    /// Pops at most the number of commands queued at the time of the call.
    pub(crate) fn drain_snapshot(&self) -> Vec<Command> {
        let pending = self.queue.len();
        let mut commands = Vec::with_capacity(pending);
        for _ in 0..pending {
            match self.queue.pop() {
                Ok(command) => commands.push(command),
                Err(_) => break,
            }
        }
        commands
    }

    /// Refuses further sends and returns whatever was still queued.
    pub(crate) fn close(&self) -> Vec<Command> {
        self.queue.close();
        let mut leftover = Vec::new();
        while let Ok(command) = self.queue.pop() {
            leftover.push(command);
        }
        leftover
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.queue.capacity().unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn queue(capacity: usize) -> CommandQueue {
        CommandQueue::new(capacity, Notifier::detached())
    }

    fn abort_ids(commands: Vec<Command>) -> Vec<TaskId> {
        commands
            .into_iter()
            .map(|command| match command {
                Command::Abort(id) => id,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn full_queue_reports_exhaustion_and_returns_the_command() {
        let queue = queue(1);
        queue.send(Command::Shutdown).unwrap();

        let (err, command) = queue.send(Command::Abort(TaskId::next())).unwrap_err();
        assert!(matches!(err, RuntimeError::QueueExhausted { capacity: 1 }));
        assert!(matches!(command, Command::Abort(_)));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        assert_eq!(queue(0).capacity(), 1);
    }

    #[test]
    fn closed_queue_refuses_and_hands_back_leftovers() {
        let queue = queue(8);
        let id = TaskId::next();
        queue.send(Command::Abort(id)).unwrap();

        assert_eq!(abort_ids(queue.close()), vec![id]);
        let (err, _) = queue.send(Command::Shutdown).unwrap_err();
        assert!(matches!(err, RuntimeError::ShuttingDown));
    }

    #[test]
    fn drain_snapshot_leaves_later_sends_for_next_cycle() {
        let queue = queue(8);
        let first = TaskId::next();
        queue.send(Command::Abort(first)).unwrap();

        let drained = queue.drain_snapshot();
        let second = TaskId::next();
        queue.send(Command::Abort(second)).unwrap();

        assert_eq!(abort_ids(drained), vec![first]);
        assert_eq!(abort_ids(queue.drain_snapshot()), vec![second]);
        assert!(queue.is_empty());
    }

    #[test]
    fn per_producer_order_is_preserved() {
        let queue = Arc::new(queue(1024));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let ids: Vec<TaskId> = (0..100).map(|_| TaskId::next()).collect();
                    for id in &ids {
                        queue.send(Command::Abort(*id)).unwrap();
                    }
                    ids
                })
            })
            .collect();
        let sent: Vec<Vec<TaskId>> = producers.into_iter().map(|p| p.join().unwrap()).collect();

        let received = abort_ids(queue.drain_snapshot());
        for ids in sent {
            let positions: Vec<usize> = ids
                .iter()
                .map(|id| received.iter().position(|r| r == id).unwrap())
                .collect();
            assert!(positions.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
