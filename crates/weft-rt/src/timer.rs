use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use crate::task::TaskId;
use crate::waker::WakeTarget;

/// Handle of a pending timer entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TimerId(u64);

/// Deadline-ordered wake targets.
///
/// Entries are keyed by `(deadline, id)`. Ids grow monotonically, so equal
/// deadlines fire in insertion order.
#[derive(Debug, Default)]
pub(crate) struct TimerDriver {
    entries: BTreeMap<(Instant, TimerId), WakeTarget>,
    /// Reverse lookup: timer id → deadline and owner, for cancel by handle.
    deadlines: HashMap<TimerId, (Instant, TaskId)>,
    /// Pending timers per task.
    owned: HashMap<TaskId, HashSet<TimerId>>,
    next_id: u64,
}

impl TimerDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule(&mut self, deadline: Instant, target: impl Into<WakeTarget>) -> TimerId {
        let target = target.into();
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let task = target.task;
        log::trace!("timer {id:?} scheduled for {task}");
        self.entries.insert((deadline, id), target);
        self.deadlines.insert(id, (deadline, task));
        self.owned.entry(task).or_default().insert(id);
        id
    }

    /// Removes the entry if it is still pending. Returns whether it was.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some((deadline, task)) => {
                self.entries.remove(&(deadline, id));
                self.disown(task, id);
                true
            }
            None => false,
        }
    }

    /// Drops every entry that would wake `task`.
    pub(crate) fn cancel_task(&mut self, task: TaskId) -> usize {
        let Some(ids) = self.owned.remove(&task) else {
            return 0;
        };
        for id in &ids {
            if let Some((deadline, _)) = self.deadlines.remove(id) {
                self.entries.remove(&(deadline, *id));
            }
        }
        ids.len()
    }

    fn disown(&mut self, task: TaskId, id: TimerId) {
        if let Some(ids) = self.owned.get_mut(&task) {
            ids.remove(&id);
            if ids.is_empty() {
                self.owned.remove(&task);
            }
        }
    }

    pub(crate) fn is_pending(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    pub(crate) fn fire_due(&mut self) -> Vec<WakeTarget> {
        self.fire_due_at(Instant::now())
    }

    /// Removes and returns the targets of every entry due at `now`, earliest
    /// first.
    pub(crate) fn fire_due_at(&mut self, now: Instant) -> Vec<WakeTarget> {
        let mut fired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            let target = entry.remove();
            self.deadlines.remove(&id);
            self.disown(target.task, id);
            fired.push(target);
        }
        fired
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ids(n: usize) -> Vec<TaskId> {
        (0..n).map(|_| TaskId::next()).collect()
    }

    fn fire(timers: &mut TimerDriver, now: Instant) -> Vec<TaskId> {
        timers.fire_due_at(now).into_iter().map(WakeTarget::fire).collect()
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = TimerDriver::new();
        let tasks = ids(3);
        let base = Instant::now();

        timers.schedule(base + Duration::from_millis(30), tasks[0]);
        timers.schedule(base + Duration::from_millis(10), tasks[1]);
        timers.schedule(base + Duration::from_millis(20), tasks[2]);

        assert_eq!(timers.next_deadline(), Some(base + Duration::from_millis(10)));
        let fired = fire(&mut timers, base + Duration::from_millis(30));
        assert_eq!(fired, vec![tasks[1], tasks[2], tasks[0]]);
        assert!(timers.is_empty());
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut timers = TimerDriver::new();
        let tasks = ids(4);
        let deadline = Instant::now();

        for task in &tasks {
            timers.schedule(deadline, *task);
        }

        assert_eq!(fire(&mut timers, deadline), tasks);
    }

    #[test]
    fn only_due_entries_fire() {
        let mut timers = TimerDriver::new();
        let tasks = ids(2);
        let base = Instant::now();
        timers.schedule(base, tasks[0]);
        let later = timers.schedule(base + Duration::from_secs(60), tasks[1]);

        assert_eq!(fire(&mut timers, base), vec![tasks[0]]);
        assert!(timers.is_pending(later));
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_deadline(), Some(base + Duration::from_secs(60)));
    }

    #[test]
    fn cancel_is_a_noop_once_fired() {
        let mut timers = TimerDriver::new();
        let task = TaskId::next();
        let now = Instant::now();
        let id = timers.schedule(now, task);

        assert_eq!(fire(&mut timers, now), vec![task]);
        assert!(!timers.cancel(id));
    }

    #[test]
    fn cancel_removes_pending_entry() {
        let mut timers = TimerDriver::new();
        let task = TaskId::next();
        let now = Instant::now();
        let id = timers.schedule(now, task);

        assert!(timers.cancel(id));
        assert!(timers.fire_due_at(now).is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn cancel_task_drops_all_of_its_entries() {
        let mut timers = TimerDriver::new();
        let tasks = ids(2);
        let now = Instant::now();
        timers.schedule(now, tasks[0]);
        timers.schedule(now + Duration::from_millis(5), tasks[0]);
        let kept = timers.schedule(now, tasks[1]);

        assert_eq!(timers.cancel_task(tasks[0]), 2);
        assert_eq!(timers.cancel_task(tasks[0]), 0);
        assert!(timers.is_pending(kept));
        assert_eq!(fire(&mut timers, now + Duration::from_secs(1)), vec![tasks[1]]);
        assert!(timers.owned.is_empty());
    }

    #[test]
    fn fired_and_cancelled_timers_leave_no_ownership_behind() {
        let mut timers = TimerDriver::new();
        let task = TaskId::next();
        let now = Instant::now();
        let fired = timers.schedule(now, task);
        let cancelled = timers.schedule(now + Duration::from_secs(60), task);

        assert_eq!(fire(&mut timers, now), vec![task]);
        assert_eq!(timers.owned[&task], HashSet::from([cancelled]));
        assert!(!timers.is_pending(fired));

        assert!(timers.cancel(cancelled));
        assert!(timers.owned.is_empty());
        assert_eq!(timers.cancel_task(task), 0);
    }
}
