//! Timer futures backed by the current agent's timer driver.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::agent::AgentId;
use crate::context;
use crate::task::TaskId;
use crate::timer::TimerId;

/// Completes once `duration` has elapsed.
pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

/// Completes once `deadline` has passed.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        entry: None,
    }
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    timer: TimerId,
    task: TaskId,
    agent: AgentId,
}

/// Future returned by [`sleep`] and [`sleep_until`].
///
/// The timer entry is created on first poll and removed when the `Sleep` is
/// dropped before firing.
///
/// # Panics
///
/// Polling outside a task running on a weft agent panics.
#[derive(Debug)]
pub struct Sleep {
    deadline: Instant,
    entry: Option<Entry>,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn cancel(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        if let Some(agent) = context::current_agent() {
            if agent.id() == entry.agent {
                agent.cancel_timer(entry.timer);
            }
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_elapsed() {
            self.cancel();
            return Poll::Ready(());
        }

        let Some(agent) = context::current_agent() else {
            panic!("Sleep polled outside of a weft agent");
        };
        let Some(task) = agent.current_task() else {
            panic!("Sleep polled outside of a weft task");
        };

        // Still armed for the same task on the same agent: nothing to do.
        if let Some(entry) = self.entry {
            if entry.agent == agent.id() && entry.task == task && agent.timer_pending(entry.timer) {
                return Poll::Pending;
            }
        }

        self.cancel();
        match agent.schedule_timer(self.deadline, cx.waker()) {
            Ok(timer) => {
                self.entry = Some(Entry {
                    timer,
                    task,
                    agent: agent.id(),
                });
                Poll::Pending
            }
            Err(err) => panic!("Sleep could not schedule its timer: {err}"),
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Yields once, letting every other ready task take a step first.
pub async fn yield_now() {
    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                return Poll::Ready(());
            }
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    YieldOnce(false).await
}
