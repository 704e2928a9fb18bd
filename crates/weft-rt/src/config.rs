use std::num::NonZeroUsize;
use std::time::Duration;

/// Default bound on queued cross-thread commands.
pub const DEFAULT_COMMAND_CAPACITY: usize = 4096;

/// Default maximum number of readiness events taken from the OS per poll.
pub const DEFAULT_EVENT_BATCH: usize = 1024;

/// Runtime configuration. Usually assembled through [`Builder`](crate::Builder).
#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the agent thread.
    pub thread_name: String,
    /// Capacity of the command queue. A full queue fails submissions with
    /// `QueueExhausted`.
    pub command_capacity: usize,
    /// Readiness events dequeued from the OS poller in one call.
    pub event_batch: NonZeroUsize,
    /// Whether the runtime claims the process-wide discovery slot.
    pub install_global: bool,
    /// How long a draining agent waits for live tasks before tearing them
    /// down with `Cancelled`. `None` waits indefinitely.
    pub drain_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thread_name: "weft-agent".to_string(),
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            event_batch: NonZeroUsize::new(DEFAULT_EVENT_BATCH).unwrap_or(NonZeroUsize::MIN),
            install_global: true,
            drain_timeout: None,
        }
    }
}

impl Config {
    /// Default configuration with `WEFT_COMMAND_CAPACITY` and
    /// `WEFT_EVENT_BATCH` applied when they hold positive integers.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(capacity) = env_usize("WEFT_COMMAND_CAPACITY") {
            config.command_capacity = capacity.get();
        }
        if let Some(batch) = env_usize("WEFT_EVENT_BATCH") {
            config.event_batch = batch;
        }
        config
    }
}

fn env_usize(key: &str) -> Option<NonZeroUsize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<NonZeroUsize>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {key}={raw:?}: expected a positive integer");
            None
        }
    }
}
