//! Fluent construction of a [`Runtime`].

use std::num::NonZeroUsize;
use std::time::Duration;

use crate::config::Config;
use crate::error::RuntimeError;
use crate::runtime::Runtime;

/// Builder for [`Runtime`].
///
/// ```ignore
/// let rt = weft_rt::Builder::new()
///     .thread_name("io-agent")
///     .install_global(false)
///     .build()?;
/// ```
#[derive(Clone, Debug, Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing configuration, e.g. [`Config::from_env`].
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Bound on pending cross-thread commands. Zero is raised to one.
    pub fn command_capacity(mut self, capacity: usize) -> Self {
        self.config.command_capacity = capacity.max(1);
        self
    }

    pub fn event_batch(mut self, batch: NonZeroUsize) -> Self {
        self.config.event_batch = batch;
        self
    }

    /// Whether the runtime claims the process-wide discovery slot, making it
    /// reachable from the free [`spawn`](crate::spawn) on any thread.
    pub fn install_global(mut self, install: bool) -> Self {
        self.config.install_global = install;
        self
    }

    /// Tear down tasks still alive this long after Shutdown was received.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = Some(timeout);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawns the agent thread and returns the owning handle.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        Runtime::start(self.config)
    }
}
