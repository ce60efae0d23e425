use crate::manager::IoManager;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked on a reactor's own thread when it starts (`true`)
/// or is about to stop (`false`).
pub type ThreadStateNotifier = Arc<dyn Fn(bool) + Send + Sync>;

/// Callback invoked by [`IoManager::start`] once the built-in interfaces
/// are registered, letting collaborators add their own.
pub type InterfaceAdder = Box<dyn FnOnce(&IoManager) + Send>;

/// Default number of reactor slots.
pub const DEFAULT_MAX_IO_THREADS: usize = 1024;

/// Default number of message module ids, the internal module included.
pub const DEFAULT_MAX_MSG_MODULES: usize = 64;

/// Static configuration of an [`IoManager`].
///
/// Built through [`IoManagerBuilder`]; immutable afterwards.
#[derive(Debug, Clone)]
pub struct IoManagerConfig {
    /// Upper bound on concurrently live reactors.
    pub max_io_threads: usize,

    /// Upper bound on registered message modules.
    pub max_msg_modules: usize,

    /// Maximum number of inbox messages a reactor handles per loop iteration.
    pub inbox_batch: usize,

    /// Longest time an event-driven reactor blocks in its poller.
    pub poll_interval: Duration,

    /// Prefix of the names given to spawned reactor threads.
    pub thread_name_prefix: String,
}

impl Default for IoManagerConfig {
    fn default() -> Self {
        Self {
            max_io_threads: DEFAULT_MAX_IO_THREADS,
            max_msg_modules: DEFAULT_MAX_MSG_MODULES,
            inbox_batch: 128,
            poll_interval: Duration::from_millis(100),
            thread_name_prefix: String::from("iomgr"),
        }
    }
}

/// Builder for configuring and creating an [`IoManager`].
///
/// # Examples
///
/// ```rust,ignore
/// let iomgr = IoManagerBuilder::new()
///     .max_io_threads(64)
///     .max_msg_modules(16)
///     .build();
/// ```
pub struct IoManagerBuilder {
    config: IoManagerConfig,
}

impl IoManagerBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: IoManagerConfig::default(),
        }
    }

    /// Sets the maximum number of live reactors.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn max_io_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "max_io_threads must be > 0");

        self.config.max_io_threads = n;
        self
    }

    /// Sets the number of message module ids.
    ///
    /// One id is always taken by the manager's internal module.
    ///
    /// # Panics
    ///
    /// Panics if `n < 2`.
    pub fn max_msg_modules(mut self, n: usize) -> Self {
        assert!(n > 1, "max_msg_modules must be > 1");

        self.config.max_msg_modules = n;
        self
    }

    /// Sets how many inbox messages a reactor drains per iteration.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn inbox_batch(mut self, n: usize) -> Self {
        assert!(n > 0, "inbox_batch must be > 0");

        self.config.inbox_batch = n;
        self
    }

    /// Sets the longest blocking wait of an event-driven reactor.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Sets the prefix used to name spawned reactor threads.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    /// Builds the manager. No reactor is started until [`IoManager::start`].
    pub fn build(self) -> Arc<IoManager> {
        IoManager::new(self.config)
    }
}

impl Default for IoManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Options of a single [`IoManager::start`] call.
pub struct StartOptions {
    pub(crate) num_threads: usize,
    pub(crate) use_polling_backend: bool,
    pub(crate) thread_notifier: Option<ThreadStateNotifier>,
    pub(crate) interface_adder: Option<InterfaceAdder>,
}

impl StartOptions {
    /// Starts `num_threads` event-driven worker reactors.
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads,
            use_polling_backend: false,
            thread_notifier: None,
            interface_adder: None,
        }
    }

    /// Runs the workers as tight-loop polling reactors and allocates
    /// I/O buffers from pinned memory.
    pub fn polling_backend(mut self, enabled: bool) -> Self {
        self.use_polling_backend = enabled;
        self
    }

    pub fn thread_notifier(mut self, notifier: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.thread_notifier = Some(Arc::new(notifier));
        self
    }

    pub fn interface_adder(mut self, adder: impl FnOnce(&IoManager) + Send + 'static) -> Self {
        self.interface_adder = Some(Box::new(adder));
        self
    }
}

impl fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartOptions")
            .field("num_threads", &self.num_threads)
            .field("use_polling_backend", &self.use_polling_backend)
            .field("thread_notifier", &self.thread_notifier.is_some())
            .field("interface_adder", &self.interface_adder.is_some())
            .finish()
    }
}
