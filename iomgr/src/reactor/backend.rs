use crate::interface::DeviceEvents;

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Readiness reported by a backend for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    /// Token given at registration.
    pub token: usize,
    pub events: DeviceEvents,
}

/// Wakes a reactor blocked in its backend from another thread.
pub trait BackendWaker: Send + Sync {
    fn wake(&self);
}

/// The event-loop variant a reactor runs on.
///
/// A backend is owned by exactly one reactor thread. Only the waker it
/// hands out is shared with other threads.
pub trait ReactorBackend: Send {
    /// `true` when [`poll`](Self::poll) never blocks.
    fn is_tight_loop(&self) -> bool;

    fn waker(&self) -> Arc<dyn BackendWaker>;

    /// Starts watching `fd` for `events`, reporting them under `token`.
    fn register(&mut self, fd: RawFd, token: usize, events: DeviceEvents) -> io::Result<()>;

    /// Replaces the event interest of an already registered descriptor.
    fn reregister(&mut self, fd: RawFd, token: usize, events: DeviceEvents) -> io::Result<()>;

    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Collects ready descriptors into `events`.
    ///
    /// Event-driven backends block for at most `timeout` (forever if
    /// `None`) or until woken; tight-loop backends return immediately.
    fn poll(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> io::Result<()>;
}
