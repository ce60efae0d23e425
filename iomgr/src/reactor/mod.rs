//! Reactors: one OS thread running one event loop.
//!
//! A reactor multiplexes three sources of work on its thread:
//! - messages queued to its inbox by any thread,
//! - readiness events of the devices it owns,
//! - its local timers and due global timers.
//!
//! Two backend variants exist. The event-driven backend blocks in
//! `epoll_wait` between iterations and is woken through an `eventfd`
//! whenever a message is queued; the polling backend never blocks and
//! spins over its devices, trading a core for latency.
//!
//! No reactor touches another reactor's private state: the only way in
//! is its inbox.

mod backend;
mod context;
mod core;
mod polling;

#[cfg(target_os = "linux")]
mod epoll;

pub use backend::{BackendWaker, ReactorBackend, ReadyEvent};
pub use polling::PollingBackend;

#[cfg(target_os = "linux")]
pub use epoll::EpollBackend;

pub(crate) use self::context::with_current;
pub(crate) use self::core::{Reactor, ReactorShared};

use crate::thread::IoThread;

use bitflags::bitflags;

bitflags! {
    /// Role of a reactor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReactorFlags: u8 {
        /// Serves device I/O and messages.
        const IO = 0b001;
        /// Spawned by the manager's worker pool.
        const WORKER = 0b010;
        /// Runs a non-blocking polling loop.
        const TIGHT_LOOP = 0b100;
    }
}

/// Public view of a reactor, handed to interface hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorInfo {
    pub thread: IoThread,
    pub flags: ReactorFlags,
}

impl ReactorInfo {
    pub fn is_io_reactor(&self) -> bool {
        self.flags.contains(ReactorFlags::IO)
    }

    pub fn is_worker(&self) -> bool {
        self.flags.contains(ReactorFlags::WORKER)
    }

    pub fn is_tight_loop_reactor(&self) -> bool {
        self.flags.contains(ReactorFlags::TIGHT_LOOP)
    }
}

/// Builds the backend for a new reactor.
#[cfg(target_os = "linux")]
pub(crate) fn make_backend(tight_loop: bool) -> std::io::Result<Box<dyn ReactorBackend>> {
    if tight_loop {
        Ok(Box::new(PollingBackend::new()))
    } else {
        Ok(Box::new(EpollBackend::new()?))
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn make_backend(_tight_loop: bool) -> std::io::Result<Box<dyn ReactorBackend>> {
    Ok(Box::new(PollingBackend::new()))
}
