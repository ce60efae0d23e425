//! Lifecycle state machine of the I/O manager.
//!
//! ```text
//! stopped -> interface_init -> reactor_init -> sys_init -> running
//! running -> stopping -> stopped
//! ```
//!
//! The state itself is a lock-free atomic. The mutex/condvar pair only
//! exists so that waiters can block on a transition without missing a
//! notification.

use parking_lot::{Condvar, Mutex};

use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

/// Lifecycle phase of an [`IoManager`](crate::IoManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum IomgrState {
    Stopped = 0,
    InterfaceInit = 1,
    ReactorInit = 2,
    SysInit = 3,
    Running = 4,
    Stopping = 5,
}

impl IomgrState {
    fn from_u16(raw: u16) -> Self {
        match raw {
            0 => IomgrState::Stopped,
            1 => IomgrState::InterfaceInit,
            2 => IomgrState::ReactorInit,
            3 => IomgrState::SysInit,
            4 => IomgrState::Running,
            5 => IomgrState::Stopping,
            _ => unreachable!("corrupted iomgr state {raw}"),
        }
    }

    /// Returns `true` if `self -> next` is an edge of the state diagram.
    pub fn can_transition_to(self, next: IomgrState) -> bool {
        use IomgrState::*;

        matches!(
            (self, next),
            (Stopped, InterfaceInit)
                | (InterfaceInit, ReactorInit)
                | (ReactorInit, SysInit)
                | (SysInit, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                // aborted startup
                | (InterfaceInit, Stopping)
                | (ReactorInit, Stopping)
                | (SysInit, Stopping)
        )
    }
}

impl fmt::Display for IomgrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IomgrState::Stopped => "stopped",
            IomgrState::InterfaceInit => "interface_init",
            IomgrState::ReactorInit => "reactor_init",
            IomgrState::SysInit => "sys_init",
            IomgrState::Running => "running",
            IomgrState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

pub(crate) struct StateMachine {
    state: AtomicU16,
    lock: Mutex<()>,
    cv: Condvar,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU16::new(IomgrState::Stopped as u16),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> IomgrState {
        IomgrState::from_u16(self.state.load(Ordering::Acquire))
    }

    /// Moves `from -> to` if the machine is currently in `from`.
    ///
    /// Returns `false` when another thread changed the state first.
    ///
    /// # Panics
    ///
    /// Panics if `from -> to` is not an edge of the state diagram.
    pub(crate) fn transition(&self, from: IomgrState, to: IomgrState) -> bool {
        assert!(
            from.can_transition_to(to),
            "illegal iomgr state transition {from} -> {to}"
        );

        let _guard = self.lock.lock();
        let swapped = self
            .state
            .compare_exchange(from as u16, to as u16, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if swapped {
            tracing::debug!(%from, %to, "iomgr state transition");
            self.cv.notify_all();
        }

        swapped
    }

    /// Blocks until `pred` holds for the current state.
    pub(crate) fn wait_until(&self, pred: impl Fn(IomgrState) -> bool) {
        let mut guard = self.lock.lock();
        while !pred(self.get()) {
            self.cv.wait(&mut guard);
        }
    }
}

/// A countdown latch where only the thread that reaches zero is told so.
///
/// The counter is a plain atomic; the mutex/condvar pair is only touched
/// by the thread hitting zero and by [`wait`](Self::wait)ers.
pub(crate) struct Countdown {
    remaining: AtomicUsize,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Countdown {
    pub(crate) fn new() -> Self {
        Self {
            remaining: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn arm(&self, n: usize) {
        self.remaining.store(n, Ordering::Release);
    }

    /// Decrements the counter; returns `true` for the caller that hit zero.
    ///
    /// # Panics
    ///
    /// Panics on underflow.
    pub(crate) fn count_down(&self) -> bool {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "countdown underflow");

        if prev == 1 {
            let _guard = self.lock.lock();
            self.cv.notify_all();
            return true;
        }
        false
    }

    pub(crate) fn get(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Blocks until the counter reaches zero.
    pub(crate) fn wait(&self) {
        let mut guard = self.lock.lock();
        while self.get() > 0 {
            self.cv.wait(&mut guard);
        }
    }
}
