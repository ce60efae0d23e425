//! Linux `epoll`-based event-driven backend.
//!
//! Responsibilities:
//! - Register device descriptors with read/write interests
//! - Block waiting for I/O readiness
//! - Wake the reactor when a message is queued to its inbox
//! - Bound the wait by the next timer deadline

use super::backend::{BackendWaker, ReactorBackend, ReadyEvent};
use crate::interface::DeviceEvents;

use libc::{
    EFD_CLOEXEC, EFD_NONBLOCK, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Reserved token used internally for the wake-up event.
///
/// Device tokens come from a counter starting at zero and never reach
/// `u64::MAX`.
const WAKE_TOKEN: u64 = u64::MAX;

/// Wakes an [`EpollBackend`] by writing to its `eventfd`.
pub(crate) struct EventFdWaker(RawFd);

impl BackendWaker for EventFdWaker {
    fn wake(&self) {
        let buf: u64 = 1;
        unsafe {
            libc::write(self.0, &buf as *const u64 as *const _, 8);
        }
    }
}

impl Drop for EventFdWaker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Event-driven reactor backend.
///
/// Owns an `epoll` instance, an `eventfd` registered in it as a
/// persistent wake source, and a reusable event buffer.
pub struct EpollBackend {
    epoll: RawFd,
    events: Vec<epoll_event>,
    waker: Arc<EventFdWaker>,
}

unsafe impl Send for EpollBackend {}

impl EpollBackend {
    /// Creates the epoll instance and its wake-up `eventfd`.
    pub fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let eventfd = unsafe { libc::eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) };
        if eventfd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll) };
            return Err(err);
        }

        let waker = Arc::new(EventFdWaker(eventfd));

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        let rc = unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, eventfd, &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll) };
            return Err(err);
        }

        Ok(Self {
            epoll,
            events: Vec::with_capacity(64),
            waker,
        })
    }

    fn ctl(&self, op: i32, fd: RawFd, token: usize, interest: DeviceEvents) -> io::Result<()> {
        let mut flags = 0;

        if interest.contains(DeviceEvents::READ) {
            flags |= EPOLLIN;
        }
        if interest.contains(DeviceEvents::WRITE) {
            flags |= EPOLLOUT;
        }

        let mut event = epoll_event {
            events: flags as u32,
            u64: token as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl ReactorBackend for EpollBackend {
    fn is_tight_loop(&self) -> bool {
        false
    }

    fn waker(&self) -> Arc<dyn BackendWaker> {
        self.waker.clone()
    }

    fn register(&mut self, fd: RawFd, token: usize, events: DeviceEvents) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, token, events)
    }

    fn reregister(&mut self, fd: RawFd, token: usize, events: DeviceEvents) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, token, events)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn poll(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> io::Result<()> {
        // Round up so a sub-millisecond deadline does not turn into a busy spin.
        let timeout_ms = timeout
            .map(|t| t.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        for ev in &self.events {
            if ev.u64 == WAKE_TOKEN {
                let mut buf = 0u64;
                unsafe {
                    libc::read(self.waker.0, &mut buf as *mut u64 as *mut _, 8);
                }
                continue;
            }

            let mut ready = DeviceEvents::empty();
            if ev.events & ((EPOLLIN | EPOLLHUP) as u32) != 0 {
                ready |= DeviceEvents::READ;
            }
            if ev.events & (EPOLLOUT as u32) != 0 {
                ready |= DeviceEvents::WRITE;
            }
            if ev.events & (EPOLLERR as u32) != 0 {
                ready |= DeviceEvents::ERROR;
            }

            events.push(ReadyEvent {
                token: ev.u64 as usize,
                events: ready,
            });
        }

        unsafe {
            self.events.set_len(0);
        }

        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll);
        }
    }
}
