//! Tight-loop polling backend.
//!
//! Never blocks: every call to [`poll`](ReactorBackend::poll) checks the
//! registered descriptors with a zero timeout and returns. A reactor on
//! this backend spins between its inbox, its timers and its devices.

use super::backend::{BackendWaker, ReactorBackend, ReadyEvent};
use crate::interface::DeviceEvents;

use libc::{POLLERR, POLLHUP, POLLIN, POLLOUT, pollfd};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// A spinning reactor notices new work on its next iteration.
struct NoopWaker;

impl BackendWaker for NoopWaker {
    fn wake(&self) {}
}

pub struct PollingBackend {
    fds: Vec<pollfd>,
    tokens: Vec<usize>,
    waker: Arc<NoopWaker>,
}

impl PollingBackend {
    pub fn new() -> Self {
        Self {
            fds: Vec::new(),
            tokens: Vec::new(),
            waker: Arc::new(NoopWaker),
        }
    }

    fn position(&self, fd: RawFd) -> Option<usize> {
        self.fds.iter().position(|p| p.fd == fd)
    }

    fn interest(events: DeviceEvents) -> i16 {
        let mut flags = 0;
        if events.contains(DeviceEvents::READ) {
            flags |= POLLIN;
        }
        if events.contains(DeviceEvents::WRITE) {
            flags |= POLLOUT;
        }
        flags
    }
}

impl Default for PollingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorBackend for PollingBackend {
    fn is_tight_loop(&self) -> bool {
        true
    }

    fn waker(&self) -> Arc<dyn BackendWaker> {
        self.waker.clone()
    }

    fn register(&mut self, fd: RawFd, token: usize, events: DeviceEvents) -> io::Result<()> {
        if self.position(fd).is_some() {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }

        self.fds.push(pollfd {
            fd,
            events: Self::interest(events),
            revents: 0,
        });
        self.tokens.push(token);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, token: usize, events: DeviceEvents) -> io::Result<()> {
        let i = self
            .position(fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;

        self.fds[i].events = Self::interest(events);
        self.tokens[i] = token;
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let i = self
            .position(fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;

        self.fds.swap_remove(i);
        self.tokens.swap_remove(i);
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<ReadyEvent>, _timeout: Option<Duration>) -> io::Result<()> {
        if self.fds.is_empty() {
            std::hint::spin_loop();
            return Ok(());
        }

        let n = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, 0) };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        if n == 0 {
            return Ok(());
        }

        for (p, &token) in self.fds.iter_mut().zip(&self.tokens) {
            if p.revents == 0 {
                continue;
            }

            let mut ready = DeviceEvents::empty();
            if p.revents & (POLLIN | POLLHUP) != 0 {
                ready |= DeviceEvents::READ;
            }
            if p.revents & POLLOUT != 0 {
                ready |= DeviceEvents::WRITE;
            }
            if p.revents & POLLERR != 0 {
                ready |= DeviceEvents::ERROR;
            }
            p.revents = 0;

            events.push(ReadyEvent {
                token,
                events: ready,
            });
        }

        Ok(())
    }
}
