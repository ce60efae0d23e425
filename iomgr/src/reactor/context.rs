use super::ReactorInfo;
use super::backend::{ReactorBackend, ReadyEvent};
use super::core::ReactorShared;
use crate::error::{IomgrError, Result};
use crate::interface::{BackingDev, DeviceEvents, DeviceSelector, IoDevice, IoInterface};
use crate::thread::ThreadSelector;
use crate::timer::ThreadTimer;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

thread_local! {
    /// Reactor running on this thread, if any.
    ///
    /// Installed by the reactor loop for its whole lifetime. Role
    /// predicates, thread timers and device bookkeeping all go through it.
    static CURRENT: RefCell<Option<Rc<ReactorContext>>> = const { RefCell::new(None) };
}

/// Runs `f` against the calling thread's reactor.
///
/// Returns `None` when the calling thread is not a reactor. The context is
/// cloned out of the slot first, so `f` may itself call back into
/// `with_current`.
pub(crate) fn with_current<R>(f: impl FnOnce(&ReactorContext) -> R) -> Option<R> {
    let ctx = CURRENT.with(|c| c.borrow().clone())?;
    Some(f(&ctx))
}

/// Installs `ctx` as the calling thread's reactor until the guard drops.
pub(crate) fn enter(ctx: Rc<ReactorContext>) -> Entered {
    let prev = CURRENT.with(|c| c.replace(Some(ctx)));
    Entered { prev }
}

pub(crate) struct Entered {
    prev: Option<Rc<ReactorContext>>,
}

impl Drop for Entered {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| {
            c.replace(prev);
        });
    }
}

/// Backend and the devices registered in it.
struct ReactorIo {
    backend: Box<dyn ReactorBackend>,
    devices: HashMap<usize, Arc<IoDevice>>,
    tokens: HashMap<BackingDev, usize>,
    next_token: usize,
}

/// State private to one reactor thread.
///
/// Never shared: other threads reach a reactor only through its inbox.
/// Borrows of the inner cells are kept short and are never held while a
/// user callback runs, so callbacks are free to schedule timers or
/// register devices on the same reactor.
pub(crate) struct ReactorContext {
    pub(crate) shared: Arc<ReactorShared>,
    io: RefCell<ReactorIo>,
    timer: RefCell<ThreadTimer>,
    selector: Option<DeviceSelector>,
    /// Interfaces whose `on_reactor_start` already ran here, in
    /// registration order.
    hooked: RefCell<Vec<Arc<dyn IoInterface>>>,
}

impl ReactorContext {
    pub(crate) fn new(
        shared: Arc<ReactorShared>,
        backend: Box<dyn ReactorBackend>,
        selector: Option<DeviceSelector>,
    ) -> Self {
        Self {
            shared,
            io: RefCell::new(ReactorIo {
                backend,
                devices: HashMap::new(),
                tokens: HashMap::new(),
                next_token: 0,
            }),
            timer: RefCell::new(ThreadTimer::new()),
            selector,
            hooked: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn info(&self) -> ReactorInfo {
        self.shared.info()
    }

    pub(crate) fn is_tight_loop(&self) -> bool {
        self.io.borrow().backend.is_tight_loop()
    }

    pub(crate) fn timer(&self) -> &RefCell<ThreadTimer> {
        &self.timer
    }

    /// Runs `on_reactor_start` for every interface of `all` this reactor
    /// has not seen yet.
    ///
    /// Interfaces are only ever appended while reactors run, so the
    /// already-hooked ones are a prefix of `all`.
    pub(crate) fn sync_interfaces(&self, all: Vec<Arc<dyn IoInterface>>) {
        let info = self.info();
        let seen = self.hooked.borrow().len();

        for iface in all.into_iter().skip(seen) {
            tracing::debug!(slot = info.thread.slot(), interface = iface.name(), "interface attached");
            iface.on_reactor_start(&info);
            self.hooked.borrow_mut().push(iface);
        }
    }

    /// Runs `on_reactor_stop` for every hooked interface, latest first.
    pub(crate) fn stop_interfaces(&self) {
        let info = self.info();
        let hooked = self.hooked.take();

        for iface in hooked.iter().rev() {
            iface.on_reactor_stop(&info);
        }
    }

    /// Adopts `dev` if its scope and this reactor's device selector admit it.
    ///
    /// Used when a reactor comes up and picks devices already registered
    /// with the manager. Single-choice scopes go to the first reactor
    /// claiming them.
    pub(crate) fn adopt(&self, dev: &Arc<IoDevice>) {
        let info = self.info();

        let (admitted, claimed) = match dev.scope() {
            ThreadSelector::Thread(t) => (t == info.thread, false),
            ThreadSelector::Regex(rx) if !rx.admits(info.flags) => (false, false),
            ThreadSelector::Regex(rx) if rx.is_broadcast() => (true, false),
            ThreadSelector::Regex(_) => {
                let unowned = dev.owners().is_empty();
                (dev.try_claim(info.thread), unowned)
            }
        };

        if !admitted {
            return;
        }

        match self.add_device(dev) {
            Ok(true) => {}
            Ok(false) => {
                if claimed {
                    dev.remove_owner(info.thread);
                }
            }
            Err(err) => {
                if claimed {
                    dev.remove_owner(info.thread);
                }
                tracing::warn!(slot = info.thread.slot(), device = ?dev.backing_dev(), error = %err, "failed to adopt device");
            }
        }
    }

    /// Registers `dev` with this reactor's backend.
    ///
    /// Returns `false` when the reactor's device selector rejects it.
    /// Adding a device the reactor already owns is a no-op.
    pub(crate) fn add_device(&self, dev: &Arc<IoDevice>) -> Result<bool> {
        if let Some(select) = &self.selector {
            if !select(dev.as_ref()) {
                return Ok(false);
            }
        }

        let backing = dev.backing_dev();
        {
            let mut io = self.io.borrow_mut();
            if io.tokens.contains_key(&backing) {
                return Ok(true);
            }

            let token = io.next_token;
            if let BackingDev::Fd(fd) = backing {
                io.backend
                    .register(fd, token, dev.events())
                    .map_err(IomgrError::Poller)?;
            }

            io.next_token += 1;
            io.tokens.insert(backing, token);
            io.devices.insert(token, dev.clone());
        }

        let info = self.info();
        dev.add_owner(info.thread);
        if let Some(iface) = dev.interface() {
            iface.on_device_added(dev, &info);
        }

        tracing::debug!(slot = info.thread.slot(), device = ?backing, "device added");
        Ok(true)
    }

    /// Drops `dev` from this reactor. Returns `false` if it was not owned here.
    pub(crate) fn remove_device(&self, dev: &IoDevice) -> bool {
        let backing = dev.backing_dev();
        {
            let mut io = self.io.borrow_mut();
            let Some(token) = io.tokens.remove(&backing) else {
                return false;
            };
            io.devices.remove(&token);

            if let BackingDev::Fd(fd) = backing {
                if let Err(err) = io.backend.deregister(fd) {
                    tracing::debug!(fd, error = %err, "deregister failed");
                }
            }
        }

        let info = self.info();
        dev.remove_owner(info.thread);
        if let Some(iface) = dev.interface() {
            iface.on_device_removed(dev, &info);
        }

        tracing::debug!(slot = info.thread.slot(), device = ?backing, "device removed");
        true
    }

    pub(crate) fn release_devices(&self) {
        let owned: Vec<Arc<IoDevice>> = self.io.borrow().devices.values().cloned().collect();

        for dev in owned {
            self.remove_device(&dev);
        }
    }

    /// Re-arms the event interest of an owned device.
    pub(crate) fn reschedule(&self, dev: &IoDevice, events: DeviceEvents) -> io::Result<()> {
        dev.set_events(events);

        let backing = dev.backing_dev();
        let mut io = self.io.borrow_mut();
        let Some(&token) = io.tokens.get(&backing) else {
            tracing::debug!(slot = self.shared.thread.slot(), device = ?backing, "reschedule of a device not owned here");
            return Ok(());
        };

        match backing {
            BackingDev::Fd(fd) => io.backend.reregister(fd, token, events),
            BackingDev::Id(_) => Ok(()),
        }
    }

    pub(crate) fn poll(&self, ready: &mut Vec<ReadyEvent>, timeout: Duration) -> io::Result<()> {
        self.io.borrow_mut().backend.poll(ready, Some(timeout))
    }

    pub(crate) fn fire_device(&self, ev: ReadyEvent) {
        let dev = self.io.borrow().devices.get(&ev.token).cloned();

        if let Some(dev) = dev {
            dev.fire(ev.events);
        }
    }

    /// Fires every local timer due at `now`.
    pub(crate) fn fire_timers(&self, now: Instant) {
        loop {
            let due = self.timer.borrow_mut().pop_due(now);
            let Some(mut entry) = due else {
                break;
            };

            entry.fire();
            self.timer.borrow_mut().rearm(entry, now);
        }
    }

    pub(crate) fn next_timer_deadline(&self) -> Option<Instant> {
        self.timer.borrow_mut().next_deadline()
    }
}
