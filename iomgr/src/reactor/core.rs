use super::backend::{BackendWaker, ReactorBackend, ReadyEvent};
use super::context::{self, ReactorContext};
use super::{ReactorFlags, ReactorInfo, make_backend};
use crate::config::ThreadStateNotifier;
use crate::error::{IomgrError, Result};
use crate::interface::DeviceSelector;
use crate::manager::IoManager;
use crate::msg::Envelope;
use crate::thread::IoThread;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;

use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// The part of a reactor visible to other threads.
///
/// Held by the manager's registry. Everything here is either immutable
/// or atomic; the only way to make the reactor do something is
/// [`send`](Self::send).
pub(crate) struct ReactorShared {
    pub(crate) thread: IoThread,
    pub(crate) flags: ReactorFlags,
    /// Taken when the reactor leaves its loop; sends fail from then on.
    sender: RwLock<Option<Sender<Envelope>>>,
    waker: Arc<dyn BackendWaker>,
    /// Messages queued and not yet taken off the inbox.
    outstanding: AtomicUsize,
    keep_running: AtomicBool,
}

impl std::fmt::Debug for ReactorShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorShared")
            .field("thread", &self.thread)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl ReactorShared {
    pub(crate) fn new(
        thread: IoThread,
        flags: ReactorFlags,
        sender: Sender<Envelope>,
        waker: Arc<dyn BackendWaker>,
    ) -> Self {
        Self {
            thread,
            flags,
            sender: RwLock::new(Some(sender)),
            waker,
            outstanding: AtomicUsize::new(0),
            keep_running: AtomicBool::new(true),
        }
    }

    pub(crate) fn info(&self) -> ReactorInfo {
        ReactorInfo {
            thread: self.thread,
            flags: self.flags,
        }
    }

    /// Queues `env` and wakes the reactor.
    ///
    /// Returns `false` if the reactor already closed its inbox; the
    /// envelope is discarded in that case. An accepted envelope is always
    /// handled before the reactor goes away.
    pub(crate) fn send(&self, env: Envelope) -> bool {
        {
            let sender = self.sender.read();
            let Some(sender) = sender.as_ref() else {
                return false;
            };

            self.outstanding.fetch_add(1, Ordering::Relaxed);
            if sender.send(env).is_err() {
                self.outstanding.fetch_sub(1, Ordering::Relaxed);
                return false;
            }
        }

        self.waker.wake();
        true
    }

    /// Refuses every further send. Sends already accepted stay queued.
    fn close_inbox(&self) {
        self.sender.write().take();
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub(crate) fn wake(&self) {
        self.waker.wake();
    }

    /// Makes the loop exit after the message being handled.
    ///
    /// Only called on the reactor's own thread.
    pub(crate) fn request_stop(&self) {
        self.keep_running.store(false, Ordering::Release);
    }

    pub(crate) fn keep_running(&self) -> bool {
        self.keep_running.load(Ordering::Acquire)
    }
}

/// A reactor that has a slot but is not running yet.
///
/// Built on the thread that asked for it, so backend and capacity
/// failures surface to that caller; then moved to the thread that runs it.
pub(crate) struct Reactor {
    shared: Arc<ReactorShared>,
    inbox: Receiver<Envelope>,
    backend: Box<dyn ReactorBackend>,
    selector: Option<DeviceSelector>,
    notifiers: Vec<ThreadStateNotifier>,
}

impl Reactor {
    pub(crate) fn new(
        iomgr: &IoManager,
        flags: ReactorFlags,
        selector: Option<DeviceSelector>,
        notifiers: Vec<ThreadStateNotifier>,
    ) -> Result<Self> {
        let backend =
            make_backend(flags.contains(ReactorFlags::TIGHT_LOOP)).map_err(IomgrError::Poller)?;
        let (sender, inbox) = crossbeam_channel::unbounded();
        let waker = backend.waker();

        let shared =
            iomgr.make_io_thread(flags, |thread| ReactorShared::new(thread, flags, sender, waker))?;

        Ok(Self {
            shared,
            inbox,
            backend,
            selector,
            notifiers,
        })
    }

    pub(crate) fn thread(&self) -> IoThread {
        self.shared.thread
    }

    /// Runs the event loop on the calling thread until asked to stop.
    pub(crate) fn run(self, iomgr: &Arc<IoManager>) {
        let Reactor {
            shared,
            inbox,
            backend,
            selector,
            notifiers,
        } = self;

        let slot = shared.thread.slot();
        let _span = tracing::debug_span!("reactor", slot).entered();

        let ctx = Rc::new(ReactorContext::new(shared.clone(), backend, selector));
        let started = Cell::new(false);
        let _entered = context::enter(ctx.clone());
        let _exit = Exit {
            ctx: &ctx,
            iomgr,
            notifiers: &notifiers,
            started: &started,
        };

        ctx.sync_interfaces(iomgr.interfaces());
        for dev in iomgr.devices() {
            ctx.adopt(&dev);
        }
        iomgr.reactor_started(&shared, &notifiers);
        started.set(true);

        let mut ready = Vec::new();
        while shared.keep_running() {
            if let Err(err) = turn(&ctx, &inbox, iomgr, &mut ready) {
                tracing::error!(error = %err, "reactor backend failed, leaving loop");
                break;
            }
        }

        // Whatever was accepted before closing still runs here.
        shared.close_inbox();
        while let Ok(env) = inbox.try_recv() {
            handle(&shared, iomgr, env);
        }
    }
}

/// Tears the reactor down when its loop ends, including by a panicking
/// handler.
struct Exit<'a> {
    ctx: &'a ReactorContext,
    iomgr: &'a IoManager,
    notifiers: &'a [ThreadStateNotifier],
    /// Whether the manager was told the reactor is up.
    started: &'a Cell<bool>,
}

impl Drop for Exit<'_> {
    fn drop(&mut self) {
        self.ctx.shared.close_inbox();
        self.ctx.stop_interfaces();
        self.ctx.release_devices();
        self.iomgr
            .reactor_stopped(&self.ctx.shared, self.notifiers, self.started.get());
    }
}

/// Runs one inbox envelope and settles its ticket.
fn handle(shared: &ReactorShared, iomgr: &IoManager, env: Envelope) {
    let Envelope { msg, ticket } = env;
    shared.outstanding.fetch_sub(1, Ordering::Relaxed);

    let handled = iomgr.dispatch(&msg);
    // An unhandled ticket just drops, releasing the sender uncounted.
    if let Some(ticket) = ticket.filter(|_| handled) {
        ticket.executed();
    }
}

/// One loop iteration: inbox, timers, then device readiness.
fn turn(
    ctx: &ReactorContext,
    inbox: &Receiver<Envelope>,
    iomgr: &IoManager,
    ready: &mut Vec<ReadyEvent>,
) -> io::Result<()> {
    for _ in 0..iomgr.config().inbox_batch {
        if !ctx.shared.keep_running() {
            return Ok(());
        }

        let Ok(env) = inbox.try_recv() else {
            break;
        };
        handle(&ctx.shared, iomgr, env);
    }

    if !ctx.shared.keep_running() {
        return Ok(());
    }

    let now = Instant::now();
    ctx.fire_timers(now);
    iomgr.fire_global_timers(now);

    let timeout = if ctx.is_tight_loop() || !inbox.is_empty() {
        Duration::ZERO
    } else {
        let now = Instant::now();
        [ctx.next_timer_deadline(), iomgr.next_global_deadline()]
            .into_iter()
            .flatten()
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(iomgr.config().poll_interval, Duration::min)
    };

    ctx.poll(ready, timeout)?;
    for ev in ready.drain(..) {
        ctx.fire_device(ev);
    }

    Ok(())
}
